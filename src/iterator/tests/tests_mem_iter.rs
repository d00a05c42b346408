#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::iterator::tests::helpers::*;
    use crate::iterator::{IteratorType, MemIterator, RestoreResult, StmtIterator};
    use crate::mem::VyMem;

    fn mem_with(keys: &[(u64, i64)]) -> Arc<VyMem> {
        let mem = VyMem::new(key_def());
        for (k, lsn) in keys {
            mem.insert(replace(*k, 0, *lsn)).unwrap();
        }
        mem
    }

    fn drain_keys(iter: &mut MemIterator) -> Vec<u64> {
        let mut out = Vec::new();
        while let Some(stmt) = iter.next_key().unwrap() {
            out.push(field0(&stmt));
        }
        out
    }

    #[test]
    fn ge_iterates_forward_from_key() {
        let mem = mem_with(&[(1, 1), (2, 2), (3, 3), (4, 4)]);
        let mut iter =
            MemIterator::new(mem, IteratorType::Ge, &tuple_u(&[2]), i64::MAX).unwrap();
        assert_eq!(drain_keys(&mut iter), vec![2, 3, 4]);
    }

    #[test]
    fn gt_skips_the_equal_key() {
        let mem = mem_with(&[(1, 1), (2, 2), (3, 3)]);
        let mut iter =
            MemIterator::new(mem, IteratorType::Gt, &tuple_u(&[2]), i64::MAX).unwrap();
        assert_eq!(drain_keys(&mut iter), vec![3]);
    }

    #[test]
    fn le_and_lt_iterate_backwards() {
        let mem = mem_with(&[(1, 1), (2, 2), (3, 3)]);
        let mut le =
            MemIterator::new(Arc::clone(&mem_with(&[(1, 1), (2, 2), (3, 3)])), IteratorType::Le, &tuple_u(&[2]), i64::MAX).unwrap();
        assert_eq!(drain_keys(&mut le), vec![2, 1]);

        let mut lt = MemIterator::new(mem, IteratorType::Lt, &tuple_u(&[2]), i64::MAX).unwrap();
        assert_eq!(drain_keys(&mut lt), vec![1]);
    }

    #[test]
    fn empty_key_means_infinity_for_both_directions() {
        let mem = mem_with(&[(1, 1), (2, 2)]);
        let mut ge = MemIterator::new(Arc::clone(&mem), IteratorType::Ge, &[], i64::MAX).unwrap();
        assert_eq!(drain_keys(&mut ge), vec![1, 2]);

        let mut le = MemIterator::new(mem, IteratorType::Le, &[], i64::MAX).unwrap();
        assert_eq!(drain_keys(&mut le), vec![2, 1]);
    }

    #[test]
    fn eq_returns_only_the_key() {
        let mem = mem_with(&[(1, 1), (2, 2), (3, 3)]);
        let mut eq =
            MemIterator::new(Arc::clone(&mem), IteratorType::Eq, &tuple_u(&[2]), i64::MAX).unwrap();
        assert_eq!(drain_keys(&mut eq), vec![2]);

        let mut miss =
            MemIterator::new(mem, IteratorType::Eq, &tuple_u(&[9]), i64::MAX).unwrap();
        assert_eq!(drain_keys(&mut miss), Vec::<u64>::new());
    }

    #[test]
    fn vlsn_hides_newer_versions_and_next_lsn_walks_older() {
        let mem = VyMem::new(key_def());
        mem.insert(replace(1, 100, 10)).unwrap();
        mem.insert(replace(1, 200, 20)).unwrap();
        mem.insert(replace(1, 300, 30)).unwrap();

        let mut iter =
            MemIterator::new(Arc::clone(&mem), IteratorType::Eq, &tuple_u(&[1]), 20).unwrap();
        let newest = iter.next_key().unwrap().unwrap();
        assert_eq!(newest.lsn(), 20);
        let older = iter.next_lsn().unwrap().unwrap();
        assert_eq!(older.lsn(), 10);
        assert!(iter.next_lsn().unwrap().is_none());

        // A key whose versions are all newer than the vlsn is skipped.
        let mut hidden =
            MemIterator::new(mem, IteratorType::Eq, &tuple_u(&[1]), 5).unwrap();
        assert!(hidden.next_key().unwrap().is_none());
    }

    #[test]
    fn restore_picks_up_concurrent_inserts_past_position() {
        let mem = mem_with(&[(1, 1), (5, 5)]);
        let mut iter = MemIterator::new(Arc::clone(&mem), IteratorType::Ge, &[], i64::MAX).unwrap();
        let first = iter.next_key().unwrap().unwrap();
        assert_eq!(field0(&first), 1);

        assert_eq!(
            iter.restore(Some(&first)).unwrap(),
            RestoreResult::Unchanged
        );

        // Insert behind and ahead of the position.
        mem.insert(replace(0, 0, 7)).unwrap();
        mem.insert(replace(3, 0, 8)).unwrap();
        assert_eq!(iter.restore(Some(&first)).unwrap(), RestoreResult::Changed);

        // Key 0 is behind the position; 3 and 5 are ahead.
        assert_eq!(drain_keys(&mut iter), vec![3, 5]);
    }
}
