#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::TempDir;
    use uuid::Uuid;

    use crate::iterator::tests::helpers::*;
    use crate::iterator::{IteratorType, ReadIterator};
    use crate::range::LsmIndex;

    fn open_index(tmp: &TempDir) -> Arc<LsmIndex> {
        LsmIndex::open(tmp.path(), 512, 0, key_def(), Uuid::new_v4()).unwrap()
    }

    fn drain(iter: &mut ReadIterator) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        while let Some(stmt) = iter.next().unwrap() {
            out.push(fields2(&stmt));
        }
        out
    }

    #[test]
    fn select_sees_newest_versions_and_hides_deletes() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp);
        index.set(replace(1, 10, 1)).unwrap();
        index.set(replace(2, 20, 2)).unwrap();
        index.set(replace(1, 11, 3)).unwrap();
        index.set(delete(2, 4)).unwrap();
        index.set(replace(3, 30, 5)).unwrap();

        let mut iter = ReadIterator::new(index, IteratorType::Ge, &[], i64::MAX, None);
        assert_eq!(drain(&mut iter), vec![(1, 11), (3, 30)]);
    }

    #[test]
    fn read_view_sees_the_past() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp);
        index.set(replace(1, 100, 10)).unwrap();
        index.set(replace(1, 200, 20)).unwrap();

        let mut old = ReadIterator::new(Arc::clone(&index), IteratorType::Ge, &[], 15, None);
        assert_eq!(drain(&mut old), vec![(1, 100)]);

        let mut new = ReadIterator::new(index, IteratorType::Ge, &[], i64::MAX, None);
        assert_eq!(drain(&mut new), vec![(1, 200)]);
    }

    #[test]
    fn upsert_chains_materialize_on_read() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp);
        index.set(replace(1, 100, 1)).unwrap();
        // Frozen history forces the upserts to stack instead of
        // materializing on write.
        index.ranges()[0].freeze_mem().unwrap();
        index.set(upsert(1, 0, 5, 2)).unwrap();
        index.set(upsert(1, 0, 7, 3)).unwrap();

        let mut iter = ReadIterator::new(index, IteratorType::Eq, &tuple_u(&[1]), i64::MAX, None);
        let stmt = iter.next().unwrap().unwrap();
        assert_eq!(fields2(&stmt), (1, 112));
        assert!(iter.next().unwrap().is_none());
    }

    #[test]
    fn upsert_without_base_uses_fallback_tuple() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp);
        // No history: the upsert materializes from its fallback tuple.
        index.set(upsert(9, 42, 1, 1)).unwrap();

        let mut iter = ReadIterator::new(index, IteratorType::Eq, &tuple_u(&[9]), i64::MAX, None);
        let stmt = iter.next().unwrap().unwrap();
        assert_eq!(fields2(&stmt), (9, 42));
    }

    #[test]
    fn reverse_iteration() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp);
        for k in [1u64, 2, 3] {
            index.set(replace(k, k, k as i64)).unwrap();
        }
        let mut iter = ReadIterator::new(index, IteratorType::Le, &[], i64::MAX, None);
        assert_eq!(drain(&mut iter), vec![(3, 3), (2, 2), (1, 1)]);
    }

    #[test]
    fn iteration_spans_split_ranges() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp);
        let old = index.ranges()[0].clone();
        let left = crate::range::VyRange::new(
            index.alloc_range_id(),
            None,
            Some(tuple_u(&[10])),
            key_def(),
        );
        let right = crate::range::VyRange::new(
            index.alloc_range_id(),
            Some(tuple_u(&[10])),
            None,
            key_def(),
        );
        index.replace_range(&old, vec![left, right]).unwrap();

        for k in [1u64, 9, 10, 15] {
            index.set(replace(k, k, k as i64 + 1)).unwrap();
        }

        let mut fwd = ReadIterator::new(Arc::clone(&index), IteratorType::Ge, &[], i64::MAX, None);
        assert_eq!(drain(&mut fwd), vec![(1, 1), (9, 9), (10, 10), (15, 15)]);

        let mut rev = ReadIterator::new(index, IteratorType::Le, &[], i64::MAX, None);
        assert_eq!(drain(&mut rev), vec![(15, 15), (10, 10), (9, 9), (1, 1)]);
    }

    #[test]
    fn eq_returns_single_key_only() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp);
        index.set(replace(1, 1, 1)).unwrap();
        index.set(replace(2, 2, 2)).unwrap();

        let mut iter = ReadIterator::new(index, IteratorType::Eq, &tuple_u(&[1]), i64::MAX, None);
        assert_eq!(drain(&mut iter), vec![(1, 1)]);
    }

    #[test]
    fn commits_between_calls_are_visible_in_later_keys() {
        let tmp = TempDir::new().unwrap();
        let index = open_index(&tmp);
        index.set(replace(1, 1, 1)).unwrap();
        index.set(replace(5, 5, 2)).unwrap();

        let mut iter =
            ReadIterator::new(Arc::clone(&index), IteratorType::Ge, &[], i64::MAX, None);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(fields2(&first), (1, 1));

        // A commit lands between next() calls, ahead of the cursor.
        index.set(replace(3, 3, 3)).unwrap();

        assert_eq!(fields2(&iter.next().unwrap().unwrap()), (3, 3));
        assert_eq!(fields2(&iter.next().unwrap().unwrap()), (5, 5));
    }
}
