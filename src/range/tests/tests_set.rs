#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
    use crate::msgpack;
    use crate::range::{UpsertOutcome, VyRange};
    use crate::stmt::{Statement, StmtType, UPSERT_PENDING, UPSERT_THRESHOLD};

    fn key_def() -> Arc<KeyDef> {
        Arc::new(KeyDef::new(
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            }],
            KeyDefOpts::default(),
        ))
    }

    fn tuple_u(values: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        msgpack::write_array_len(&mut buf, values.len() as u32);
        for v in values {
            msgpack::write_uint(&mut buf, *v);
        }
        buf
    }

    fn full_range() -> Arc<VyRange> {
        VyRange::new(1, None, None, key_def())
    }

    fn replace(key: u64, value: u64, lsn: i64) -> Arc<Statement> {
        let stmt = Statement::new_replace(&tuple_u(&[key, value]));
        stmt.set_lsn(lsn);
        stmt
    }

    fn upsert(key: u64, add: i64, lsn: i64) -> Arc<Statement> {
        let mut ops = Vec::new();
        msgpack::write_array_len(&mut ops, 1);
        msgpack::write_array_len(&mut ops, 3);
        msgpack::write_str(&mut ops, "+");
        msgpack::write_int(&mut ops, 2);
        msgpack::write_int(&mut ops, add);
        let stmt = Statement::new_upsert(&tuple_u(&[key, 0]), &ops);
        stmt.set_lsn(lsn);
        stmt
    }

    #[test]
    fn delete_of_unknown_key_is_dropped_without_history() {
        let range = full_range();
        let del = Statement::new_delete(&tuple_u(&[1]));
        del.set_lsn(5);
        range.set_delete(del).unwrap();
        assert!(range.active_mem().unwrap().is_empty());
    }

    #[test]
    fn delete_of_resident_key_is_kept() {
        let range = full_range();
        range.set(replace(1, 0, 4)).unwrap();
        let del = Statement::new_delete(&tuple_u(&[1]));
        del.set_lsn(5);
        range.set_delete(del).unwrap();
        assert_eq!(range.active_mem().unwrap().len(), 2);
    }

    #[test]
    fn delete_is_kept_when_frozen_history_exists() {
        let range = full_range();
        range.set(replace(1, 0, 4)).unwrap();
        range.freeze_mem().unwrap();

        let del = Statement::new_delete(&tuple_u(&[2]));
        del.set_lsn(5);
        range.set_delete(del).unwrap();
        assert_eq!(range.active_mem().unwrap().len(), 1);
    }

    #[test]
    fn upsert_with_no_history_materializes_replace() {
        let range = full_range();
        assert_eq!(
            range.set_upsert(upsert(1, 5, 10)).unwrap(),
            UpsertOutcome::Done
        );
        let mem = range.active_mem().unwrap();
        let newest = mem.newest_visible(&tuple_u(&[1]), i64::MAX).unwrap().unwrap();
        assert_eq!(newest.stmt_type(), StmtType::Replace);
    }

    #[test]
    fn upsert_over_replace_materializes_in_mem() {
        let range = full_range();
        range.set(replace(1, 10, 5)).unwrap();
        range.set_upsert(upsert(1, 3, 6)).unwrap();

        let mem = range.active_mem().unwrap();
        let newest = mem.newest_visible(&tuple_u(&[1]), i64::MAX).unwrap().unwrap();
        assert_eq!(newest.stmt_type(), StmtType::Replace);
        let (_, pos) = msgpack::read_array_len(newest.data()).unwrap();
        let n = msgpack::skip_value(&newest.data()[pos..]).unwrap();
        let (v, _) = msgpack::read_uint(&newest.data()[pos + n..]).unwrap();
        assert_eq!(v, 13);
    }

    #[test]
    fn stacked_upserts_cross_squash_threshold() {
        let range = full_range();
        range.set(replace(1, 0, 1)).unwrap();
        range.freeze_mem().unwrap();

        // With frozen history the upserts stack instead of materializing.
        let mut squash_requested = false;
        for i in 0..(UPSERT_THRESHOLD as i64 + 8) {
            match range.set_upsert(upsert(1, 1, 10 + i)).unwrap() {
                UpsertOutcome::Done => {}
                UpsertOutcome::NeedsSquash(key) => {
                    assert_eq!(key, tuple_u(&[1]));
                    squash_requested = true;
                }
            }
        }
        assert!(squash_requested, "threshold never crossed");

        // Counter stays pending until the squash worker materializes.
        let mem = range.active_mem().unwrap();
        let newest = mem.newest_visible(&tuple_u(&[1]), i64::MAX).unwrap().unwrap();
        assert_eq!(newest.n_upserts(), UPSERT_PENDING);
    }

    #[test]
    fn freeze_mem_swaps_in_fresh_active() {
        let range = full_range();
        assert!(!range.freeze_mem().unwrap(), "empty mem must not freeze");

        range.set(replace(1, 0, 1)).unwrap();
        let v0 = range.version();
        assert!(range.freeze_mem().unwrap());
        assert!(range.version() > v0);
        assert!(range.active_mem().unwrap().is_empty());
        assert_eq!(range.frozen_mems().unwrap().len(), 1);
        assert_eq!(range.mem_min_lsn(), 1);
    }

    #[test]
    fn busy_flags_are_exclusive() {
        let range = full_range();
        assert!(range.begin_dump().unwrap());
        assert!(!range.begin_dump().unwrap());
        assert!(!range.begin_compact().unwrap());
        range.abort_dump().unwrap();
        assert!(range.begin_compact().unwrap());
    }
}
