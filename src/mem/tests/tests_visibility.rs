#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use crate::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
    use crate::mem::VyMem;
    use crate::msgpack;
    use crate::stmt::Statement;

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

    fn replace(key: u64, value: u64, lsn: i64) -> Arc<Statement> {
        let stmt = Statement::new_replace(&tuple_u(&[key, value]));
        stmt.set_lsn(lsn);
        stmt
    }

    #[test]
    fn newest_visible_respects_vlsn() {
        let mem = VyMem::new(key_def());
        mem.insert(replace(1, 100, 10)).unwrap();
        mem.insert(replace(1, 200, 20)).unwrap();
        mem.insert(replace(1, 300, 30)).unwrap();

        let key = tuple_u(&[1]);
        assert_eq!(mem.newest_visible(&key, i64::MAX).unwrap().unwrap().lsn(), 30);
        assert_eq!(mem.newest_visible(&key, 25).unwrap().unwrap().lsn(), 20);
        assert_eq!(mem.newest_visible(&key, 10).unwrap().unwrap().lsn(), 10);
        assert!(mem.newest_visible(&key, 9).unwrap().is_none());
        assert!(mem.newest_visible(&tuple_u(&[2]), i64::MAX).unwrap().is_none());
    }

    #[test]
    fn older_lsn_walks_version_chain() {
        let mem = VyMem::new(key_def());
        mem.insert(replace(1, 100, 10)).unwrap();
        mem.insert(replace(1, 200, 20)).unwrap();
        mem.insert(replace(2, 0, 15)).unwrap();

        let newest = mem.newest_visible(&tuple_u(&[1]), i64::MAX).unwrap().unwrap();
        assert_eq!(newest.lsn(), 20);

        let older = mem.older_lsn(&newest).unwrap().unwrap();
        assert_eq!(older.lsn(), 10);
        assert!(mem.older_lsn(&older).unwrap().is_none());
    }

    #[test]
    fn older_lsn_does_not_cross_keys() {
        let mem = VyMem::new(key_def());
        mem.insert(replace(1, 0, 20)).unwrap();
        mem.insert(replace(2, 0, 10)).unwrap();

        let newest = mem.newest_visible(&tuple_u(&[1]), i64::MAX).unwrap().unwrap();
        assert!(mem.older_lsn(&newest).unwrap().is_none());
    }

    #[test]
    fn delete_statements_participate_in_ordering() {
        let mem = VyMem::new(key_def());
        mem.insert(replace(1, 0, 10)).unwrap();
        let del = Statement::new_delete(&tuple_u(&[1]));
        del.set_lsn(20);
        mem.insert(del).unwrap();

        let newest = mem.newest_visible(&tuple_u(&[1]), i64::MAX).unwrap().unwrap();
        assert_eq!(newest.stmt_type(), crate::stmt::StmtType::Delete);
        assert_eq!(mem.older_lsn(&newest).unwrap().unwrap().lsn(), 10);
    }
}
