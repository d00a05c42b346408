#[cfg(test)]
mod tests {
    use crate::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
    use crate::msgpack;
    use crate::stmt::{
        apply_upsert, concat_op_sequences, squash_op_sequences, Statement, StmtType,
    };

    fn key_def() -> KeyDef {
        KeyDef::new(
            vec![KeyPart {
                field_no: 0,
                field_type: FieldType::Unsigned,
            }],
            KeyDefOpts::default(),
        )
    }

    fn tuple_u(values: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        msgpack::write_array_len(&mut buf, values.len() as u32);
        for v in values {
            msgpack::write_uint(&mut buf, *v);
        }
        buf
    }

    fn ops(list: &[(&str, i64, i64)]) -> Vec<u8> {
        let mut buf = Vec::new();
        msgpack::write_array_len(&mut buf, list.len() as u32);
        for (op, field, arg) in list {
            msgpack::write_array_len(&mut buf, 3);
            msgpack::write_str(&mut buf, op);
            msgpack::write_int(&mut buf, *field);
            msgpack::write_int(&mut buf, *arg);
        }
        buf
    }

    fn decode(tuple: &[u8]) -> Vec<i64> {
        let (count, mut pos) = msgpack::read_array_len(tuple).unwrap();
        (0..count)
            .map(|_| {
                let (v, n) = msgpack::read_int(&tuple[pos..]).unwrap();
                pos += n;
                v
            })
            .collect()
    }

    #[test]
    fn upsert_over_nothing_materializes_fallback() {
        let def = key_def();
        let upsert = Statement::new_upsert(&tuple_u(&[1, 0]), &ops(&[("+", 2, 1)]));
        upsert.set_lsn(10);
        let result = apply_upsert(&upsert, None, &def, false).unwrap();
        assert_eq!(result.stmt_type(), StmtType::Replace);
        assert_eq!(decode(result.data()), vec![1, 0]);
        assert_eq!(result.lsn(), 10);
    }

    #[test]
    fn upsert_over_delete_materializes_fallback() {
        let def = key_def();
        let upsert = Statement::new_upsert(&tuple_u(&[1, 7]), &ops(&[("+", 2, 1)]));
        upsert.set_lsn(11);
        let delete = Statement::new_delete(&tuple_u(&[1]));
        let result = apply_upsert(&upsert, Some(&delete), &def, false).unwrap();
        assert_eq!(result.stmt_type(), StmtType::Replace);
        assert_eq!(decode(result.data()), vec![1, 7]);
    }

    #[test]
    fn upsert_over_replace_applies_ops() {
        let def = key_def();
        let older = Statement::new_replace(&tuple_u(&[1, 10]));
        older.set_lsn(5);
        let upsert = Statement::new_upsert(&tuple_u(&[1, 0]), &ops(&[("+", 2, 3)]));
        upsert.set_lsn(12);
        let result = apply_upsert(&upsert, Some(&older), &def, false).unwrap();
        assert_eq!(result.stmt_type(), StmtType::Replace);
        assert_eq!(decode(result.data()), vec![1, 13]);
        assert_eq!(result.lsn(), 12);
    }

    #[test]
    fn primary_key_modification_is_discarded() {
        let def = key_def();
        let older = Statement::new_replace(&tuple_u(&[1, 10]));
        let upsert = Statement::new_upsert(&tuple_u(&[1, 0]), &ops(&[("=", 1, 99)]));
        upsert.set_lsn(13);
        let result = apply_upsert(&upsert, Some(&older), &def, false).unwrap();
        // Older tuple carried forward with the new LSN.
        assert_eq!(decode(result.data()), vec![1, 10]);
        assert_eq!(result.lsn(), 13);
    }

    #[test]
    fn upsert_over_upsert_squashes_arithmetic() {
        let def = key_def();
        let older = Statement::new_upsert(&tuple_u(&[1, 0]), &ops(&[("+", 2, 1)]));
        older.set_lsn(5);
        let newer = Statement::new_upsert(&tuple_u(&[1, 0]), &ops(&[("+", 2, 2)]));
        newer.set_lsn(6);
        let result = apply_upsert(&newer, Some(&older), &def, false).unwrap();
        assert_eq!(result.stmt_type(), StmtType::Upsert);
        assert_eq!(result.lsn(), 6);

        // Applying the combined upsert over a REPLACE adds 3 in one step.
        let base = Statement::new_replace(&tuple_u(&[1, 10]));
        let materialized = apply_upsert(&result, Some(&base), &def, false).unwrap();
        assert_eq!(decode(materialized.data()), vec![1, 13]);
    }

    #[test]
    fn unsquashable_sequences_concatenate() {
        let old = ops(&[("!", 2, 7)]);
        let new = ops(&[("+", 2, 1)]);
        assert!(squash_op_sequences(&old, &new).unwrap().is_none());

        let combined = concat_op_sequences(&old, &new).unwrap();
        let (count, _) = msgpack::read_array_len(&combined).unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn squash_assign_then_add() {
        let old = ops(&[("=", 2, 10)]);
        let new = ops(&[("+", 2, 5)]);
        let squashed = squash_op_sequences(&old, &new).unwrap().unwrap();
        // One op remains: "=" 15.
        let (count, _) = msgpack::read_array_len(&squashed).unwrap();
        assert_eq!(count, 1);

        let base = tuple_u(&[1, 0]);
        let result =
            crate::stmt::update::apply_update_ops(&base, &squashed, 1, false).unwrap();
        assert_eq!(decode(&result), vec![1, 15]);
    }

    #[test]
    fn squash_disjoint_fields_unions() {
        let old = ops(&[("+", 2, 1)]);
        let new = ops(&[("+", 3, 2)]);
        let squashed = squash_op_sequences(&old, &new).unwrap().unwrap();
        let (count, _) = msgpack::read_array_len(&squashed).unwrap();
        assert_eq!(count, 2);
    }
}
