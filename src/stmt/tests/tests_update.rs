#[cfg(test)]
mod tests {
    use crate::msgpack;
    use crate::stmt::update::apply_update_ops;
    use crate::stmt::StmtError;

    fn tuple_u(values: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        msgpack::write_array_len(&mut buf, values.len() as u32);
        for v in values {
            msgpack::write_uint(&mut buf, *v);
        }
        buf
    }

    /// Builds `[[op, field, arg_uint]]`-style payloads.
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
    fn assign_add_subtract() {
        let tuple = tuple_u(&[1, 2, 3]);
        let result =
            apply_update_ops(&tuple, &ops(&[("=", 2, 20), ("+", 3, 5), ("-", 1, 1)]), 1, false)
                .unwrap();
        assert_eq!(decode(&result), vec![0, 20, 8]);
    }

    #[test]
    fn insert_and_delete_fields() {
        let tuple = tuple_u(&[1, 2, 3]);
        let result = apply_update_ops(&tuple, &ops(&[("!", 2, 99)]), 1, false).unwrap();
        assert_eq!(decode(&result), vec![1, 99, 2, 3]);

        let result = apply_update_ops(&tuple, &ops(&[("#", 2, 2)]), 1, false).unwrap();
        assert_eq!(decode(&result), vec![1]);
    }

    #[test]
    fn append_via_insert_past_end() {
        let tuple = tuple_u(&[1]);
        let result = apply_update_ops(&tuple, &ops(&[("!", 2, 7)]), 1, false).unwrap();
        assert_eq!(decode(&result), vec![1, 7]);
    }

    #[test]
    fn negative_field_addresses_from_end() {
        let tuple = tuple_u(&[10, 20, 30]);
        let result = apply_update_ops(&tuple, &ops(&[("+", -1, 1)]), 1, false).unwrap();
        assert_eq!(decode(&result), vec![10, 20, 31]);
    }

    #[test]
    fn subtraction_below_zero_turns_signed() {
        let tuple = tuple_u(&[3]);
        let result = apply_update_ops(&tuple, &ops(&[("-", 1, 10)]), 1, false).unwrap();
        assert_eq!(decode(&result), vec![-7]);
    }

    #[test]
    fn bitwise_requires_unsigned() {
        let tuple = tuple_u(&[0b1100]);
        let mut payload = Vec::new();
        msgpack::write_array_len(&mut payload, 1);
        msgpack::write_array_len(&mut payload, 3);
        msgpack::write_str(&mut payload, "&");
        msgpack::write_int(&mut payload, 1);
        msgpack::write_uint(&mut payload, 0b1010);
        let result = apply_update_ops(&tuple, &payload, 1, false).unwrap();
        assert_eq!(decode(&result), vec![0b1000]);

        let mut tuple_str = Vec::new();
        msgpack::write_array_len(&mut tuple_str, 1);
        msgpack::write_str(&mut tuple_str, "x");
        assert!(matches!(
            apply_update_ops(&tuple_str, &payload, 1, false),
            Err(StmtError::ArithmeticType { field: 1 })
        ));
    }

    #[test]
    fn arithmetic_on_string_fails_or_is_suppressed() {
        let mut tuple = Vec::new();
        msgpack::write_array_len(&mut tuple, 1);
        msgpack::write_str(&mut tuple, "abc");

        let payload = ops(&[("+", 1, 1)]);
        assert!(apply_update_ops(&tuple, &payload, 1, false).is_err());

        // Suppressed: the bad op is skipped, tuple unchanged.
        let result = apply_update_ops(&tuple, &payload, 1, true).unwrap();
        assert_eq!(result, tuple);
    }

    #[test]
    fn field_out_of_range() {
        let tuple = tuple_u(&[1]);
        assert!(matches!(
            apply_update_ops(&tuple, &ops(&[("=", 5, 0)]), 1, false),
            Err(StmtError::FieldOutOfRange { field: 5, .. })
        ));
    }

    #[test]
    fn unknown_operation_rejected() {
        let tuple = tuple_u(&[1]);
        assert!(matches!(
            apply_update_ops(&tuple, &ops(&[("?", 1, 0)]), 1, false),
            Err(StmtError::IllegalOp(_))
        ));
    }
}
