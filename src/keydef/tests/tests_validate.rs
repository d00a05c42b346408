#[cfg(test)]
mod tests {
    use crate::keydef::{FieldType, KeyDef, KeyDefError, KeyDefOpts, KeyPart};
    use crate::msgpack;

    fn key_def(parts: &[(u32, FieldType)]) -> KeyDef {
        KeyDef::new(
            parts
                .iter()
                .map(|&(field_no, field_type)| KeyPart {
                    field_no,
                    field_type,
                })
                .collect(),
            KeyDefOpts::default(),
        )
    }

    #[test]
    fn unsigned_rejects_negative_and_string() {
        let def = key_def(&[(0, FieldType::Unsigned)]);

        let mut neg = Vec::new();
        msgpack::write_array_len(&mut neg, 1);
        msgpack::write_int(&mut neg, -1);
        assert!(matches!(
            def.validate_key(&neg),
            Err(KeyDefError::FieldTypeMismatch { field_no: 0, .. })
        ));

        let mut s = Vec::new();
        msgpack::write_array_len(&mut s, 1);
        msgpack::write_str(&mut s, "x");
        assert!(def.validate_key(&s).is_err());
    }

    #[test]
    fn partial_keys_validate() {
        let def = key_def(&[(0, FieldType::Unsigned), (1, FieldType::String)]);
        let mut key = Vec::new();
        msgpack::write_array_len(&mut key, 1);
        msgpack::write_uint(&mut key, 5);
        assert_eq!(def.validate_key(&key).unwrap(), 1);
    }

    #[test]
    fn too_many_parts_rejected() {
        let def = key_def(&[(0, FieldType::Unsigned)]);
        let mut key = Vec::new();
        msgpack::write_array_len(&mut key, 2);
        msgpack::write_uint(&mut key, 1);
        msgpack::write_uint(&mut key, 2);
        assert!(matches!(
            def.validate_key(&key),
            Err(KeyDefError::TooManyParts { part_count: 2, max: 1 })
        ));
    }

    #[test]
    fn number_accepts_float_and_integer() {
        let def = key_def(&[(0, FieldType::Number)]);
        let mut key = Vec::new();
        msgpack::write_array_len(&mut key, 1);
        msgpack::write_double(&mut key, 1.5);
        assert_eq!(def.validate_key(&key).unwrap(), 1);
    }

    #[test]
    fn scalar_accepts_bool_and_bin() {
        let def = key_def(&[(0, FieldType::Scalar)]);
        let mut key = Vec::new();
        msgpack::write_array_len(&mut key, 1);
        msgpack::write_bool(&mut key, true);
        assert!(def.validate_key(&key).is_ok());

        let mut key = Vec::new();
        msgpack::write_array_len(&mut key, 1);
        msgpack::write_bin(&mut key, b"blob");
        assert!(def.validate_key(&key).is_ok());
    }

    #[test]
    fn scalar_rejects_array() {
        let def = key_def(&[(0, FieldType::Scalar)]);
        let mut key = Vec::new();
        msgpack::write_array_len(&mut key, 1);
        msgpack::write_array_len(&mut key, 0);
        assert!(def.validate_key(&key).is_err());
    }

    #[test]
    fn missing_field_reports_counts() {
        let def = key_def(&[(3, FieldType::Unsigned)]);
        let mut tuple = Vec::new();
        msgpack::write_array_len(&mut tuple, 2);
        msgpack::write_uint(&mut tuple, 1);
        msgpack::write_uint(&mut tuple, 2);
        assert!(matches!(
            def.extract_key(&tuple),
            Err(KeyDefError::MissingField {
                field_no: 3,
                field_count: 2
            })
        ));
    }
}
