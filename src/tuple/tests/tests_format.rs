#[cfg(test)]
mod tests {
    use crate::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
    use crate::msgpack;
    use crate::tuple::{Tuple, TupleError, TupleFormat};

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

    fn encode(values: &[u64]) -> Vec<u8> {
        let mut buf = Vec::new();
        msgpack::write_array_len(&mut buf, values.len() as u32);
        for v in values {
            msgpack::write_uint(&mut buf, *v);
        }
        buf
    }

    #[test]
    fn tuple_round_trips_data() {
        let def = key_def(&[(0, FieldType::Unsigned)]);
        let format = TupleFormat::new(&[&def], None).unwrap();
        let data = encode(&[1, 2, 3]);
        let tuple = Tuple::new(format, &data).unwrap();
        assert_eq!(tuple.data(), data.as_slice());
        assert_eq!(tuple.field_count(), 3);
    }

    #[test]
    fn indexed_fields_get_offset_slots() {
        let primary = key_def(&[(0, FieldType::Unsigned)]);
        let secondary = key_def(&[(2, FieldType::Unsigned), (1, FieldType::Unsigned)]);
        let format = TupleFormat::new(&[&primary, &secondary], None).unwrap();
        // Fields 1 and 2 are indexed and past field 0.
        assert_eq!(format.offset_count(), 2);

        let data = encode(&[10, 20, 30, 40]);
        let tuple = Tuple::new(format, &data).unwrap();

        for (field_no, expect) in [(0u32, 10u64), (1, 20), (2, 30), (3, 40)] {
            let raw = tuple.field(field_no).unwrap();
            let (v, _) = msgpack::read_uint(raw).unwrap();
            assert_eq!(v, expect, "field {field_no}");
        }
    }

    #[test]
    fn type_validation_on_ingest() {
        let def = key_def(&[(1, FieldType::String)]);
        let format = TupleFormat::new(&[&def], None).unwrap();
        let data = encode(&[1, 2]);
        assert!(matches!(
            Tuple::new(format, &data),
            Err(TupleError::KeyDef(_))
        ));
    }

    #[test]
    fn exact_field_count_enforced() {
        let def = key_def(&[(0, FieldType::Unsigned)]);
        let format = TupleFormat::new(&[&def], Some(3)).unwrap();
        assert!(matches!(
            Tuple::new(format.clone(), &encode(&[1, 2])),
            Err(TupleError::FieldCountMismatch {
                expected: 3,
                found: 2
            })
        ));
        assert!(Tuple::new(format, &encode(&[1, 2, 3])).is_ok());
    }

    #[test]
    fn short_tuple_rejected() {
        let def = key_def(&[(0, FieldType::Unsigned), (1, FieldType::Unsigned)]);
        let format = TupleFormat::new(&[&def], None).unwrap();
        assert!(matches!(
            Tuple::new(format, &encode(&[7])),
            Err(TupleError::TooFewFields {
                required: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn non_array_body_rejected() {
        let format = TupleFormat::empty();
        let mut data = Vec::new();
        msgpack::write_uint(&mut data, 42);
        assert!(matches!(
            Tuple::new(format, &data),
            Err(TupleError::NotAnArray)
        ));
    }

    #[test]
    fn field_types_union_across_defs() {
        let a = key_def(&[(1, FieldType::Number)]);
        let b = key_def(&[(1, FieldType::Unsigned)]);
        let format = TupleFormat::new(&[&a, &b], None).unwrap();
        assert_eq!(format.field_type(1), FieldType::Unsigned);
        assert_eq!(format.field_type(9), FieldType::Any);
    }
}
