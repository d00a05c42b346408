#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use crate::msgpack::*;

    #[test]
    fn numbers_compare_exactly_across_signs() {
        assert_eq!(
            cmp_numbers(&MpValue::Uint(5), &MpValue::Uint(7)),
            Ordering::Less
        );
        assert_eq!(
            cmp_numbers(&MpValue::Int(-3), &MpValue::Uint(0)),
            Ordering::Less
        );
        assert_eq!(
            cmp_numbers(&MpValue::Uint(u64::MAX), &MpValue::Int(-1)),
            Ordering::Greater
        );
        assert_eq!(
            cmp_numbers(&MpValue::Uint(2), &MpValue::Double(2.0)),
            Ordering::Equal
        );
        assert_eq!(
            cmp_numbers(&MpValue::Double(1.5), &MpValue::Uint(2)),
            Ordering::Less
        );
    }

    #[test]
    fn scalar_compare_orders_classes_before_values() {
        let nil = MpValue::Nil;
        let fals = MpValue::Bool(false);
        let num = MpValue::Uint(999);
        let s = MpValue::Str(b"a");
        let b = MpValue::Bin(b"a");

        assert_eq!(cmp_scalar(&nil, &fals), Ordering::Less);
        assert_eq!(cmp_scalar(&fals, &num), Ordering::Less);
        assert_eq!(cmp_scalar(&num, &s), Ordering::Less);
        assert_eq!(cmp_scalar(&s, &b), Ordering::Less);
    }

    #[test]
    fn scalar_compare_within_class() {
        assert_eq!(
            cmp_scalar(&MpValue::Str(b"abc"), &MpValue::Str(b"abd")),
            Ordering::Less
        );
        assert_eq!(
            cmp_scalar(&MpValue::Bool(false), &MpValue::Bool(true)),
            Ordering::Less
        );
        assert_eq!(
            cmp_scalar(&MpValue::Uint(10), &MpValue::Uint(10)),
            Ordering::Equal
        );
    }

    #[test]
    fn classify_covers_all_marker_ranges() {
        assert_eq!(classify(0x00).unwrap(), ValueClass::Number);
        assert_eq!(classify(0xFF).unwrap(), ValueClass::Number);
        assert_eq!(classify(0xC0).unwrap(), ValueClass::Nil);
        assert_eq!(classify(0xC3).unwrap(), ValueClass::Bool);
        assert_eq!(classify(0xA5).unwrap(), ValueClass::Str);
        assert_eq!(classify(0xC4).unwrap(), ValueClass::Bin);
        assert_eq!(classify(0x95).unwrap(), ValueClass::Array);
        assert_eq!(classify(0x85).unwrap(), ValueClass::Map);
        assert_eq!(classify(0xD6).unwrap(), ValueClass::Ext);
        assert!(classify(0xC1).is_err());
    }
}
