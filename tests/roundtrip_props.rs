//! Property tests: byte and value round-trips for the numeric fields.

use bytespec::{ByteOrder, IntegerField, PackedField, StructureDef, Value, VarintField};
use proptest::prelude::*;

fn int_def(length: usize, byte_order: ByteOrder, signed: bool) -> StructureDef {
    let mut field = IntegerField::new(length).with_byte_order(byte_order);
    if signed {
        field = field.signed();
    }
    StructureDef::builder("n")
        .field("n", field)
        .build()
        .expect("build")
}

proptest! {
    #[test]
    fn unsigned_integer_value_round_trip(
        value in any::<u64>(),
        length in 1usize..=8,
        big in any::<bool>(),
    ) {
        let max = if length == 8 { u64::MAX } else { (1u64 << (length * 8)) - 1 };
        let value = value & max;
        let order = if big { ByteOrder::Big } else { ByteOrder::Little };
        let def = int_def(length, order, false);
        let v = def.value_of(vec![("n", Value::Uint(value))]).expect("value");
        let bytes = def.to_bytes(&v).expect("emit");
        prop_assert_eq!(bytes.len(), length);
        let parsed = def.from_bytes(&bytes).expect("parse");
        prop_assert_eq!(parsed.get("n"), Some(&Value::Uint(value)));
    }

    #[test]
    fn signed_integer_byte_round_trip(
        bytes in proptest::collection::vec(any::<u8>(), 1..=8),
        big in any::<bool>(),
    ) {
        let order = if big { ByteOrder::Big } else { ByteOrder::Little };
        let def = int_def(bytes.len(), order, true);
        let parsed = def.from_bytes(&bytes).expect("parse");
        prop_assert_eq!(def.to_bytes(&parsed).expect("emit"), bytes);
    }

    #[test]
    fn varint_value_round_trip(value in any::<u64>()) {
        let def = StructureDef::builder("v")
            .field("n", VarintField::new())
            .build()
            .expect("build");
        let v = def.value_of(vec![("n", Value::Uint(value))]).expect("value");
        let bytes = def.to_bytes(&v).expect("emit");
        // Minimal length: ceil(bits / 7), at least one byte.
        let bits = 64 - value.leading_zeros() as usize;
        prop_assert_eq!(bytes.len(), bits.div_ceil(7).max(1));
        let parsed = def.from_bytes(&bytes).expect("parse");
        prop_assert_eq!(parsed.get("n"), Some(&Value::Uint(value)));
    }

    #[test]
    fn packed_double_value_round_trip(value in any::<f64>().prop_filter("finite", |v| v.is_finite())) {
        let def = StructureDef::builder("d")
            .field("d", PackedField::double(ByteOrder::Little))
            .build()
            .expect("build");
        let v = def.value_of(vec![("d", Value::Float(value))]).expect("value");
        let bytes = def.to_bytes(&v).expect("emit");
        let parsed = def.from_bytes(&bytes).expect("parse");
        prop_assert_eq!(parsed.get("d"), Some(&Value::Float(value)));
    }
}
