//! Per-variant field contracts: delimiting, padding, numeric ranges, bit
//! packing, packed formats, enums, and composition wrappers.

use bytespec::expr::{current, this};
use bytespec::{
    ArrayField, BitField, ByteOrder, BytesField, ConditionalField, ConstantField, EnumField,
    EnumType, ErrorKind, Field, IntegerField, PackedField, StringField, StructureDef,
    StructureField, SwitchField, TerminatorHandler, Value, VarintField,
};

fn single(name: &str, field: impl Into<Field>) -> StructureDef {
    StructureDef::builder("single")
        .field(name, field)
        .build()
        .expect("build")
}

#[test]
fn fixed_bytes_strict_short_read_fails() {
    let def = single("data", BytesField::fixed(4));
    let err = def.from_bytes(b"ab").expect_err("short read");
    assert!(matches!(err.kind, ErrorKind::StreamExhausted(_)));
    assert_eq!(err.path, vec!["data".to_string()]);
}

#[test]
fn lenient_bytes_keep_partial_read() {
    let def = single("data", BytesField::fixed(4).lenient());
    let msg = def.from_bytes(b"ab").expect("parse");
    assert_eq!(msg.get("data").and_then(Value::as_bytes), Some(&b"ab"[..]));
}

#[test]
fn bytes_until_eof() {
    let def = single("data", BytesField::until_eof());
    let msg = def.from_bytes(b"anything goes").expect("parse");
    assert_eq!(msg.get("data").and_then(Value::as_bytes), Some(&b"anything goes"[..]));
}

#[test]
fn terminator_within_fixed_length_region() {
    // All 8 bytes are consumed; the value stops at the terminator.
    let def = single("data", BytesField::fixed(8).with_terminator(b"\0"));
    let msg = def.from_bytes(b"abc\0defg").expect("parse");
    assert_eq!(msg.get("data").and_then(Value::as_bytes), Some(&b"abc"[..]));
    let fc = msg.context().expect("ctx").field("data").expect("fc");
    assert_eq!(fc.length, Some(8));
}

#[test]
fn terminator_at_final_byte() {
    let def = single("data", BytesField::terminated(b"\0"));
    let msg = def.from_bytes(b"abc\0").expect("parse");
    assert_eq!(msg.get("data").and_then(Value::as_bytes), Some(&b"abc"[..]));
}

#[test]
fn missing_terminator_fails_strict_and_passes_lenient() {
    let strict = single("data", BytesField::terminated(b"\0"));
    let err = strict.from_bytes(b"abc").expect_err("no terminator");
    assert!(matches!(err.kind, ErrorKind::StreamExhausted(_)));

    let lenient = single("data", BytesField::terminated(b"\0").lenient());
    let msg = lenient.from_bytes(b"abc").expect("parse");
    assert_eq!(msg.get("data").and_then(Value::as_bytes), Some(&b"abc"[..]));
}

#[test]
fn until_handler_leaves_terminator_in_stream() {
    let def = StructureDef::builder("pair")
        .field(
            "head",
            BytesField::terminated(b"\0").with_handler(TerminatorHandler::Until),
        )
        .field("rest", BytesField::until_eof())
        .build()
        .expect("build");
    let msg = def.from_bytes(b"ab\0cd").expect("parse");
    assert_eq!(msg.get("head").and_then(Value::as_bytes), Some(&b"ab"[..]));
    assert_eq!(msg.get("rest").and_then(Value::as_bytes), Some(&b"\0cd"[..]));
}

#[test]
fn include_handler_keeps_terminator_in_value() {
    let def = single(
        "data",
        BytesField::terminated(b"\0").with_handler(TerminatorHandler::Include),
    );
    let msg = def.from_bytes(b"ab\0").expect("parse");
    assert_eq!(msg.get("data").and_then(Value::as_bytes), Some(&b"ab\0"[..]));
    // Writing verifies the terminator is still part of the value.
    assert_eq!(def.to_bytes(&msg).expect("emit"), b"ab\0");
    let bad = def
        .value_of(vec![("data", Value::from(&b"ab"[..]))])
        .expect("value");
    let err = def.to_bytes(&bad).expect_err("terminator missing");
    assert!(matches!(err.kind, ErrorKind::WriteError(_)));
}

#[test]
fn two_byte_step_scan() {
    // UTF-16-style double-NUL terminator must land on an even boundary.
    let def = single(
        "data",
        BytesField::terminated(b"\0\0").with_step(2),
    );
    let msg = def.from_bytes(b"a\0b\0\0\0tail").expect("parse");
    assert_eq!(msg.get("data").and_then(Value::as_bytes), Some(&b"a\0b\0"[..]));
}

#[test]
fn padding_strips_on_read_and_fills_on_write() {
    let def = single("data", BytesField::fixed(8).with_padding(b"\0"));
    let msg = def.from_bytes(b"abc\0\0\0\0\0").expect("parse");
    assert_eq!(msg.get("data").and_then(Value::as_bytes), Some(&b"abc"[..]));
    assert_eq!(def.to_bytes(&msg).expect("emit"), b"abc\0\0\0\0\0");
}

#[test]
fn fixed_write_length_violations() {
    let def = single("data", BytesField::fixed(4));
    let long = def
        .value_of(vec![("data", Value::from(&b"abcde"[..]))])
        .expect("value");
    assert!(matches!(
        def.to_bytes(&long).expect_err("too long").kind,
        ErrorKind::WriteError(_)
    ));
    let short = def
        .value_of(vec![("data", Value::from(&b"ab"[..]))])
        .expect("value");
    assert!(matches!(
        def.to_bytes(&short).expect_err("too short, no padding").kind,
        ErrorKind::WriteError(_)
    ));
}

#[test]
fn string_field_decodes_and_encodes() {
    let def = single("name", StringField::fixed(8).with_padding(b" "));
    let msg = def.from_bytes(b"caf\xc3\xa9   ").expect("parse");
    assert_eq!(msg.get("name").and_then(Value::as_str), Some("café"));
    assert_eq!(def.to_bytes(&msg).expect("emit"), b"caf\xc3\xa9   ");
}

#[test]
fn string_field_with_alternate_encoding() {
    let def = StructureDef::builder("single")
        .field("name", StringField::fixed(4).with_encoding(encoding_rs::WINDOWS_1252))
        .build()
        .expect("build");
    let msg = def.from_bytes(b"caf\xe9").expect("parse");
    assert_eq!(msg.get("name").and_then(Value::as_str), Some("café"));
    assert_eq!(def.to_bytes(&msg).expect("emit"), b"caf\xe9");
}

#[test]
fn string_field_strict_rejects_invalid_input() {
    let def = single("name", StringField::fixed(2));
    let err = def.from_bytes(b"\xff\xff").expect_err("invalid utf-8");
    assert!(matches!(err.kind, ErrorKind::ParseError(_)));
}

#[test]
fn integers_respect_byte_order_and_sign() {
    let def = StructureDef::builder("numbers")
        .field("be", IntegerField::new(3).big_endian())
        .field("le", IntegerField::new(3).little_endian())
        .field("neg", IntegerField::new(2).big_endian().signed())
        .build()
        .expect("build");
    let msg = def.from_bytes(b"\x01\x02\x03\x01\x02\x03\xff\xfe").expect("parse");
    assert_eq!(msg.get("be"), Some(&Value::Uint(0x010203)));
    assert_eq!(msg.get("le"), Some(&Value::Uint(0x030201)));
    assert_eq!(msg.get("neg"), Some(&Value::Int(-2)));
    assert_eq!(def.to_bytes(&msg).expect("emit"), b"\x01\x02\x03\x01\x02\x03\xff\xfe");
}

#[test]
fn integer_write_overflow() {
    let def = single("n", IntegerField::new(1));
    let value = def.value_of(vec![("n", Value::Uint(256))]).expect("value");
    assert!(matches!(
        def.to_bytes(&value).expect_err("overflow").kind,
        ErrorKind::Overflow(_)
    ));
    let signed = single("n", IntegerField::new(1).signed());
    let value = signed.value_of(vec![("n", Value::Int(-129))]).expect("value");
    assert!(matches!(
        signed.to_bytes(&value).expect_err("overflow").kind,
        ErrorKind::Overflow(_)
    ));
}

#[test]
fn varint_round_trips() {
    let def = single("n", VarintField::new());
    for (value, bytes) in [
        (0u64, &b"\x00"[..]),
        (1, b"\x01"),
        (127, b"\x7f"),
        (128, b"\x81\x00"),
        (300, b"\x82\x2c"),
        (u64::MAX, b"\x81\xff\xff\xff\xff\xff\xff\xff\xff\x7f"),
    ] {
        let v = def.value_of(vec![("n", Value::Uint(value))]).expect("value");
        assert_eq!(def.to_bytes(&v).expect("emit"), bytes, "value {}", value);
        let parsed = def.from_bytes(bytes).expect("parse");
        assert_eq!(parsed.get("n"), Some(&Value::Uint(value)));
    }
}

#[test]
fn varint_rejects_negative_write() {
    let def = single("n", VarintField::new());
    let v = def.value_of(vec![("n", Value::Int(-1))]).expect("value");
    assert!(matches!(
        def.to_bytes(&v).expect_err("negative").kind,
        ErrorKind::Overflow(_)
    ));
}

#[test]
fn bit_fields_share_a_byte() {
    let def = StructureDef::builder("nibbles")
        .field("hi", BitField::new(4))
        .field("lo", BitField::new(4))
        .build()
        .expect("build");
    let msg = def.from_bytes(&[0xAB]).expect("parse");
    assert_eq!(msg.get("hi"), Some(&Value::Uint(0xA)));
    assert_eq!(msg.get("lo"), Some(&Value::Uint(0xB)));
    assert_eq!(def.to_bytes(&msg).expect("emit"), vec![0xAB]);
}

#[test]
fn bit_fields_cross_byte_boundaries() {
    let def = StructureDef::builder("packed_bits")
        .field("a", BitField::new(3))
        .field("b", BitField::new(7))
        .field("c", BitField::new(6))
        .build()
        .expect("build");
    let msg = def.from_bytes(&[0b1011_0011, 0b0110_0101]).expect("parse");
    assert_eq!(msg.get("a"), Some(&Value::Uint(0b101)));
    assert_eq!(msg.get("b"), Some(&Value::Uint(0b1_0011_01)));
    assert_eq!(msg.get("c"), Some(&Value::Uint(0b10_0101)));
    assert_eq!(def.to_bytes(&msg).expect("emit"), vec![0b1011_0011, 0b0110_0101]);
}

#[test]
fn misaligned_bit_to_byte_transition_fails() {
    let def = StructureDef::builder("bad")
        .field("a", BitField::new(3))
        .field("b", BytesField::fixed(1))
        .build()
        .expect("build");
    let err = def.from_bytes(&[0xff, 0xff]).expect_err("misaligned");
    assert!(matches!(err.kind, ErrorKind::ImpossibleToCalculateLength(_)));
}

#[test]
fn realign_discards_rest_of_byte() {
    let def = StructureDef::builder("flags")
        .field("a", BitField::new(3).realign())
        .field("b", BytesField::fixed(1))
        .build()
        .expect("build");
    let msg = def.from_bytes(&[0b1010_1111, 0x42]).expect("parse");
    assert_eq!(msg.get("a"), Some(&Value::Uint(0b101)));
    assert_eq!(msg.get("b").and_then(Value::as_bytes), Some(&b"\x42"[..]));
    // Writing zero-pads the discarded bits.
    assert_eq!(def.to_bytes(&msg).expect("emit"), vec![0b1010_0000, 0x42]);
}

#[test]
fn bit_field_with_referenced_length() {
    let def = StructureDef::builder("variable_bits")
        .field("width", IntegerField::new(1))
        .field("val", BitField::new("width").realign())
        .build()
        .expect("build");

    let msg = def.from_bytes(&[0x03, 0xa0]).expect("parse");
    assert_eq!(msg.get("val"), Some(&Value::Uint(0b101)));

    // Emitting without a width mirrors the value's bit length.
    let value = def.value_of(vec![("val", Value::Uint(0b101))]).expect("value");
    assert_eq!(def.to_bytes(&value).expect("emit"), vec![0x03, 0xa0]);
}

#[test]
fn bit_field_write_range_check() {
    let def = single("a", BitField::new(3).realign());
    let v = def.value_of(vec![("a", Value::Uint(8))]).expect("value");
    assert!(matches!(
        def.to_bytes(&v).expect_err("3 bits").kind,
        ErrorKind::Overflow(_)
    ));
}

#[test]
fn packed_scalars() {
    let def = StructureDef::builder("packed")
        .field("s", PackedField::short(ByteOrder::Big))
        .field("u", PackedField::uint(ByteOrder::Little))
        .field("flag", PackedField::boolean())
        .field("ratio", PackedField::float(ByteOrder::Big))
        .build()
        .expect("build");
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&(-2i16).to_be_bytes());
    bytes.extend_from_slice(&0xdeadbeefu32.to_le_bytes());
    bytes.push(1);
    bytes.extend_from_slice(&1.5f32.to_be_bytes());
    let msg = def.from_bytes(&bytes).expect("parse");
    assert_eq!(msg.get("s"), Some(&Value::Int(-2)));
    assert_eq!(msg.get("u"), Some(&Value::Uint(0xdeadbeef)));
    assert_eq!(msg.get("flag"), Some(&Value::Bool(true)));
    assert_eq!(msg.get("ratio"), Some(&Value::Float(1.5)));
    assert_eq!(def.to_bytes(&msg).expect("emit"), bytes);
}

#[test]
fn packed_multibyte_format() {
    let def = single("vals", PackedField::new(">2hB").multibyte());
    let msg = def.from_bytes(b"\x00\x01\xff\xff\x07").expect("parse");
    assert_eq!(
        msg.get("vals"),
        Some(&Value::List(vec![Value::Int(1), Value::Int(-1), Value::Uint(7)]))
    );
    assert_eq!(def.to_bytes(&msg).expect("emit"), b"\x00\x01\xff\xff\x07");
}

#[test]
fn packed_multibyte_requires_flag() {
    let err = StructureDef::builder("bad")
        .field("vals", PackedField::new(">2h"))
        .build()
        .expect_err("needs multibyte");
    assert!(matches!(err.kind, ErrorKind::DefinitionError(_)));
}

#[test]
fn packed_half_precision() {
    let def = single("h", PackedField::half_float(ByteOrder::Big));
    let msg = def.from_bytes(&[0x3c, 0x00]).expect("parse");
    assert_eq!(msg.get("h"), Some(&Value::Float(1.0)));
    assert_eq!(def.to_bytes(&msg).expect("emit"), vec![0x3c, 0x00]);
}

#[test]
fn constant_field_checks_both_directions() {
    let def = StructureDef::builder("magic")
        .field("magic", ConstantField::new(&b"PNG"[..]))
        .field("rest", BytesField::until_eof())
        .build()
        .expect("build");
    let msg = def.from_bytes(b"PNGdata").expect("parse");
    assert_eq!(msg.get("rest").and_then(Value::as_bytes), Some(&b"data"[..]));

    let err = def.from_bytes(b"JPGdata").expect_err("wrong magic");
    assert!(matches!(err.kind, ErrorKind::CheckError(_)));

    // The constant doubles as the default on write.
    let value = def
        .value_of(vec![("rest", Value::from(&b"data"[..]))])
        .expect("value");
    assert_eq!(def.to_bytes(&value).expect("emit"), b"PNGdata");

    let mut bad = value.clone();
    bad.set("magic", Value::from(&b"JPG"[..])).expect("set");
    assert!(matches!(
        def.to_bytes(&bad).expect_err("wrong constant").kind,
        ErrorKind::WriteError(_)
    ));
}

#[test]
fn conditional_field_consumes_nothing_when_false() {
    let def = StructureDef::builder("opt")
        .field("has_extra", IntegerField::new(1))
        .field(
            "extra",
            ConditionalField::new(IntegerField::new(2).big_endian(), "has_extra")
                .with_fallback(0u64),
        )
        .field("tail", BytesField::fixed(1))
        .build()
        .expect("build");

    let with = def.from_bytes(b"\x01\x02\x03t").expect("parse");
    assert_eq!(with.get("extra"), Some(&Value::Uint(0x0203)));
    assert_eq!(with.get("tail").and_then(Value::as_bytes), Some(&b"t"[..]));

    let without = def.from_bytes(b"\x00t").expect("parse");
    assert_eq!(without.get("extra"), Some(&Value::Uint(0)));
    assert_eq!(without.get("tail").and_then(Value::as_bytes), Some(&b"t"[..]));
    assert_eq!(def.to_bytes(&without).expect("emit"), b"\x00t");
}

#[test]
fn switch_field_dispatches_on_key() {
    let def = StructureDef::builder("tagged")
        .field("tag", IntegerField::new(1))
        .field(
            "body",
            SwitchField::new(this("tag"))
                .case(1u64, IntegerField::new(1))
                .case(2u64, IntegerField::new(2).big_endian()),
        )
        .build()
        .expect("build");

    let one = def.from_bytes(b"\x01\x2a").expect("parse");
    assert_eq!(one.get("body"), Some(&Value::Uint(0x2a)));
    let two = def.from_bytes(b"\x02\x01\x00").expect("parse");
    assert_eq!(two.get("body"), Some(&Value::Uint(0x100)));

    let err = def.from_bytes(b"\x03\x00").expect_err("unknown key");
    assert!(matches!(err.kind, ErrorKind::CheckError(_)));
}

#[test]
fn switch_field_falls_back_to_other() {
    let def = StructureDef::builder("tagged")
        .field("tag", IntegerField::new(1))
        .field(
            "body",
            SwitchField::new(this("tag"))
                .case(1u64, IntegerField::new(1))
                .other(BytesField::fixed(2)),
        )
        .build()
        .expect("build");
    let msg = def.from_bytes(b"\x09ab").expect("parse");
    assert_eq!(msg.get("body").and_then(Value::as_bytes), Some(&b"ab"[..]));
}

#[test]
fn plain_enum_rejects_unknown_values() {
    let color = EnumType::new("Color").member("red", 1).member("green", 2);
    let def = single("c", EnumField::new(IntegerField::new(1), color));
    let msg = def.from_bytes(b"\x02").expect("parse");
    match msg.get("c") {
        Some(Value::Enum(e)) => assert_eq!(e.name, "green"),
        other => panic!("expected enum, got {:?}", other),
    }
    let err = def.from_bytes(b"\x07").expect_err("unknown member");
    assert!(matches!(err.kind, ErrorKind::ParseError(_)));

    // Writing by member name.
    let by_name = def
        .value_of(vec![("c", Value::Str("red".to_string()))])
        .expect("value");
    assert_eq!(def.to_bytes(&by_name).expect("emit"), b"\x01");
}

#[test]
fn array_bounded_by_byte_length() {
    let def = single("items", ArrayField::sized(IntegerField::new(2).big_endian(), 6usize));
    let msg = def.from_bytes(b"\x00\x01\x00\x02\x00\x03").expect("parse");
    assert_eq!(
        msg.get("items"),
        Some(&Value::List(vec![Value::Uint(1), Value::Uint(2), Value::Uint(3)]))
    );
    assert_eq!(def.to_bytes(&msg).expect("emit"), b"\x00\x01\x00\x02\x00\x03");
}

#[test]
fn greedy_array_absorbs_trailing_end_of_stream() {
    let def = single("items", ArrayField::greedy(IntegerField::new(2).big_endian()));
    let msg = def.from_bytes(b"\x00\x01\x00\x02\x05").expect("parse");
    assert_eq!(
        msg.get("items"),
        Some(&Value::List(vec![Value::Uint(1), Value::Uint(2)]))
    );
}

#[test]
fn array_until_condition_stops_after_matching_element() {
    let def = single(
        "items",
        ArrayField::new(IntegerField::new(1)).until(current().eq_(0u64)),
    );
    let msg = def.from_bytes(b"\x05\x03\x00\x07").expect("parse");
    assert_eq!(
        msg.get("items"),
        Some(&Value::List(vec![Value::Uint(5), Value::Uint(3), Value::Uint(0)]))
    );
}

#[test]
fn array_count_mismatch_on_write() {
    let def = StructureDef::builder("counted")
        .field("n", IntegerField::new(1))
        .field("items", ArrayField::counted(IntegerField::new(1), "n"))
        .build()
        .expect("build");
    let mut value = def
        .value_of(vec![("items", Value::List(vec![Value::Uint(1), Value::Uint(2)]))])
        .expect("value");
    value.set("n", 3u64).expect("set");
    assert!(matches!(
        def.to_bytes(&value).expect_err("count mismatch").kind,
        ErrorKind::WriteError(_)
    ));
}

#[test]
fn structure_field_nests_and_reports_path() {
    let point = StructureDef::builder("point")
        .field("x", IntegerField::new(1))
        .field("y", IntegerField::new(1))
        .build()
        .expect("build point");
    let def = StructureDef::builder("shape")
        .field("origin", StructureField::new(point))
        .field("name", BytesField::terminated(b"\0"))
        .build()
        .expect("build shape");

    let msg = def.from_bytes(b"\x03\x04dot\0").expect("parse");
    let origin = msg.get("origin").and_then(Value::as_struct).expect("origin");
    assert_eq!(origin.get("x"), Some(&Value::Uint(3)));
    assert_eq!(origin.get("y"), Some(&Value::Uint(4)));
    assert_eq!(def.to_bytes(&msg).expect("emit"), b"\x03\x04dot\0");

    let err = def.from_bytes(b"\x03").expect_err("truncated");
    assert_eq!(err.path, vec!["origin".to_string(), "y".to_string()]);
}

#[test]
fn structure_field_with_window_length() {
    let inner = StructureDef::builder("blob")
        .field("data", BytesField::until_eof())
        .build()
        .expect("build blob");
    let def = StructureDef::builder("framed")
        .field("body", StructureField::new(inner).with_length(4u64))
        .field("tail", BytesField::fixed(2))
        .build()
        .expect("build framed");
    let msg = def.from_bytes(b"abcdEF").expect("parse");
    let body = msg.get("body").and_then(Value::as_struct).expect("body");
    assert_eq!(body.get("data").and_then(Value::as_bytes), Some(&b"abcd"[..]));
    assert_eq!(msg.get("tail").and_then(Value::as_bytes), Some(&b"EF"[..]));
}
