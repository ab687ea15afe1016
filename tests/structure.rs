//! Engine-level behavior: alignment, skips and offsets, checks, raw capture,
//! windowed parsing, context navigation, and write-side offset policies.

use bytespec::expr::{parent, this};
use bytespec::{
    BytesField, EnumField, EnumType, ErrorKind, Field, IntegerField, NegativeOffsetPolicy,
    StructureDef, StructureField, Value,
};
use std::io::Cursor;

#[test]
fn alignment_pads_between_fields() {
    let def = StructureDef::builder("aligned")
        .field("a", IntegerField::new(1))
        .field("b", IntegerField::new(1))
        .alignment(4)
        .build()
        .expect("build");

    let msg = def.from_bytes(b"\x01\xde\xad\xbe\x02").expect("parse");
    assert_eq!(msg.get("a"), Some(&Value::Uint(1)));
    assert_eq!(msg.get("b"), Some(&Value::Uint(2)));
    let fc = msg.context().expect("ctx").field("b").expect("fc");
    assert_eq!(fc.offset, Some(4));

    // Writing seeks over the gap; untouched bytes come out zeroed.
    assert_eq!(def.to_bytes(&msg).expect("emit"), b"\x01\x00\x00\x00\x02");
}

#[test]
fn skip_advances_relative_to_cursor() {
    let def = StructureDef::builder("skipping")
        .field("a", BytesField::fixed(2))
        .field("b", Field::from(BytesField::fixed(2)).with_skip(2usize))
        .build()
        .expect("build");
    let msg = def.from_bytes(b"aaxxbb").expect("parse");
    assert_eq!(msg.get("b").and_then(Value::as_bytes), Some(&b"bb"[..]));
}

#[test]
fn absolute_offset_seeks_from_start() {
    let def = StructureDef::builder("offsets")
        .field("a", BytesField::fixed(2))
        .field("b", Field::from(BytesField::fixed(2)).at_offset(4usize))
        .build()
        .expect("build");
    let msg = def.from_bytes(b"aabbcc").expect("parse");
    assert_eq!(msg.get("a").and_then(Value::as_bytes), Some(&b"aa"[..]));
    assert_eq!(msg.get("b").and_then(Value::as_bytes), Some(&b"cc"[..]));
}

#[test]
fn negative_offset_reads_from_the_end() {
    let def = StructureDef::builder("trailer")
        .field("head", BytesField::fixed(2))
        .field("tail", Field::from(BytesField::fixed(2)).at_offset(-2i64))
        .build()
        .expect("build");
    let msg = def.from_bytes(b"aa-----zz").expect("parse");
    assert_eq!(msg.get("tail").and_then(Value::as_bytes), Some(&b"zz"[..]));
}

#[test]
fn offset_and_skip_are_mutually_exclusive() {
    let err = StructureDef::builder("bad")
        .field(
            "x",
            Field::from(BytesField::fixed(1)).at_offset(1usize).with_skip(1usize),
        )
        .build()
        .expect_err("both set");
    assert!(matches!(err.kind, ErrorKind::DefinitionError(_)));
}

#[test]
fn unknown_field_reference_is_a_definition_error() {
    let err = StructureDef::builder("bad")
        .field("data", BytesField::fixed("missing"))
        .build()
        .expect_err("unknown reference");
    assert!(matches!(err.kind, ErrorKind::DefinitionError(_)));
}

#[test]
fn unknown_references_in_wrapped_fields_are_rejected() {
    // A sub-structure's window length referencing a missing sibling.
    let inner = StructureDef::builder("inner")
        .field("x", IntegerField::new(1))
        .build()
        .expect("build inner");
    let err = StructureDef::builder("bad")
        .field("body", StructureField::new(inner).with_length("typo_field"))
        .build()
        .expect_err("unknown length field");
    assert!(matches!(err.kind, ErrorKind::DefinitionError(_)));

    // A wrapped base field whose default references a missing sibling.
    let color = EnumType::new("Color").member("red", 1);
    let err = StructureDef::builder("bad")
        .field(
            "c",
            EnumField::new(
                Field::from(IntegerField::new(1)).with_default(this("nope")),
                color,
            ),
        )
        .build()
        .expect_err("unknown default field");
    assert!(matches!(err.kind, ErrorKind::DefinitionError(_)));
}

#[test]
fn checks_run_after_parse_and_before_write() {
    let def = StructureDef::builder("checked")
        .field("version", IntegerField::new(1))
        .check(this("version").ge_(2u64))
        .build()
        .expect("build");

    assert!(def.from_bytes(b"\x03").is_ok());
    let err = def.from_bytes(b"\x01").expect_err("check fails");
    assert!(matches!(err.kind, ErrorKind::CheckError(_)));

    let bad = def.value_of(vec![("version", Value::Uint(1))]).expect("value");
    assert!(matches!(
        def.to_bytes(&bad).expect_err("check fails").kind,
        ErrorKind::CheckError(_)
    ));
}

#[test]
fn capture_raw_records_field_bytes() {
    let def = StructureDef::builder("captured")
        .field("n", IntegerField::new(2).big_endian())
        .field("data", BytesField::fixed(3))
        .capture_raw()
        .build()
        .expect("build");
    let msg = def.from_bytes(b"\x01\x02abc").expect("parse");
    let ctx = msg.context().expect("ctx");
    assert_eq!(ctx.field("n").expect("fc").raw, Some(vec![1, 2]));
    assert_eq!(ctx.field("data").expect("fc").raw, Some(b"abc".to_vec()));
}

#[test]
fn structure_length_bounds_parsing() {
    let def = StructureDef::builder("bounded")
        .field("data", BytesField::until_eof())
        .length(4usize)
        .build()
        .expect("build");
    let msg = def.from_bytes(b"abcdefgh").expect("parse");
    assert_eq!(msg.get("data").and_then(Value::as_bytes), Some(&b"abcd"[..]));
}

#[test]
fn negative_write_offset_rejected_by_default() {
    let def = StructureDef::builder("trailer")
        .field("data", BytesField::fixed(4))
        .field("tail", Field::from(IntegerField::new(1)).at_offset(-1i64))
        .build()
        .expect("build");
    let value = def
        .value_of(vec![("data", Value::from(&b"abcd"[..])), ("tail", Value::Uint(7))])
        .expect("value");
    let err = def.to_bytes(&value).expect_err("ambiguous");
    assert!(matches!(err.kind, ErrorKind::WriteError(_)));
}

#[test]
fn negative_write_offset_backfills_with_known_length() {
    let def = StructureDef::builder("trailer")
        .field("data", BytesField::fixed(4))
        .field("tail", Field::from(IntegerField::new(1)).at_offset(-1i64))
        .length(5usize)
        .negative_write_offsets(NegativeOffsetPolicy::RequireLength)
        .build()
        .expect("build");
    let value = def
        .value_of(vec![("data", Value::from(&b"abcd"[..])), ("tail", Value::Uint(7))])
        .expect("value");
    assert_eq!(def.to_bytes(&value).expect("emit"), b"abcd\x07");

    let parsed = def.from_bytes(b"abcd\x07").expect("parse");
    assert_eq!(parsed.get("tail"), Some(&Value::Uint(7)));
}

#[test]
fn nested_structure_sees_parent_fields() {
    let inner = StructureDef::builder("payload")
        .field("body", BytesField::fixed(parent("len")))
        .build()
        .expect("build inner");
    let outer = StructureDef::builder("packet")
        .field("len", IntegerField::new(1))
        .field("payload", StructureField::new(inner))
        .build()
        .expect("build outer");

    let msg = outer.from_bytes(b"\x03abc").expect("parse");
    let payload = msg.get("payload").and_then(Value::as_struct).expect("payload");
    assert_eq!(payload.get("body").and_then(Value::as_bytes), Some(&b"abc"[..]));
}

#[test]
fn from_stream_reports_consumed_bytes() {
    let def = StructureDef::builder("partial")
        .field("head", BytesField::fixed(4))
        .build()
        .expect("build");
    let (msg, consumed) = def
        .from_stream(Cursor::new(b"abcdefgh".to_vec()))
        .expect("parse");
    assert_eq!(consumed, 4);
    assert_eq!(msg.get("head").and_then(Value::as_bytes), Some(&b"abcd"[..]));
}

#[test]
fn to_stream_returns_the_stream() {
    let def = StructureDef::builder("out")
        .field("data", BytesField::fixed(2))
        .build()
        .expect("build");
    let value = def
        .value_of(vec![("data", Value::from(&b"hi"[..]))])
        .expect("value");
    let (written, cursor) = def
        .to_stream(&value, Cursor::new(Vec::new()))
        .expect("emit");
    assert_eq!(written, 2);
    assert_eq!(cursor.into_inner(), b"hi");
}

#[test]
fn field_contexts_record_offsets_and_lengths() {
    let def = StructureDef::builder("layout")
        .field("a", BytesField::fixed(3))
        .field("b", IntegerField::new(2).little_endian())
        .build()
        .expect("build");
    let msg = def.from_bytes(b"xyz\x01\x00").expect("parse");
    let ctx = msg.context().expect("ctx");
    let a = ctx.field("a").expect("a");
    let b = ctx.field("b").expect("b");
    assert_eq!((a.offset, a.length), (Some(0), Some(3)));
    assert_eq!((b.offset, b.length), (Some(3), Some(2)));
    assert!(a.resolved() && b.resolved());
}

#[test]
fn c_style_description() {
    let def = StructureDef::builder("header")
        .field("magic", BytesField::fixed(4))
        .field("version", IntegerField::new(2).big_endian())
        .build()
        .expect("build");
    let text = def.to_c_string();
    assert!(text.starts_with("struct header {"));
    assert!(text.contains("char magic[4];"));
    assert!(text.contains("uint16_t version;"));
}

#[test]
fn duplicate_and_invalid_names_are_rejected() {
    let dup = StructureDef::builder("bad")
        .field("x", BytesField::fixed(1))
        .field("x", BytesField::fixed(1))
        .build();
    assert!(dup.is_err());

    let invalid = StructureDef::builder("bad")
        .field("1x", BytesField::fixed(1))
        .build();
    assert!(invalid.is_err());
}

#[test]
fn struct_value_displays_its_fields() {
    let def = StructureDef::builder("show")
        .field("n", IntegerField::new(1))
        .field("s", BytesField::fixed(2))
        .build()
        .expect("build");
    let msg = def.from_bytes(b"\x07ab").expect("parse");
    assert_eq!(msg.to_string(), "show(n=7, s=b\"ab\")");
}
