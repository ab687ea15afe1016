//! Benchmark: parse and emit a representative record — fixed header, counted
//! array of terminated strings, and a length-framed payload.

use bytespec::expr::{len_, this};
use bytespec::{
    ArrayField, ByteOrder, BytesField, ConstantField, Field, IntegerField, StructureDef, Value,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn record_def() -> StructureDef {
    StructureDef::builder("record")
        .field("magic", ConstantField::new(&b"REC0"[..]))
        .field("flags", IntegerField::new(2))
        .field("name_count", IntegerField::new(1))
        .field(
            "names",
            ArrayField::counted(BytesField::null_terminated(), "name_count"),
        )
        .field(
            "payload_len",
            Field::from(IntegerField::new(4)).with_override(len_(this("payload"))),
        )
        .field("payload", BytesField::fixed("payload_len"))
        .byte_order(ByteOrder::Big)
        .build()
        .expect("build record")
}

fn sample_bytes(def: &StructureDef) -> Vec<u8> {
    let names = Value::List(vec![
        Value::Bytes(b"alpha".to_vec()),
        Value::Bytes(b"beta".to_vec()),
        Value::Bytes(b"gamma".to_vec()),
    ]);
    let value = def
        .value_of(vec![
            ("flags", Value::Uint(0x0102)),
            ("names", names),
            ("payload", Value::Bytes(vec![0x5a; 256])),
        ])
        .expect("value");
    def.to_bytes(&value).expect("emit sample")
}

fn bench_parse(c: &mut Criterion) {
    let def = record_def();
    let bytes = sample_bytes(&def);
    c.bench_function("parse_record", |b| {
        b.iter(|| {
            let msg = def.from_bytes(black_box(&bytes)).expect("parse");
            black_box(msg);
        })
    });
}

fn bench_emit(c: &mut Criterion) {
    let def = record_def();
    let bytes = sample_bytes(&def);
    let msg = def.from_bytes(&bytes).expect("parse");
    c.bench_function("emit_record", |b| {
        b.iter(|| {
            let out = def.to_bytes(black_box(&msg)).expect("emit");
            black_box(out);
        })
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let def = record_def();
    let bytes = sample_bytes(&def);
    c.bench_function("round_trip_record", |b| {
        b.iter(|| {
            let msg = def.from_bytes(black_box(&bytes)).expect("parse");
            let out = def.to_bytes(&msg).expect("emit");
            black_box(out);
        })
    });
}

criterion_group!(benches, bench_parse, bench_emit, bench_round_trip);
criterion_main!(benches);
