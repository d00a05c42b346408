//! Micro-benchmarks: point writes, point reads, and range scans over
//! the public API.

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::TempDir;

use borealdb::config::BoxConfig;
use borealdb::db::{Db, SpaceConfig};
use borealdb::iterator::IteratorType;
use borealdb::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
use borealdb::msgpack;
use borealdb::space::{IndexDef, IndexKind, SpaceDef, SpaceHandler};

const SPACE: u32 = 512;

fn open(tmp: &TempDir) -> Arc<Db> {
    let schema = vec![SpaceConfig {
        def: SpaceDef {
            id: SPACE,
            name: "bench".into(),
            engine: "vinyl".into(),
            field_count: None,
            temporary: false,
        },
        indexes: vec![IndexDef {
            index_id: 0,
            name: "pk".into(),
            kind: IndexKind::Tree,
            key_def: Arc::new(KeyDef::new(
                vec![KeyPart {
                    field_no: 0,
                    field_type: FieldType::Unsigned,
                }],
                KeyDefOpts::default(),
            )),
        }],
    }];
    Db::open(BoxConfig::rooted(tmp.path()), schema).unwrap()
}

fn tuple_u(values: &[u64]) -> Vec<u8> {
    let mut buf = Vec::new();
    msgpack::write_array_len(&mut buf, values.len() as u32);
    for v in values {
        msgpack::write_uint(&mut buf, *v);
    }
    buf
}

fn bench_replace(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp);
    let space = db.handler(SPACE);
    let mut key = 0u64;
    c.bench_function("replace", |b| {
        b.iter(|| {
            space.replace(&tuple_u(&[key, key])).unwrap();
            key += 1;
        })
    });
    db.close().unwrap();
}

fn bench_get(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp);
    let space = db.handler(SPACE);
    for k in 0..10_000u64 {
        space.replace(&tuple_u(&[k, k])).unwrap();
    }
    let mut key = 0u64;
    c.bench_function("get", |b| {
        b.iter(|| {
            let found = space.get(&tuple_u(&[key % 10_000])).unwrap();
            assert!(found.is_some());
            key += 1;
        })
    });
    db.close().unwrap();
}

fn bench_scan(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let db = open(&tmp);
    let space = db.handler(SPACE);
    for k in 0..10_000u64 {
        space.replace(&tuple_u(&[k, k])).unwrap();
    }
    c.bench_function("scan_1k", |b| {
        b.iter(|| {
            let rows = space
                .select(0, IteratorType::All, &[], 1000)
                .unwrap();
            assert_eq!(rows.len(), 1000);
        })
    });
    db.close().unwrap();
}

criterion_group!(benches, bench_replace, bench_get, bench_scan);
criterion_main!(benches);
