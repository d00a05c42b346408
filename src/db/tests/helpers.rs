//! Shared fixtures for facade tests.
#![cfg(test)]

use std::sync::Arc;

use crate::config::BoxConfig;
use crate::db::{Db, SpaceConfig};
use crate::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
use crate::msgpack;
use crate::space::{IndexDef, IndexKind, SpaceDef};

/// Space id used by most tests.
pub const SPACE: u32 = 512;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

pub fn key_def(parts: &[(u32, FieldType)]) -> Arc<KeyDef> {
    Arc::new(KeyDef::new(
        parts
            .iter()
            .map(|&(field_no, field_type)| KeyPart {
                field_no,
                field_type,
            })
            .collect(),
        KeyDefOpts::default(),
    ))
}

/// A schema with one space: primary on field 0, plus the given
/// secondary definitions.
pub fn schema(secondaries: &[(u32, &[(u32, FieldType)])]) -> Vec<SpaceConfig> {
    let mut indexes = vec![IndexDef {
        index_id: 0,
        name: "pk".into(),
        kind: IndexKind::Tree,
        key_def: key_def(&[(0, FieldType::Unsigned)]),
    }];
    for (index_id, parts) in secondaries {
        indexes.push(IndexDef {
            index_id: *index_id,
            name: format!("sk{index_id}"),
            kind: IndexKind::Tree,
            key_def: key_def(parts),
        });
    }
    vec![SpaceConfig {
        def: SpaceDef {
            id: SPACE,
            name: "test".into(),
            engine: "vinyl".into(),
            field_count: None,
            temporary: false,
        },
        indexes,
    }]
}

pub fn open(dir: &std::path::Path) -> Arc<Db> {
    Db::open(BoxConfig::rooted(dir), schema(&[])).unwrap()
}

pub fn tuple_u(values: &[u64]) -> Vec<u8> {
    let mut buf = Vec::new();
    msgpack::write_array_len(&mut buf, values.len() as u32);
    for v in values {
        msgpack::write_uint(&mut buf, *v);
    }
    buf
}

pub fn key_u(v: u64) -> Vec<u8> {
    tuple_u(&[v])
}

/// Decodes a tuple of unsigned fields.
pub fn decode_u(tuple: &[u8]) -> Vec<u64> {
    let (count, mut pos) = msgpack::read_array_len(tuple).unwrap();
    (0..count)
        .map(|_| {
            let (v, n) = msgpack::read_uint(&tuple[pos..]).unwrap();
            pos += n;
            v
        })
        .collect()
}

/// `[["+", field, arg]]` update payload.
pub fn add_op(field: i64, arg: i64) -> Vec<u8> {
    let mut buf = Vec::new();
    msgpack::write_array_len(&mut buf, 1);
    msgpack::write_array_len(&mut buf, 3);
    msgpack::write_str(&mut buf, "+");
    msgpack::write_int(&mut buf, field);
    msgpack::write_int(&mut buf, arg);
    buf
}
