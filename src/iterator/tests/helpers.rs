//! Shared fixtures for iterator tests.
#![cfg(test)]

use std::sync::Arc;

use crate::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
use crate::msgpack;
use crate::stmt::Statement;

/// Single-part unsigned primary key on field 0.
pub fn key_def() -> Arc<KeyDef> {
    Arc::new(KeyDef::new(
        vec![KeyPart {
            field_no: 0,
            field_type: FieldType::Unsigned,
        }],
        KeyDefOpts::default(),
    ))
}

/// `[v0, v1, …]` as a MessagePack array.
pub fn tuple_u(values: &[u64]) -> Vec<u8> {
    let mut buf = Vec::new();
    msgpack::write_array_len(&mut buf, values.len() as u32);
    for v in values {
        msgpack::write_uint(&mut buf, *v);
    }
    buf
}

pub fn replace(key: u64, value: u64, lsn: i64) -> Arc<Statement> {
    let stmt = Statement::new_replace(&tuple_u(&[key, value]));
    stmt.set_lsn(lsn);
    stmt
}

pub fn delete(key: u64, lsn: i64) -> Arc<Statement> {
    let stmt = Statement::new_delete(&tuple_u(&[key]));
    stmt.set_lsn(lsn);
    stmt
}

/// UPSERT with fallback `{key, fallback}` and one op `+ field 2, add`.
pub fn upsert(key: u64, fallback: u64, add: i64, lsn: i64) -> Arc<Statement> {
    let mut ops = Vec::new();
    msgpack::write_array_len(&mut ops, 1);
    msgpack::write_array_len(&mut ops, 3);
    msgpack::write_str(&mut ops, "+");
    msgpack::write_int(&mut ops, 2);
    msgpack::write_int(&mut ops, add);
    let stmt = Statement::new_upsert(&tuple_u(&[key, fallback]), &ops);
    stmt.set_lsn(lsn);
    stmt
}

/// Decodes `(field0, field1)` of a tuple statement.
pub fn fields2(stmt: &Statement) -> (u64, u64) {
    let (_, mut pos) = msgpack::read_array_len(stmt.data()).unwrap();
    let (a, n) = msgpack::read_uint(&stmt.data()[pos..]).unwrap();
    pos += n;
    let (b, _) = msgpack::read_uint(&stmt.data()[pos..]).unwrap();
    (a, b)
}

/// Decodes field0 of a tuple or key statement.
pub fn field0(stmt: &Statement) -> u64 {
    let (_, pos) = msgpack::read_array_len(stmt.data()).unwrap();
    msgpack::read_uint(&stmt.data()[pos..]).unwrap().0
}
