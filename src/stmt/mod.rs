//! Statements — the unit of storage and iteration.
//!
//! A statement is a tuple (or a key) tagged with an operation type, an
//! LSN, and — for UPSERT — an operations payload:
//!
//! - `REPLACE` stores a full tuple.
//! - `DELETE` stores only the key of the deleted tuple.
//! - `UPSERT` stores a fallback tuple plus a sequence of update
//!   operations to run against an older version.
//! - `SELECT` is a key-only statement used as an iterator probe; it is
//!   never written to storage.
//!
//! Statements are immutable after construction except for the LSN
//! (assigned at commit, after the WAL write) and the stacked-upsert
//! counter, both of which are atomics so shared references stay cheap.
//!
//! [`apply_upsert`] implements the UPSERT combination contract used by
//! read iterators, the write iterator, and the background squash worker.

#[cfg(test)]
mod tests;

pub mod update;

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, Ordering as AtomicOrdering};

use thiserror::Error;
use tracing::warn;

use crate::keydef::{KeyDef, KeyDefError};
use crate::msgpack::{self, MsgpackError};

pub use update::{apply_update_ops, concat_op_sequences, squash_op_sequences};

/// Stacked-upsert count at which a key is handed to the squash worker.
pub const UPSERT_THRESHOLD: u8 = 128;

/// Counter value marking a key as queued for squash.
pub const UPSERT_PENDING: u8 = u8::MAX;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by statement operations.
#[derive(Debug, Error)]
pub enum StmtError {
    /// MessagePack decoding failure.
    #[error("msgpack error: {0}")]
    Msgpack(#[from] MsgpackError),

    /// Key extraction or comparison failure.
    #[error("key def error: {0}")]
    KeyDef(#[from] KeyDefError),

    /// Malformed update operation.
    #[error("illegal update operation: {0}")]
    IllegalOp(String),

    /// Update operation addresses a field outside the tuple.
    #[error("update field {field} is out of range (tuple has {field_count} fields)")]
    FieldOutOfRange {
        /// One-based field number from the operation.
        field: i64,
        /// Field count of the tuple being updated.
        field_count: u32,
    },

    /// Arithmetic update on a non-numeric field or argument.
    #[error("arithmetic update on non-numeric operand (field {field})")]
    ArithmeticType {
        /// One-based field number from the operation.
        field: i64,
    },

    /// Integer overflow during an arithmetic update.
    #[error("integer overflow in update of field {field}")]
    ArithmeticOverflow {
        /// One-based field number from the operation.
        field: i64,
    },

    /// Operation requires a tuple statement but got a key statement.
    #[error("operation requires a full tuple, statement carries only a key")]
    KeyOnlyStatement,
}

// ------------------------------------------------------------------------------------------------
// Statement
// ------------------------------------------------------------------------------------------------

/// Operation type of a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StmtType {
    /// Full-tuple write.
    Replace,
    /// Key-only deletion marker.
    Delete,
    /// Conditional write: fallback tuple plus update operations.
    Upsert,
    /// Key-only iterator probe.
    Select,
}

/// A single storage statement. See the [module docs](self).
#[derive(Debug)]
pub struct Statement {
    stype: StmtType,
    /// Commit LSN; 0 until assigned.
    lsn: AtomicI64,
    /// Saturating stacked-upsert counter; [`UPSERT_PENDING`] while the
    /// key sits in the squash queue.
    n_upserts: AtomicU8,
    /// Tuple body (`Replace`/`Upsert`) or key array (`Delete`/`Select`).
    data: Box<[u8]>,
    /// Key part count for key-only statements.
    part_count: u32,
    /// Update operations payload for `Upsert`.
    ops: Option<Box<[u8]>>,
}

impl Statement {
    /// Creates a REPLACE from a tuple body.
    pub fn new_replace(data: &[u8]) -> Arc<Statement> {
        Arc::new(Statement {
            stype: StmtType::Replace,
            lsn: AtomicI64::new(0),
            n_upserts: AtomicU8::new(0),
            data: data.into(),
            part_count: 0,
            ops: None,
        })
    }

    /// Creates a DELETE from a key array.
    pub fn new_delete(key: &[u8]) -> Arc<Statement> {
        let part_count = msgpack::read_array_len(key).map(|(c, _)| c).unwrap_or(0);
        Arc::new(Statement {
            stype: StmtType::Delete,
            lsn: AtomicI64::new(0),
            n_upserts: AtomicU8::new(0),
            data: key.into(),
            part_count,
            ops: None,
        })
    }

    /// Creates an UPSERT from a fallback tuple and an operations array.
    pub fn new_upsert(data: &[u8], ops: &[u8]) -> Arc<Statement> {
        Arc::new(Statement {
            stype: StmtType::Upsert,
            lsn: AtomicI64::new(0),
            n_upserts: AtomicU8::new(0),
            data: data.into(),
            part_count: 0,
            ops: Some(ops.into()),
        })
    }

    /// Creates a SELECT probe from a key array.
    pub fn new_select(key: &[u8], part_count: u32) -> Arc<Statement> {
        Arc::new(Statement {
            stype: StmtType::Select,
            lsn: AtomicI64::new(0),
            n_upserts: AtomicU8::new(0),
            data: key.into(),
            part_count,
            ops: None,
        })
    }

    /// Operation type.
    pub fn stmt_type(&self) -> StmtType {
        self.stype
    }

    /// Commit LSN (0 until assigned).
    pub fn lsn(&self) -> i64 {
        self.lsn.load(AtomicOrdering::Acquire)
    }

    /// Assigns the commit LSN.
    pub fn set_lsn(&self, lsn: i64) {
        self.lsn.store(lsn, AtomicOrdering::Release);
    }

    /// Stacked-upsert counter.
    pub fn n_upserts(&self) -> u8 {
        self.n_upserts.load(AtomicOrdering::Acquire)
    }

    /// Sets the stacked-upsert counter.
    pub fn set_n_upserts(&self, n: u8) {
        self.n_upserts.store(n, AtomicOrdering::Release);
    }

    /// Tuple body or key array, depending on the statement type.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Update operations payload (UPSERT only).
    pub fn ops(&self) -> Option<&[u8]> {
        self.ops.as_deref()
    }

    /// Whether the statement carries only a key.
    pub fn is_key_only(&self) -> bool {
        matches!(self.stype, StmtType::Delete | StmtType::Select)
    }

    /// Key part count for key-only statements; for tuple statements the
    /// key def decides.
    pub fn part_count(&self) -> u32 {
        self.part_count
    }

    /// Extracts this statement's key per `key_def`, as a MessagePack
    /// array. Key-only statements return their stored key verbatim.
    pub fn extract_key(&self, key_def: &KeyDef) -> Result<Vec<u8>, StmtError> {
        if self.is_key_only() {
            return Ok(self.data.to_vec());
        }
        Ok(key_def.extract_key(&self.data)?)
    }

    /// Compares two statements by key order under `key_def`.
    pub fn compare(
        a: &Statement,
        b: &Statement,
        key_def: &KeyDef,
    ) -> Result<std::cmp::Ordering, StmtError> {
        Ok(match (a.is_key_only(), b.is_key_only()) {
            (false, false) => key_def.compare_tuples(&a.data, &b.data)?,
            (false, true) => key_def.compare_tuple_with_key(&a.data, &b.data)?,
            (true, false) => key_def
                .compare_tuple_with_key(&b.data, &a.data)?
                .reverse(),
            (true, true) => key_def.compare_keys(&a.data, &b.data)?,
        })
    }

    /// Compares a statement against a key array under `key_def`.
    pub fn compare_with_key(
        stmt: &Statement,
        key: &[u8],
        key_def: &KeyDef,
    ) -> Result<std::cmp::Ordering, StmtError> {
        if stmt.is_key_only() {
            Ok(key_def.compare_keys(&stmt.data, key)?)
        } else {
            Ok(key_def.compare_tuple_with_key(&stmt.data, key)?)
        }
    }

    /// Deep copy with a fresh LSN, used when materializing results.
    fn duplicate_as_replace(&self, lsn: i64) -> Arc<Statement> {
        let stmt = Statement::new_replace(&self.data);
        stmt.set_lsn(lsn);
        stmt
    }
}

// ------------------------------------------------------------------------------------------------
// UPSERT application
// ------------------------------------------------------------------------------------------------

/// Combines an UPSERT with the next older version of the same key.
///
/// - `older` absent or DELETE: the upsert's fallback tuple materializes
///   as a REPLACE.
/// - `older` REPLACE: the update operations run against the older tuple
///   and produce a REPLACE. If the result's primary key (per `key_def`)
///   differs from the older tuple's, the modification is discarded with
///   a diagnostic and the older tuple is carried forward instead.
/// - `older` UPSERT: the two operation sequences are squashed into one
///   when possible, otherwise concatenated (old first), yielding a
///   single UPSERT.
///
/// The result always carries `new_stmt`'s LSN. With `suppress_error`
/// set, malformed individual operations are logged and skipped rather
/// than failing the whole application (the read-path setting).
pub fn apply_upsert(
    new_stmt: &Statement,
    older: Option<&Statement>,
    key_def: &KeyDef,
    suppress_error: bool,
) -> Result<Arc<Statement>, StmtError> {
    debug_assert_eq!(new_stmt.stmt_type(), StmtType::Upsert);
    let lsn = new_stmt.lsn();
    let ops = new_stmt.ops().unwrap_or(&[]);

    let older = match older {
        None => {
            let result = Statement::new_replace(new_stmt.data());
            result.set_lsn(lsn);
            return Ok(result);
        }
        Some(older) if older.stmt_type() == StmtType::Delete => {
            let result = Statement::new_replace(new_stmt.data());
            result.set_lsn(lsn);
            return Ok(result);
        }
        Some(older) => older,
    };

    if older.stmt_type() == StmtType::Upsert {
        let old_ops = older.ops().unwrap_or(&[]);
        let combined = match squash_op_sequences(old_ops, ops)? {
            Some(squashed) => squashed,
            None => concat_op_sequences(old_ops, ops)?,
        };
        let result = Statement::new_upsert(older.data(), &combined);
        result.set_lsn(lsn);
        return Ok(result);
    }

    // older is REPLACE: run the operations against its tuple.
    let updated = apply_update_ops(older.data(), ops, 1, suppress_error)?;

    let old_key = key_def.extract_key(older.data())?;
    let new_key = key_def.extract_key(&updated)?;
    if key_def.compare_keys(&old_key, &new_key)? != std::cmp::Ordering::Equal {
        warn!(
            lsn,
            "upsert operations modify the primary key; modification discarded"
        );
        return Ok(older.duplicate_as_replace(lsn));
    }

    let result = Statement::new_replace(&updated);
    result.set_lsn(lsn);
    Ok(result)
}
