//! The iterator stack.
//!
//! Every source of statements — an on-disk run, an in-memory tree, a
//! transaction's write set — exposes the same contract
//! ([`StmtIterator`]): `next_key` advances to the newest visible
//! version of the next distinct key, `next_lsn` surfaces older
//! versions of the current key, and `restore` repositions after the
//! underlying store changed under the iterator.
//!
//! On top of the sources sit:
//!
//! - [`MergeIterator`](merge::MergeIterator) — composes N sources in
//!   `(key, lsn)` order with a front-marker batching equal-key sources.
//! - [`ReadIterator`](read::ReadIterator) — drives ranges in iteration
//!   order, applies UPSERT chains, and hides DELETEs; this is what a
//!   SELECT sees.
//! - [`WriteIterator`](write::WriteIterator) — the dump/compaction
//!   pipeline: passes through versions still visible to some reader,
//!   squashes at the `oldest_vlsn` boundary, and discards the rest.

pub mod mem;
pub mod merge;
pub mod read;
pub mod run;
pub mod txw;
pub mod write;

#[cfg(test)]
mod tests;

use std::sync::Arc;

use thiserror::Error;

use crate::keydef::KeyDefError;
use crate::mem::MemError;
use crate::range::RangeError;
use crate::run::RunError;
use crate::stmt::{Statement, StmtError};

pub use mem::MemIterator;
pub use merge::MergeIterator;
pub use read::ReadIterator;
pub use run::RunIterator;
pub use txw::TxwIterator;
pub use write::WriteIterator;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by the iterator stack.
#[derive(Debug, Error)]
pub enum IteratorError {
    /// Mem subsystem failure.
    #[error("mem error: {0}")]
    Mem(#[from] MemError),

    /// Run subsystem failure.
    #[error("run error: {0}")]
    Run(#[from] RunError),

    /// Statement failure.
    #[error("statement error: {0}")]
    Stmt(#[from] StmtError),

    /// Key comparison failure.
    #[error("key def error: {0}")]
    KeyDef(#[from] KeyDefError),

    /// Range subsystem failure.
    #[error("range error: {0}")]
    Range(#[from] RangeError),
}

// ------------------------------------------------------------------------------------------------
// Contract
// ------------------------------------------------------------------------------------------------

/// Direction and matching rule of an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IteratorType {
    /// Exactly the given key, newest version first.
    Eq,
    /// Exactly the given key, reverse direction.
    Req,
    /// Keys ≥ the given key. An empty key starts at −∞.
    Ge,
    /// Keys > the given key. An empty key starts at −∞.
    Gt,
    /// Keys ≤ the given key, descending. An empty key starts at +∞.
    Le,
    /// Keys < the given key, descending. An empty key starts at +∞.
    Lt,
    /// Every key, ascending.
    All,
}

impl IteratorType {
    /// Whether iteration proceeds in ascending key order.
    pub fn is_forward(self) -> bool {
        matches!(
            self,
            IteratorType::Eq | IteratorType::Ge | IteratorType::Gt | IteratorType::All
        )
    }

    /// Whether keys equal to the search key are excluded.
    pub fn excludes_equal(self) -> bool {
        matches!(self, IteratorType::Gt | IteratorType::Lt)
    }

    /// Whether only keys equal to the search key match.
    pub fn is_exact(self) -> bool {
        matches!(self, IteratorType::Eq | IteratorType::Req)
    }
}

/// Result of [`StmtIterator::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreResult {
    /// The source did not change; the position is intact.
    Unchanged,
    /// The source changed; the iterator repositioned itself after the
    /// last returned statement.
    Changed,
}

/// The uniform statement-source contract.
pub trait StmtIterator: Send {
    /// Advances to the next distinct key in iteration order and
    /// returns its newest visible version, or `None` at EOF.
    fn next_key(&mut self) -> Result<Option<Arc<Statement>>, IteratorError>;

    /// Returns the next older visible version of the current key, or
    /// `None` when the key is exhausted.
    fn next_lsn(&mut self) -> Result<Option<Arc<Statement>>, IteratorError>;

    /// Re-checks the underlying store; after `Changed`, the iterator is
    /// positioned so the next [`StmtIterator::next_key`] returns the
    /// first key strictly after `last` in iteration order.
    fn restore(&mut self, last: Option<&Statement>) -> Result<RestoreResult, IteratorError>;

    /// Releases resources; further calls return EOF.
    fn close(&mut self);
}
