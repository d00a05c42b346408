//! Iterator over a transaction's own write set.

use std::sync::Arc;

use crate::keydef::KeyDef;
use crate::stmt::Statement;

use super::{IteratorError, IteratorType, RestoreResult, StmtIterator};

/// Snapshot provider for the write set of one `(tx, index)` pair:
/// returns the statements sorted by key plus the write-set version.
pub type TxwSnapshotFn = dyn Fn() -> (Vec<Arc<Statement>>, u64) + Send + Sync;

/// Iterator over the uncommitted writes of one transaction, restricted
/// to one index.
///
/// A write set holds at most one statement per key, so there is no
/// version chain: [`StmtIterator::next_lsn`] always reports the key as
/// exhausted. The set is mutable (the transaction keeps writing while
/// its own cursors are open), so [`StmtIterator::restore`] re-snapshots
/// whenever the provider reports a new version.
pub struct TxwIterator {
    key_def: Arc<KeyDef>,
    itype: IteratorType,
    key: Vec<u8>,
    snapshot: Arc<TxwSnapshotFn>,
    entries: Vec<Arc<Statement>>,
    version: u64,
    /// Index of the current entry, `None` before the first `next_key`.
    at: Option<usize>,
    eof: bool,
    closed: bool,
}

impl TxwIterator {
    /// Creates an iterator over the snapshot produced by `snapshot`.
    pub fn new(
        key_def: Arc<KeyDef>,
        itype: IteratorType,
        key: &[u8],
        snapshot: Arc<TxwSnapshotFn>,
    ) -> TxwIterator {
        let (entries, version) = snapshot();
        TxwIterator {
            key_def,
            itype,
            key: key.to_vec(),
            snapshot,
            entries,
            version,
            at: None,
            eof: false,
            closed: false,
        }
    }

    fn matches(&self, stmt: &Statement) -> Result<bool, IteratorError> {
        if self.key.is_empty() {
            return Ok(true);
        }
        let cmp = Statement::compare_with_key(stmt, &self.key, &self.key_def)?;
        Ok(match self.itype {
            IteratorType::Eq | IteratorType::Req => cmp == std::cmp::Ordering::Equal,
            IteratorType::Ge => cmp != std::cmp::Ordering::Less,
            IteratorType::Gt => cmp == std::cmp::Ordering::Greater,
            IteratorType::Le => cmp != std::cmp::Ordering::Greater,
            IteratorType::Lt => cmp == std::cmp::Ordering::Less,
            IteratorType::All => true,
        })
    }

    fn advance(&mut self) -> Option<usize> {
        let next = match (self.at, self.itype.is_forward()) {
            (None, true) => 0,
            (Some(i), true) => i + 1,
            (None, false) => self.entries.len().checked_sub(1)?,
            (Some(i), false) => i.checked_sub(1)?,
        };
        if next < self.entries.len() { Some(next) } else { None }
    }

    fn seek_past(&mut self, last: &Statement) -> Result<(), IteratorError> {
        let last_key = last.extract_key(&self.key_def)?;
        let forward = self.itype.is_forward();
        let mut positioned = None;
        for (i, stmt) in self.entries.iter().enumerate() {
            let cmp = Statement::compare_with_key(stmt, &last_key, &self.key_def)?;
            if forward {
                if cmp != std::cmp::Ordering::Greater {
                    positioned = Some(i);
                }
            } else if cmp != std::cmp::Ordering::Less && positioned.is_none() {
                positioned = Some(i);
            }
        }
        self.at = positioned;
        self.eof = false;
        Ok(())
    }
}

impl StmtIterator for TxwIterator {
    fn next_key(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        if self.closed || self.eof {
            return Ok(None);
        }
        loop {
            let Some(at) = self.advance() else {
                self.eof = true;
                return Ok(None);
            };
            self.at = Some(at);
            let stmt = Arc::clone(&self.entries[at]);
            if self.matches(&stmt)? {
                return Ok(Some(stmt));
            }
            if self.itype.is_exact() && self.at.is_some() {
                // Entries are sorted; once past the exact key there is
                // nothing further to find in this direction.
                let cmp = Statement::compare_with_key(&stmt, &self.key, &self.key_def)?;
                let past = if self.itype.is_forward() {
                    cmp == std::cmp::Ordering::Greater
                } else {
                    cmp == std::cmp::Ordering::Less
                };
                if past {
                    self.eof = true;
                    return Ok(None);
                }
            }
        }
    }

    fn next_lsn(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        // One statement per key in a write set.
        Ok(None)
    }

    fn restore(&mut self, last: Option<&Statement>) -> Result<RestoreResult, IteratorError> {
        if self.closed {
            return Ok(RestoreResult::Unchanged);
        }
        let (entries, version) = (self.snapshot)();
        if version == self.version {
            return Ok(RestoreResult::Unchanged);
        }
        self.entries = entries;
        self.version = version;
        match last {
            Some(last) => self.seek_past(last)?,
            None => {
                self.at = None;
                self.eof = false;
            }
        }
        Ok(RestoreResult::Changed)
    }

    fn close(&mut self) {
        self.closed = true;
        self.entries = Vec::new();
    }
}
