//! MVCC transactions and the conflict manager.
//!
//! Transactions follow serializable-snapshot semantics:
//!
//! - A read-only transaction takes a **read view** at begin: it sees
//!   exactly the state at `manager.lsn` and can never conflict.
//! - A read-write transaction reads the latest committed state
//!   (`vlsn = ∞`) and records every read — including negative lookups,
//!   marked as *gap* reads — in the per-index read set.
//! - When a writer prepares, every transaction that read one of its
//!   written keys is marked aborted (a DELETE does not conflict with a
//!   gap read). An aborted reader that was still at `vlsn = ∞` is
//!   snapshotted into a read view at the current committed LSN, so it
//!   can finish read-only; if it later prepares with writes of its own
//!   it fails with a conflict.
//!
//! The write set holds at most one statement per `(index, key)`; the
//! transaction log records every read and write in insertion order so
//! a savepoint rollback can undo both.


use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;
use tracing::{debug, trace};

use crate::error::{BoxError, ErrorCode};
use crate::range::{LsmIndex, RangeError, UpsertOutcome};
use crate::stmt::{Statement, StmtError, StmtType};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by transaction operations.
#[derive(Debug, Error)]
pub enum TxError {
    /// The transaction lost a conflict and cannot commit its writes.
    #[error("transaction conflict")]
    Conflict,

    /// Operation on a transaction that is no longer active.
    #[error("transaction is not active")]
    NotActive,

    /// Statement failure.
    #[error("statement error: {0}")]
    Stmt(#[from] StmtError),

    /// Range subsystem failure.
    #[error("range error: {0}")]
    Range(#[from] RangeError),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<TxError> for BoxError {
    fn from(e: TxError) -> BoxError {
        let code = match &e {
            TxError::Conflict => ErrorCode::TransactionConflict,
            TxError::NotActive => ErrorCode::NoActiveTransaction,
            _ => ErrorCode::Internal,
        };
        BoxError::new(code, e.to_string())
    }
}

// ------------------------------------------------------------------------------------------------
// Identifiers and records
// ------------------------------------------------------------------------------------------------

/// Identity of an index inside the conflict manager.
pub type IndexIdent = (u32, u32); // (space_id, index_id)

/// State of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    /// Accepting reads and writes.
    Ready,
    /// Prepared and committed (or committing).
    Commit,
    /// Rolled back.
    Rollback,
}

/// One write-set entry.
#[derive(Clone)]
struct WriteEntry {
    index: Arc<LsmIndex>,
    stmt: Arc<Statement>,
}

/// One transaction-log record, in insertion order.
enum LogEntry {
    /// A tracked read; reversed on savepoint rollback.
    Read {
        index: IndexIdent,
        key: Vec<u8>,
    },
    /// A write; `prev` restores the overwritten entry on rollback.
    Write {
        index: IndexIdent,
        key: Vec<u8>,
        prev: Option<WriteEntry>,
    },
}

struct TxBody {
    state: TxState,
    /// Write set, unique by (index, key).
    writes: BTreeMap<(IndexIdent, Vec<u8>), WriteEntry>,
    log: Vec<LogEntry>,
    /// Bumped on every write-set change; txw iterators re-snapshot on it.
    write_version: u64,
}

/// Shared core of one transaction, reachable from the conflict manager.
pub struct TxShared {
    /// Transaction sequence number, unique per begin.
    pub tsn: i64,
    is_ro: bool,
    /// Read-view LSN; `i64::MAX` means "read latest".
    vlsn: AtomicI64,
    aborted: AtomicBool,
    body: Mutex<TxBody>,
}

impl TxShared {
    /// Upper bound on LSNs visible to this transaction.
    pub fn vlsn(&self) -> i64 {
        self.vlsn.load(AtomicOrdering::Acquire)
    }

    /// Whether a conflicting writer committed under this transaction.
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(AtomicOrdering::Acquire)
    }

    fn body(&self) -> Result<std::sync::MutexGuard<'_, TxBody>, TxError> {
        self.body
            .lock()
            .map_err(|_| TxError::Internal("mutex poisoned".into()))
    }
}

/// A read-set record: who read the key and how.
struct ReadRecord {
    tx: Weak<TxShared>,
    is_gap: bool,
}

// ------------------------------------------------------------------------------------------------
// Manager
// ------------------------------------------------------------------------------------------------

/// The cross-engine transaction manager: tsn allocation, the committed
/// LSN, the read-view tree, and the per-index read sets.
pub struct TxManager {
    tsn: AtomicI64,
    lsn: AtomicI64,
    /// Active read views, keyed by `(vlsn, tsn)`.
    read_views: Mutex<BTreeSet<(i64, i64)>>,
    /// Per-index read sets: `(key, tsn) → record`.
    read_sets: Mutex<HashMap<IndexIdent, BTreeMap<(Vec<u8>, i64), ReadRecord>>>,
    rw_count: AtomicI64,
    ro_count: AtomicI64,
}

impl TxManager {
    /// Creates a manager with the committed LSN at 0.
    pub fn new() -> Arc<TxManager> {
        Arc::new(TxManager {
            tsn: AtomicI64::new(0),
            lsn: AtomicI64::new(0),
            read_views: Mutex::new(BTreeSet::new()),
            read_sets: Mutex::new(HashMap::new()),
            rw_count: AtomicI64::new(0),
            ro_count: AtomicI64::new(0),
        })
    }

    /// Last committed LSN.
    pub fn lsn(&self) -> i64 {
        self.lsn.load(AtomicOrdering::Acquire)
    }

    /// Advances the committed LSN (recovery and commit path).
    pub fn set_lsn(&self, lsn: i64) {
        self.lsn.fetch_max(lsn, AtomicOrdering::AcqRel);
    }

    /// Oldest read-view LSN still held by some transaction, or
    /// `i64::MAX` when no read views exist. Dumps and compactions must
    /// preserve versions visible at this LSN.
    pub fn min_vlsn(&self) -> i64 {
        self.read_views
            .lock()
            .ok()
            .and_then(|views| views.first().map(|(vlsn, _)| *vlsn))
            .unwrap_or(i64::MAX)
    }

    /// Active transaction counts `(rw, ro)`.
    pub fn counts(&self) -> (i64, i64) {
        (
            self.rw_count.load(AtomicOrdering::Acquire),
            self.ro_count.load(AtomicOrdering::Acquire),
        )
    }

    /// Begins a transaction. Read-only transactions take their read
    /// view immediately; read-write transactions read the latest state
    /// until a conflict forces them into a view.
    pub fn begin(self: &Arc<TxManager>, read_only: bool) -> Tx {
        let tsn = self.tsn.fetch_add(1, AtomicOrdering::AcqRel) + 1;
        let vlsn = if read_only { self.lsn() } else { i64::MAX };
        let shared = Arc::new(TxShared {
            tsn,
            is_ro: read_only,
            vlsn: AtomicI64::new(vlsn),
            aborted: AtomicBool::new(false),
            body: Mutex::new(TxBody {
                state: TxState::Ready,
                writes: BTreeMap::new(),
                log: Vec::new(),
                write_version: 0,
            }),
        });
        if read_only {
            self.ro_count.fetch_add(1, AtomicOrdering::AcqRel);
            if let Ok(mut views) = self.read_views.lock() {
                views.insert((vlsn, tsn));
            }
        } else {
            self.rw_count.fetch_add(1, AtomicOrdering::AcqRel);
        }
        trace!(tsn, read_only, "transaction begun");
        Tx {
            manager: Arc::clone(self),
            shared,
        }
    }

    fn with_read_set<R>(
        &self,
        index: IndexIdent,
        f: impl FnOnce(&mut BTreeMap<(Vec<u8>, i64), ReadRecord>) -> R,
    ) -> Result<R, TxError> {
        let mut sets = self
            .read_sets
            .lock()
            .map_err(|_| TxError::Internal("mutex poisoned".into()))?;
        Ok(f(sets.entry(index).or_default()))
    }

    fn drop_read_view(&self, vlsn: i64, tsn: i64) {
        if let Ok(mut views) = self.read_views.lock() {
            views.remove(&(vlsn, tsn));
        }
    }

    /// Forces `reader` into a read view at the current committed LSN.
    fn send_to_read_view(&self, reader: &TxShared) {
        let lsn = self.lsn();
        if reader
            .vlsn
            .compare_exchange(
                i64::MAX,
                lsn,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_ok()
        {
            if let Ok(mut views) = self.read_views.lock() {
                views.insert((lsn, reader.tsn));
            }
            debug!(tsn = reader.tsn, vlsn = lsn, "reader sent to read view");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Transaction handle
// ------------------------------------------------------------------------------------------------

/// One transaction. Dropping without commit rolls back.
pub struct Tx {
    manager: Arc<TxManager>,
    shared: Arc<TxShared>,
}

impl Tx {
    /// Transaction sequence number.
    pub fn tsn(&self) -> i64 {
        self.shared.tsn
    }

    /// Read-view LSN (`i64::MAX` = latest).
    pub fn vlsn(&self) -> i64 {
        self.shared.vlsn()
    }

    /// Whether this transaction has been marked aborted by a
    /// conflicting committer.
    pub fn is_aborted(&self) -> bool {
        self.shared.is_aborted()
    }

    /// Whether this transaction was begun read-only.
    pub fn is_ro(&self) -> bool {
        self.shared.is_ro
    }

    /// Current state.
    pub fn state(&self) -> TxState {
        self.shared
            .body()
            .map(|b| b.state)
            .unwrap_or(TxState::Rollback)
    }

    /// Records a read of `key` on `index`. `is_gap` marks a negative
    /// lookup (the key did not exist). Reads of keys the transaction
    /// itself wrote as REPLACE or DELETE are not tracked — the write
    /// already shields them.
    pub fn track_read(
        &self,
        index: &Arc<LsmIndex>,
        key: &[u8],
        is_gap: bool,
    ) -> Result<(), TxError> {
        if self.shared.is_ro {
            return Ok(()); // read views cannot conflict
        }
        let ident = (index.space_id, index.index_id);
        let mut body = self.shared.body()?;
        if body.state != TxState::Ready {
            return Err(TxError::NotActive);
        }
        if let Some(entry) = body.writes.get(&(ident, key.to_vec()))
            && matches!(
                entry.stmt.stmt_type(),
                StmtType::Replace | StmtType::Delete
            )
        {
            return Ok(());
        }
        self.manager.with_read_set(ident, |set| {
            set.insert(
                (key.to_vec(), self.shared.tsn),
                ReadRecord {
                    tx: Arc::downgrade(&self.shared),
                    is_gap,
                },
            );
        })?;
        body.log.push(LogEntry::Read {
            index: ident,
            key: key.to_vec(),
        });
        Ok(())
    }

    /// Buffers a write. The statement replaces any previous write of
    /// the same `(index, key)`.
    pub fn write(
        &self,
        index: &Arc<LsmIndex>,
        key: Vec<u8>,
        stmt: Arc<Statement>,
    ) -> Result<(), TxError> {
        let ident = (index.space_id, index.index_id);
        let mut body = self.shared.body()?;
        if body.state != TxState::Ready {
            return Err(TxError::NotActive);
        }
        let prev = body.writes.insert(
            (ident, key.clone()),
            WriteEntry {
                index: Arc::clone(index),
                stmt,
            },
        );
        body.log.push(LogEntry::Write {
            index: ident,
            key,
            prev,
        });
        body.write_version += 1;
        Ok(())
    }

    /// Snapshot of this transaction's writes on one index, sorted by
    /// key, plus the write-set version. Feed for the txw iterator.
    pub fn writes_for(
        &self,
        index: &Arc<LsmIndex>,
    ) -> Result<(Vec<Arc<Statement>>, u64), TxError> {
        Ok(writes_snapshot(&self.shared, index))
    }

    /// A reusable snapshot provider over this transaction's writes on
    /// one index, for wiring into read iterators.
    pub fn txw_snapshot_fn(
        &self,
        index: &Arc<LsmIndex>,
    ) -> Arc<dyn Fn() -> (Vec<Arc<Statement>>, u64) + Send + Sync> {
        let shared = Arc::clone(&self.shared);
        let index = Arc::clone(index);
        Arc::new(move || writes_snapshot(&shared, &index))
    }

    /// Number of buffered writes.
    pub fn write_count(&self) -> usize {
        self.shared.body().map(|b| b.writes.len()).unwrap_or(0)
    }

    /// Surviving writes in insertion order — the exact order
    /// [`Tx::commit`] will apply them and the WAL must log them.
    pub fn writes_in_order(&self) -> Result<Vec<(Arc<LsmIndex>, Arc<Statement>)>, TxError> {
        let body = self.shared.body()?;
        let mut seen: BTreeSet<(IndexIdent, Vec<u8>)> = BTreeSet::new();
        let mut out = Vec::new();
        for entry in &body.log {
            let LogEntry::Write { index, key, .. } = entry else {
                continue;
            };
            if !seen.insert((*index, key.clone())) {
                continue;
            }
            if let Some(write) = body.writes.get(&(*index, key.clone())) {
                out.push((Arc::clone(&write.index), Arc::clone(&write.stmt)));
            }
        }
        Ok(out)
    }

    /// Opens a savepoint: the current log position.
    pub fn savepoint(&self) -> Result<usize, TxError> {
        Ok(self.shared.body()?.log.len())
    }

    /// Rolls back to a savepoint, reversing reads and writes made
    /// after it.
    pub fn rollback_to(&self, savepoint: usize) -> Result<(), TxError> {
        let mut body = self.shared.body()?;
        if body.state != TxState::Ready {
            return Err(TxError::NotActive);
        }
        while body.log.len() > savepoint {
            let Some(entry) = body.log.pop() else {
                break;
            };
            match entry {
                LogEntry::Read { index, key } => {
                    self.manager.with_read_set(index, |set| {
                        set.remove(&(key, self.shared.tsn));
                    })?;
                }
                LogEntry::Write { index, key, prev } => {
                    match prev {
                        Some(prev) => {
                            body.writes.insert((index, key), prev);
                        }
                        None => {
                            body.writes.remove(&(index, key));
                        }
                    }
                    body.write_version += 1;
                }
            }
        }
        Ok(())
    }

    /// Prepares the transaction: resolves conflicts against readers of
    /// its written keys and transitions to COMMIT.
    ///
    /// Fails with [`TxError::Conflict`] when this transaction was
    /// itself aborted by an earlier committer and has writes to make.
    pub fn prepare(&self) -> Result<(), TxError> {
        let mut body = self.shared.body()?;
        if body.state != TxState::Ready {
            return Err(TxError::NotActive);
        }
        if self.shared.is_aborted() && !body.writes.is_empty() {
            body.state = TxState::Rollback;
            drop(body);
            self.cleanup();
            return Err(TxError::Conflict);
        }

        // Abort every reader of a key we are about to overwrite.
        for ((ident, key), entry) in body.writes.iter() {
            let is_delete = entry.stmt.stmt_type() == StmtType::Delete;
            self.manager.with_read_set(*ident, |set| {
                let from = (key.clone(), i64::MIN);
                let to = (key.clone(), i64::MAX);
                for ((_, tsn), record) in set.range(from..=to) {
                    if *tsn == self.shared.tsn {
                        continue;
                    }
                    if is_delete && record.is_gap {
                        // Deleting a key nobody saw cannot invalidate a
                        // negative lookup.
                        continue;
                    }
                    if let Some(reader) = record.tx.upgrade() {
                        reader.aborted.store(true, AtomicOrdering::Release);
                        self.manager.send_to_read_view(&reader);
                        debug!(
                            reader_tsn = reader.tsn,
                            writer_tsn = self.shared.tsn,
                            "reader aborted by conflicting write"
                        );
                    }
                }
            })?;
        }

        body.state = TxState::Commit;
        drop(body);
        self.manager
            .drop_read_view(self.shared.vlsn(), self.shared.tsn);
        Ok(())
    }

    /// Commits prepared writes: assigns LSNs starting at `first_lsn`
    /// in insertion order, applies each statement to its index, and
    /// advances the manager's committed LSN.
    ///
    /// Returns the keys whose upsert chains want squashing, paired with
    /// their indexes, and the total bytes applied (for quota
    /// accounting).
    pub fn commit(
        &self,
        first_lsn: i64,
    ) -> Result<(Vec<(Arc<LsmIndex>, Vec<u8>)>, usize), TxError> {
        let body = self.shared.body()?;
        if body.state != TxState::Commit {
            return Err(TxError::NotActive);
        }

        // Apply in insertion order: walk the log, taking the surviving
        // write-set entry the first time each (index, key) appears.
        let mut applied: BTreeSet<(IndexIdent, Vec<u8>)> = BTreeSet::new();
        let mut squash = Vec::new();
        let mut bytes = 0usize;
        let mut lsn = first_lsn;
        for entry in &body.log {
            let LogEntry::Write { index, key, .. } = entry else {
                continue;
            };
            if !applied.insert((*index, key.clone())) {
                continue;
            }
            let Some(write) = body.writes.get(&(*index, key.clone())) else {
                continue; // undone by a savepoint rollback
            };
            write.stmt.set_lsn(lsn);
            lsn += 1;
            bytes += write.stmt.data().len() + write.stmt.ops().map_or(0, <[u8]>::len);
            if let UpsertOutcome::NeedsSquash(key) = write.index.set(Arc::clone(&write.stmt))? {
                squash.push((Arc::clone(&write.index), key));
            }
        }
        let last = lsn - 1;
        if last >= first_lsn {
            self.manager.set_lsn(last);
        }
        drop(body);
        self.cleanup();
        trace!(tsn = self.shared.tsn, first_lsn, last_lsn = last, "transaction committed");
        Ok((squash, bytes))
    }

    /// Rolls the transaction back.
    pub fn rollback(&self) -> Result<(), TxError> {
        let mut body = self.shared.body()?;
        if body.state != TxState::Ready {
            return Ok(());
        }
        body.state = TxState::Rollback;
        drop(body);
        self.cleanup();
        Ok(())
    }

    /// Removes this transaction's traces from the manager.
    fn cleanup(&self) {
        if let Ok(body) = self.shared.body() {
            for entry in &body.log {
                if let LogEntry::Read { index, key } = entry {
                    let _ = self.manager.with_read_set(*index, |set| {
                        set.remove(&(key.clone(), self.shared.tsn));
                    });
                }
            }
        }
        self.manager
            .drop_read_view(self.shared.vlsn(), self.shared.tsn);
        if self.shared.is_ro {
            self.manager.ro_count.fetch_sub(1, AtomicOrdering::AcqRel);
        } else {
            self.manager.rw_count.fetch_sub(1, AtomicOrdering::AcqRel);
        }
    }
}

impl Drop for Tx {
    fn drop(&mut self) {
        if self.state() == TxState::Ready {
            let _ = self.rollback();
        }
    }
}

/// Key-sorted snapshot of one index's writes plus the write-set
/// version. Shared by [`Tx::writes_for`] and the iterator provider.
fn writes_snapshot(
    shared: &Arc<TxShared>,
    index: &Arc<LsmIndex>,
) -> (Vec<Arc<Statement>>, u64) {
    let ident = (index.space_id, index.index_id);
    let key_def = Arc::clone(index.key_def());
    let Ok(body) = shared.body() else {
        return (Vec::new(), 0);
    };
    let mut entries: Vec<(Vec<u8>, Arc<Statement>)> = body
        .writes
        .iter()
        .filter(|((id, _), _)| *id == ident)
        .map(|((_, key), entry)| (key.clone(), Arc::clone(&entry.stmt)))
        .collect();
    entries.sort_by(|(a, _), (b, _)| {
        key_def.compare_keys(a, b).unwrap_or_else(|_| a.cmp(b))
    });
    (
        entries.into_iter().map(|(_, stmt)| stmt).collect(),
        body.write_version,
    )
}
