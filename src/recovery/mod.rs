//! Two-phase crash recovery.
//!
//! Recovery drives the engine from OFFLINE to ONLINE in two phases:
//!
//! 1. **Initial recovery** — the latest snapshot is replayed into the
//!    engine, establishing the base state and the starting vclock.
//! 2. **Final recovery** — the xlog suffix (files at or above the
//!    snapshot's vclock signature) is replayed transaction by
//!    transaction.
//!
//! Replay is transaction-atomic: a corrupt row aborts its whole xlog
//! transaction. With the corresponding `panic_*` flag set the replay
//! stops hard; otherwise the cursor scans forward to the next valid
//! magic and continues with a warning.
//!
//! The at-most-once filter for LSM rows (skip a row whose LSN is
//! already covered by an on-disk run of the target range) belongs to
//! the apply callback — recovery itself only knows files and rows.


use std::path::Path;

use thiserror::Error;
use tracing::{info, warn};

use crate::error::BoxError;
use crate::vclock::Vclock;
use crate::xlog::{FileType, Row, Xdir, XlogCursor, XlogError, ROW_INDEX_SPACE_ID};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by recovery.
#[derive(Debug, Error)]
pub enum RecoveryError {
    /// Xlog framing or I/O failure.
    #[error("xlog error: {0}")]
    Xlog(#[from] XlogError),

    /// The apply callback rejected a row.
    #[error("apply error: {0}")]
    Apply(#[from] BoxError),

    /// Method called in the wrong phase.
    #[error("recovery is in phase {0:?}")]
    BadPhase(RecoveryPhase),
}

// ------------------------------------------------------------------------------------------------
// Phases
// ------------------------------------------------------------------------------------------------

/// Recovery progression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPhase {
    /// Nothing replayed yet.
    Offline,
    /// Replaying the local snapshot.
    InitialRecoveryLocal,
    /// Receiving the initial join stream from a master.
    InitialRecoveryRemote,
    /// Replaying the local xlog suffix.
    FinalRecoveryLocal,
    /// Receiving the final join stream from a master.
    FinalRecoveryRemote,
    /// Recovery complete; serving requests.
    Online,
}

/// The recovery driver. See the [module docs](self).
pub struct Recovery {
    phase: RecoveryPhase,
    snap_dir: Xdir,
    wal_dir: Xdir,
    panic_on_snap_error: bool,
    panic_on_wal_error: bool,
    /// Vclock advanced by every applied row.
    vclock: Vclock,
}

impl Recovery {
    /// Creates a driver over the snapshot and WAL directories.
    pub fn new(
        snap_dir: impl AsRef<Path>,
        wal_dir: impl AsRef<Path>,
        panic_on_snap_error: bool,
        panic_on_wal_error: bool,
    ) -> Result<Recovery, RecoveryError> {
        Ok(Recovery {
            phase: RecoveryPhase::Offline,
            snap_dir: Xdir::new(snap_dir, FileType::Snap)?,
            wal_dir: Xdir::new(wal_dir, FileType::Xlog)?,
            panic_on_snap_error,
            panic_on_wal_error,
            vclock: Vclock::new(),
        })
    }

    /// Current phase.
    pub fn phase(&self) -> RecoveryPhase {
        self.phase
    }

    /// Vclock accumulated so far.
    pub fn vclock(&self) -> &Vclock {
        &self.vclock
    }

    /// Phase 1: replays the newest snapshot, feeding every row to
    /// `apply`. Returns the snapshot's signature, or `None` on a fresh
    /// directory (bootstrap).
    pub fn recover_snapshot(
        &mut self,
        mut apply: impl FnMut(&Row) -> Result<(), BoxError>,
    ) -> Result<Option<i64>, RecoveryError> {
        if self.phase != RecoveryPhase::Offline {
            return Err(RecoveryError::BadPhase(self.phase));
        }
        self.phase = RecoveryPhase::InitialRecoveryLocal;

        let Some((signature, path)) = self.snap_dir.scan()?.into_iter().next_back() else {
            info!("no snapshot found, bootstrapping an empty engine");
            return Ok(None);
        };
        info!(path = %path.display(), signature, "replaying snapshot");

        let mut cursor = XlogCursor::open_expect(&path, FileType::Snap)?;
        self.vclock = cursor.meta().vclock.clone();
        let rows =
            replay_file(&mut cursor, self.panic_on_snap_error, &mut self.vclock, &mut apply)?;
        info!(rows, "snapshot replayed");
        Ok(Some(signature))
    }

    /// Phase 2: replays the xlog suffix at or above `from_signature`.
    /// Returns the number of applied rows.
    pub fn recover_wals(
        &mut self,
        from_signature: i64,
        mut apply: impl FnMut(&Row) -> Result<(), BoxError>,
    ) -> Result<u64, RecoveryError> {
        if self.phase != RecoveryPhase::InitialRecoveryLocal {
            return Err(RecoveryError::BadPhase(self.phase));
        }
        self.phase = RecoveryPhase::FinalRecoveryLocal;

        let mut total = 0u64;
        for (signature, path) in self.wal_dir.scan()? {
            if signature < from_signature {
                continue;
            }
            info!(path = %path.display(), signature, "replaying xlog");
            let mut cursor = XlogCursor::open_expect(&path, FileType::Xlog)?;
            total +=
                replay_file(&mut cursor, self.panic_on_wal_error, &mut self.vclock, &mut apply)?;
        }
        info!(rows = total, "xlog suffix replayed");
        Ok(total)
    }

    /// Marks the join phases for a replica bootstrapping off a master.
    pub fn enter_remote(&mut self, final_phase: bool) {
        self.phase = if final_phase {
            RecoveryPhase::FinalRecoveryRemote
        } else {
            RecoveryPhase::InitialRecoveryRemote
        };
    }

    /// Completes recovery.
    pub fn finish(&mut self) -> &Vclock {
        self.phase = RecoveryPhase::Online;
        info!(vclock = %self.vclock, "recovery complete, engine online");
        &self.vclock
    }
}

/// Replays every transaction of one file. Transactions are applied
/// atomically: rows are decoded first, then fed to `apply` in order. A
/// corrupt transaction either stops the replay (`panic_if_error`) or
/// is skipped whole with a scan to the next magic.
fn replay_file(
    cursor: &mut XlogCursor,
    panic_if_error: bool,
    vclock: &mut Vclock,
    apply: &mut impl FnMut(&Row) -> Result<(), BoxError>,
) -> Result<u64, RecoveryError> {
    let mut applied = 0u64;
    loop {
        match cursor.next_tx() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) if panic_if_error => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "corrupt xlog transaction, scanning for next magic");
                if cursor.skip_to_next_tx() {
                    continue;
                }
                break;
            }
        }

        // Decode the whole transaction before applying anything.
        let mut rows = Vec::new();
        let decode_result = loop {
            match cursor.next_row() {
                Ok(Some(row)) => {
                    if row.space_id == Some(ROW_INDEX_SPACE_ID) {
                        continue;
                    }
                    rows.push(row);
                }
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };
        match decode_result {
            Ok(()) => {}
            Err(e) if panic_if_error => return Err(e.into()),
            Err(e) => {
                // The framing was valid, only a row inside is broken:
                // drop the whole transaction and move to the next one.
                warn!(error = %e, "corrupt row, discarding its whole transaction");
                continue;
            }
        }

        for row in &rows {
            apply(row)?;
            vclock.follow(row.server_id, row.lsn);
            applied += 1;
        }
    }
    Ok(applied)
}
