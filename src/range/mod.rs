//! Ranges — key-interval partitions of one LSM index.
//!
//! Every index owns a set of ranges forming a contiguous cover of
//! `(−∞, +∞)` with no gaps and no overlaps. A range holds one active
//! mem absorbing writes, a list of frozen mems awaiting dump, and a
//! list of on-disk runs (newest first). During compaction the new
//! ranges carry a `shadow` reference to the range they replace so
//! readers never skip keys mid-publication.
//!
//! [`LsmIndex`] is the per-index container: the sorted range list, id
//! allocation for ranges and runs, a structural version for iterator
//! invalidation, and crash recovery of the range set from the on-disk
//! `.index` files.

#[cfg(test)]
mod tests;

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::keydef::{KeyDef, KeyDefError};
use crate::mem::{MemError, VyMem};
use crate::run::{Run, RunError};
use crate::stmt::{
    apply_upsert, Statement, StmtError, StmtType, UPSERT_PENDING, UPSERT_THRESHOLD,
};
use crate::xlog;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by range and index operations.
#[derive(Debug, Error)]
pub enum RangeError {
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

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Bound helpers
// ------------------------------------------------------------------------------------------------

/// Compares two begin bounds; `None` is −∞.
pub fn cmp_begin(
    key_def: &KeyDef,
    a: Option<&[u8]>,
    b: Option<&[u8]>,
) -> Result<Ordering, KeyDefError> {
    Ok(match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => key_def.compare_keys(a, b)?,
    })
}

/// Compares two end bounds; `None` is +∞.
pub fn cmp_end(
    key_def: &KeyDef,
    a: Option<&[u8]>,
    b: Option<&[u8]>,
) -> Result<Ordering, KeyDefError> {
    Ok(match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Greater,
        (Some(_), None) => Ordering::Less,
        (Some(a), Some(b)) => key_def.compare_keys(a, b)?,
    })
}

/// Whether `key` falls in `[begin, end)`.
pub fn key_in_range(
    key_def: &KeyDef,
    key: &[u8],
    begin: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Result<bool, KeyDefError> {
    if let Some(begin) = begin
        && key_def.compare_keys(key, begin)? == Ordering::Less
    {
        return Ok(false);
    }
    if let Some(end) = end
        && key_def.compare_keys(key, end)? != Ordering::Less
    {
        return Ok(false);
    }
    Ok(true)
}

// ------------------------------------------------------------------------------------------------
// Range
// ------------------------------------------------------------------------------------------------

/// Outcome of [`VyRange::set_upsert`].
#[derive(Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// Statement applied; nothing else to do.
    Done,
    /// The key's upsert chain crossed the squash threshold; the caller
    /// must enqueue the key (a MessagePack array) for the squash worker.
    NeedsSquash(Vec<u8>),
}

struct RangeState {
    active: Arc<VyMem>,
    /// Frozen mems, newest first.
    frozen: Vec<Arc<VyMem>>,
    /// On-disk runs, newest first.
    runs: Vec<Arc<Run>>,
    /// During compaction of this range's predecessor: the range being
    /// compacted away, still serving reads.
    shadow: Option<Arc<VyRange>>,
    /// Ids of the ranges a compaction of this range is producing.
    new_range_ids: Vec<u32>,
    /// Completed compactions of this range.
    compact_count: u32,
    in_dump: bool,
    in_compact: bool,
}

/// One `[begin, end)` partition of an index.
pub struct VyRange {
    /// Range id, unique within the index.
    pub id: u32,
    begin: Option<Vec<u8>>,
    end: Option<Vec<u8>>,
    key_def: Arc<KeyDef>,
    state: RwLock<RangeState>,
    /// Bumped on every structural change (freeze, run publication).
    version: AtomicU32,
}

impl VyRange {
    /// Creates a range with a fresh empty active mem.
    pub fn new(
        id: u32,
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
        key_def: Arc<KeyDef>,
    ) -> Arc<VyRange> {
        Arc::new(VyRange {
            id,
            begin,
            end,
            key_def: Arc::clone(&key_def),
            state: RwLock::new(RangeState {
                active: VyMem::new(key_def),
                frozen: Vec::new(),
                runs: Vec::new(),
                shadow: None,
                new_range_ids: Vec::new(),
                compact_count: 0,
                in_dump: false,
                in_compact: false,
            }),
            version: AtomicU32::new(0),
        })
    }

    /// Begin bound (`None` = −∞).
    pub fn begin(&self) -> Option<&[u8]> {
        self.begin.as_deref()
    }

    /// End bound (`None` = +∞).
    pub fn end(&self) -> Option<&[u8]> {
        self.end.as_deref()
    }

    /// Structural version.
    pub fn version(&self) -> u32 {
        self.version.load(AtomicOrdering::Acquire)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, AtomicOrdering::AcqRel);
    }

    fn state(&self) -> Result<std::sync::RwLockReadGuard<'_, RangeState>, RangeError> {
        self.state
            .read()
            .map_err(|_| RangeError::Internal("RwLock poisoned".into()))
    }

    fn state_mut(&self) -> Result<std::sync::RwLockWriteGuard<'_, RangeState>, RangeError> {
        self.state
            .write()
            .map_err(|_| RangeError::Internal("RwLock poisoned".into()))
    }

    /// Active mem absorbing writes.
    pub fn active_mem(&self) -> Result<Arc<VyMem>, RangeError> {
        Ok(Arc::clone(&self.state()?.active))
    }

    /// Frozen mems, newest first.
    pub fn frozen_mems(&self) -> Result<Vec<Arc<VyMem>>, RangeError> {
        Ok(self.state()?.frozen.clone())
    }

    /// On-disk runs, newest first.
    pub fn runs(&self) -> Result<Vec<Arc<Run>>, RangeError> {
        Ok(self.state()?.runs.clone())
    }

    /// Shadow range during compaction, if any.
    pub fn shadow(&self) -> Result<Option<Arc<VyRange>>, RangeError> {
        Ok(self.state()?.shadow.clone())
    }

    /// Number of on-disk runs.
    pub fn run_count(&self) -> usize {
        self.state().map(|s| s.runs.len()).unwrap_or(0)
    }

    /// Completed compactions of this range.
    pub fn compact_count(&self) -> u32 {
        self.state().map(|s| s.compact_count).unwrap_or(0)
    }

    /// Lowest LSN held in memory (active + frozen); `i64::MAX` when
    /// nothing is resident. Dump scheduling key.
    pub fn mem_min_lsn(&self) -> i64 {
        self.state()
            .map(|s| {
                s.frozen
                    .iter()
                    .map(|m| m.min_lsn())
                    .chain(std::iter::once(s.active.min_lsn()))
                    .min()
                    .unwrap_or(i64::MAX)
            })
            .unwrap_or(i64::MAX)
    }

    /// Bytes held in memory (active + frozen).
    pub fn mem_used(&self) -> usize {
        self.state()
            .map(|s| {
                s.active.used() + s.frozen.iter().map(|m| m.used()).sum::<usize>()
            })
            .unwrap_or(0)
    }

    /// Applies a REPLACE (or a squash-produced statement) to the active
    /// mem.
    pub fn set(&self, stmt: Arc<Statement>) -> Result<(), RangeError> {
        let active = self.active_mem()?;
        active.insert(stmt)?;
        Ok(())
    }

    /// Applies a DELETE. The tombstone is dropped entirely when the
    /// range has no history for any key: no frozen mems, no runs, no
    /// shadow, and no resident version of this key in the active mem.
    pub fn set_delete(&self, stmt: Arc<Statement>) -> Result<(), RangeError> {
        let (active, has_history) = {
            let state = self.state()?;
            let has_history =
                !state.frozen.is_empty() || !state.runs.is_empty() || state.shadow.is_some();
            (Arc::clone(&state.active), has_history)
        };
        if !has_history {
            let key = stmt.extract_key(&self.key_def)?;
            if active.newest_visible(&key, i64::MAX)?.is_none() {
                debug!(range_id = self.id, "dropping DELETE of a key with no history");
                return Ok(());
            }
        }
        active.insert(stmt)?;
        Ok(())
    }

    /// Applies an UPSERT.
    ///
    /// The statement short-circuits to a REPLACE when an older
    /// non-UPSERT version is visible in the active mem, or when the
    /// range has no history at all. Otherwise the UPSERT is stacked and
    /// its chain counter maintained; crossing [`UPSERT_THRESHOLD`]
    /// pins the counter at "pending" and asks the caller to enqueue the
    /// key for the squash worker.
    pub fn set_upsert(&self, stmt: Arc<Statement>) -> Result<UpsertOutcome, RangeError> {
        debug_assert_eq!(stmt.stmt_type(), StmtType::Upsert);
        let (active, has_history) = {
            let state = self.state()?;
            let has_history =
                !state.frozen.is_empty() || !state.runs.is_empty() || state.shadow.is_some();
            (Arc::clone(&state.active), has_history)
        };

        let key = stmt.extract_key(&self.key_def)?;
        let older = active.newest_visible(&key, i64::MAX)?;

        match older {
            None if !has_history => {
                // Nothing below: materialize immediately.
                let replace = apply_upsert(&stmt, None, &self.key_def, false)?;
                active.insert(replace)?;
                Ok(UpsertOutcome::Done)
            }
            Some(older) if older.stmt_type() != StmtType::Upsert => {
                let materialized = apply_upsert(&stmt, Some(&older), &self.key_def, false)?;
                active.insert(materialized)?;
                Ok(UpsertOutcome::Done)
            }
            older => {
                let n = match &older {
                    Some(older) => older.n_upserts(),
                    None => 0,
                };
                if n == UPSERT_PENDING {
                    // Already queued for squash; keep stacking.
                    stmt.set_n_upserts(UPSERT_PENDING);
                    active.insert(stmt)?;
                    return Ok(UpsertOutcome::Done);
                }
                let n = n.saturating_add(1);
                if n >= UPSERT_THRESHOLD {
                    stmt.set_n_upserts(UPSERT_PENDING);
                    active.insert(stmt)?;
                    Ok(UpsertOutcome::NeedsSquash(key))
                } else {
                    stmt.set_n_upserts(n);
                    active.insert(stmt)?;
                    Ok(UpsertOutcome::Done)
                }
            }
        }
    }

    /// Freezes the active mem (if non-empty) and installs a fresh one.
    /// Returns `true` when a mem was frozen.
    pub fn freeze_mem(&self) -> Result<bool, RangeError> {
        let mut state = self.state_mut()?;
        if state.active.is_empty() {
            return Ok(false);
        }
        let fresh = VyMem::new(Arc::clone(&self.key_def));
        let old = std::mem::replace(&mut state.active, fresh);
        state.frozen.insert(0, old);
        drop(state);
        self.bump_version();
        Ok(true)
    }

    /// Links a published run at the head of the run list.
    pub fn add_run(&self, run: Arc<Run>) -> Result<(), RangeError> {
        self.state_mut()?.runs.insert(0, run);
        self.bump_version();
        Ok(())
    }

    /// Completes a dump: unlinks the dumped mems and links the new run
    /// (absent when the dump produced no statements).
    pub fn complete_dump(
        &self,
        dumped: &[Arc<VyMem>],
        run: Option<Arc<Run>>,
    ) -> Result<(), RangeError> {
        let mut state = self.state_mut()?;
        state
            .frozen
            .retain(|m| !dumped.iter().any(|d| Arc::ptr_eq(d, m)));
        if let Some(run) = run {
            state.runs.insert(0, run);
        }
        state.in_dump = false;
        drop(state);
        self.bump_version();
        Ok(())
    }

    /// Aborts a dump: the frozen mems stay linked so reads and a later
    /// retry see consistent history.
    pub fn abort_dump(&self) -> Result<(), RangeError> {
        self.state_mut()?.in_dump = false;
        Ok(())
    }

    /// Marks the range as being dumped. Returns `false` when a dump or
    /// compaction is already in flight.
    pub fn begin_dump(&self) -> Result<bool, RangeError> {
        let mut state = self.state_mut()?;
        if state.in_dump || state.in_compact {
            return Ok(false);
        }
        state.in_dump = true;
        Ok(true)
    }

    /// Marks the range as being compacted. Returns `false` when busy.
    pub fn begin_compact(&self) -> Result<bool, RangeError> {
        let mut state = self.state_mut()?;
        if state.in_dump || state.in_compact {
            return Ok(false);
        }
        state.in_compact = true;
        Ok(true)
    }

    /// Clears the in-compaction flag after an abort.
    pub fn abort_compact(&self) -> Result<(), RangeError> {
        let mut state = self.state_mut()?;
        state.in_compact = false;
        state.new_range_ids.clear();
        Ok(())
    }

    /// Records the result ranges a compaction is producing.
    pub fn set_new_range_ids(&self, ids: Vec<u32>) -> Result<(), RangeError> {
        self.state_mut()?.new_range_ids = ids;
        Ok(())
    }

    /// Attaches the compacting predecessor as this range's shadow.
    pub fn set_shadow(&self, shadow: Option<Arc<VyRange>>) -> Result<(), RangeError> {
        self.state_mut()?.shadow = shadow;
        self.bump_version();
        Ok(())
    }

    /// Bumps the completed-compaction counter.
    pub fn note_compacted(&self) -> Result<(), RangeError> {
        let mut state = self.state_mut()?;
        state.compact_count += 1;
        state.in_compact = false;
        Ok(())
    }

    /// Seeds the completed-compaction counter (recovery, splits).
    pub fn set_compact_count(&self, n: u32) -> Result<(), RangeError> {
        self.state_mut()?.compact_count = n;
        Ok(())
    }

    /// Statements resident in the active mem. Used when an aborted
    /// compaction folds in-flight writes back into the range they came
    /// from.
    pub fn active_statements(&self) -> Result<Vec<Arc<Statement>>, RangeError> {
        Ok(self.state()?.active.collect_all()?)
    }

    /// Whether a dump or compaction is in flight.
    pub fn is_busy(&self) -> bool {
        self.state()
            .map(|s| s.in_dump || s.in_compact)
            .unwrap_or(true)
    }

    /// Split decision: the median key of the oldest run, iff the range
    /// has been compacted at least once, the oldest run exceeds
    /// `range_size * 4/3`, and splitting there leaves both sides
    /// non-empty.
    pub fn needs_split(&self) -> Result<Option<Vec<u8>>, RangeError> {
        let state = self.state()?;
        if state.compact_count == 0 {
            return Ok(None);
        }
        let Some(oldest) = state.runs.last() else {
            return Ok(None);
        };
        let range_size = self.key_def.opts.range_size;
        if oldest.info().total_size <= range_size + range_size / 3 {
            return Ok(None);
        }
        let pages = oldest.pages();
        if pages.len() < 2 {
            return Ok(None);
        }
        let split_key = pages[pages.len() / 2].min_key.clone();
        // A split at the range's own begin bound would leave the left
        // side empty.
        if let Some(begin) = &self.begin
            && self.key_def.compare_keys(&split_key, begin)? == Ordering::Equal
        {
            return Ok(None);
        }
        Ok(Some(split_key))
    }
}

impl std::fmt::Debug for VyRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VyRange")
            .field("id", &self.id)
            .field("runs", &self.run_count())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// LSM index
// ------------------------------------------------------------------------------------------------

/// The per-index LSM container: range tree, id allocation, recovery.
pub struct LsmIndex {
    /// Owning space id.
    pub space_id: u32,
    /// Index ordinal within the space.
    pub index_id: u32,
    key_def: Arc<KeyDef>,
    dir: PathBuf,
    instance_uuid: Uuid,
    /// Ranges sorted by begin bound; a contiguous cover of (−∞, +∞).
    ranges: RwLock<Vec<Arc<VyRange>>>,
    /// Bumped on every range-set change.
    version: AtomicU32,
    next_range_id: AtomicU32,
    next_run_id: AtomicU32,
}

impl LsmIndex {
    /// Creates or recovers the index rooted at
    /// `<vinyl_dir>/<space_id>/<index_id>/`.
    pub fn open(
        vinyl_dir: &Path,
        space_id: u32,
        index_id: u32,
        key_def: Arc<KeyDef>,
        instance_uuid: Uuid,
    ) -> Result<Arc<LsmIndex>, RangeError> {
        let dir = vinyl_dir
            .join(space_id.to_string())
            .join(index_id.to_string());
        std::fs::create_dir_all(&dir)?;

        let index = LsmIndex {
            space_id,
            index_id,
            key_def,
            dir,
            instance_uuid,
            ranges: RwLock::new(Vec::new()),
            version: AtomicU32::new(0),
            next_range_id: AtomicU32::new(1),
            next_run_id: AtomicU32::new(1),
        };
        index.recover()?;
        Ok(Arc::new(index))
    }

    /// Key definition (the comparison definition for secondary
    /// indexes).
    pub fn key_def(&self) -> &Arc<KeyDef> {
        &self.key_def
    }

    /// Index data directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Instance identity for file meta blocks.
    pub fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    /// Structural version of the range set.
    pub fn version(&self) -> u32 {
        self.version.load(AtomicOrdering::Acquire)
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, AtomicOrdering::AcqRel);
    }

    /// Allocates a range id.
    pub fn alloc_range_id(&self) -> u32 {
        self.next_range_id.fetch_add(1, AtomicOrdering::AcqRel)
    }

    /// Allocates a run id.
    pub fn alloc_run_id(&self) -> u32 {
        self.next_run_id.fetch_add(1, AtomicOrdering::AcqRel)
    }

    /// Snapshot of the range list, sorted by begin bound.
    pub fn ranges(&self) -> Vec<Arc<VyRange>> {
        self.ranges.read().map(|r| r.clone()).unwrap_or_default()
    }

    /// The range whose `[begin, end)` contains `key`.
    pub fn find_range(&self, key: &[u8]) -> Result<Arc<VyRange>, RangeError> {
        let ranges = self
            .ranges
            .read()
            .map_err(|_| RangeError::Internal("RwLock poisoned".into()))?;
        // Last range whose begin ≤ key.
        let mut found = None;
        for range in ranges.iter() {
            match range.begin() {
                None => found = Some(range),
                Some(begin) => {
                    if self.key_def.compare_keys(key, begin)? != Ordering::Less {
                        found = Some(range);
                    } else {
                        break;
                    }
                }
            }
        }
        found
            .cloned()
            .ok_or_else(|| RangeError::Internal("range cover is empty".into()))
    }

    /// Routes a statement to its range and applies it.
    pub fn set(&self, stmt: Arc<Statement>) -> Result<UpsertOutcome, RangeError> {
        let key = stmt.extract_key(&self.key_def)?;
        let range = self.find_range(&key)?;
        match stmt.stmt_type() {
            StmtType::Upsert => range.set_upsert(stmt),
            StmtType::Delete => {
                range.set_delete(stmt)?;
                Ok(UpsertOutcome::Done)
            }
            _ => {
                range.set(stmt)?;
                Ok(UpsertOutcome::Done)
            }
        }
    }

    /// Replaces `old` with `new_ranges` in the cover (compaction
    /// publication). `new_ranges` must be sorted and span `old`.
    pub fn replace_range(
        &self,
        old: &Arc<VyRange>,
        new_ranges: Vec<Arc<VyRange>>,
    ) -> Result<(), RangeError> {
        self.replace_span(std::slice::from_ref(old), new_ranges)
    }

    /// Replaces a contiguous span of ranges with another, keeping the
    /// cover sorted. Used by compaction publication and abort.
    pub fn replace_span(
        &self,
        old: &[Arc<VyRange>],
        new_ranges: Vec<Arc<VyRange>>,
    ) -> Result<(), RangeError> {
        let mut ranges = self
            .ranges
            .write()
            .map_err(|_| RangeError::Internal("RwLock poisoned".into()))?;
        let first = old.first().ok_or_else(|| {
            RangeError::Internal("empty span to replace".into())
        })?;
        let at = ranges
            .iter()
            .position(|r| Arc::ptr_eq(r, first))
            .ok_or_else(|| RangeError::Internal("range to replace is not in the cover".into()))?;
        for (i, range) in old.iter().enumerate() {
            if !ranges.get(at + i).is_some_and(|r| Arc::ptr_eq(r, range)) {
                return Err(RangeError::Internal(
                    "span to replace is not contiguous in the cover".into(),
                ));
            }
        }
        ranges.splice(at..at + old.len(), new_ranges);
        drop(ranges);
        self.bump_version();
        Ok(())
    }

    /// Highest run LSN covering `key`, or 0 when the key's range has no
    /// runs. WAL replay discards rows at or below this LSN.
    pub fn max_run_lsn_for(&self, key: &[u8]) -> Result<i64, RangeError> {
        let range = self.find_range(key)?;
        let runs = range.runs()?;
        Ok(runs.iter().map(|r| r.info().max_lsn).max().unwrap_or(0))
    }

    // --------------------------------------------------------------------------------------------
    // Recovery
    // --------------------------------------------------------------------------------------------

    /// Scans the index directory and rebuilds the range cover.
    ///
    /// Index files are processed in `(range_id desc, run_id asc)` order
    /// so newer range images supersede older ones. A scanned range is
    /// accepted iff it is not fully covered by already-accepted ranges;
    /// a partially-covered range (an incomplete split's parent) is
    /// clipped to the hull of the space it still covers. Gaps left
    /// after acceptance are filled with empty ranges so the cover stays
    /// contiguous.
    fn recover(&self) -> Result<(), RangeError> {
        let mut files: Vec<(i64, u32, u32, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Some((lsn, range_id, run_id, is_index)) = xlog::parse_run_filename(name)
                && is_index
            {
                files.push((lsn, range_id, run_id, path));
            }
        }
        files.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        let mut accepted: Vec<Arc<VyRange>> = Vec::new();
        let mut current: Option<(u32, Option<Vec<u8>>, Option<Vec<u8>>, Vec<Arc<Run>>)> = None;
        let mut max_range_id = 0;
        let mut max_run_id = 0;

        let mut flush = |current: &mut Option<(u32, Option<Vec<u8>>, Option<Vec<u8>>, Vec<Arc<Run>>)>,
                         accepted: &mut Vec<Arc<VyRange>>|
         -> Result<(), RangeError> {
            let Some((range_id, begin, end, mut runs)) = current.take() else {
                return Ok(());
            };
            match self.recover_range(accepted, begin.clone(), end.clone())? {
                None => {
                    info!(range_id, "discarding fully-covered range image");
                }
                Some((begin, end)) => {
                    let range =
                        VyRange::new(range_id, begin, end, Arc::clone(&self.key_def));
                    // Files arrive run_id ascending; newest first in the list.
                    runs.reverse();
                    {
                        let mut state = range
                            .state
                            .write()
                            .map_err(|_| RangeError::Internal("RwLock poisoned".into()))?;
                        state.runs = runs;
                        state.compact_count = 1;
                    }
                    accepted.push(range);
                }
            }
            Ok(())
        };

        for (_, range_id, run_id, path) in files {
            max_range_id = max_range_id.max(range_id);
            max_run_id = max_run_id.max(run_id);
            if current.as_ref().is_some_and(|(id, ..)| *id != range_id) {
                flush(&mut current, &mut accepted)?;
            }
            let run = match Run::open(&path, Some(run_id)) {
                Ok(run) => run,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable run");
                    continue;
                }
            };
            match &mut current {
                None => {
                    current = Some((
                        range_id,
                        run.info().begin.clone(),
                        run.info().end.clone(),
                        vec![run],
                    ));
                }
                Some((_, _, _, runs)) => runs.push(run),
            }
        }
        flush(&mut current, &mut accepted)?;

        self.next_range_id
            .fetch_max(max_range_id + 1, AtomicOrdering::AcqRel);
        self.next_run_id
            .fetch_max(max_run_id + 1, AtomicOrdering::AcqRel);

        // Sort by begin and fill gaps with empty ranges.
        accepted.sort_by(|a, b| {
            cmp_begin(&self.key_def, a.begin(), b.begin()).unwrap_or(Ordering::Equal)
        });
        let mut cover: Vec<Arc<VyRange>> = Vec::new();
        let mut cursor: Option<Vec<u8>> = None; // current cover end; None = −∞ before first
        let mut at_start = true;
        for range in accepted {
            let gap_needed = if at_start {
                range.begin().is_some()
            } else {
                match (cursor.as_deref(), range.begin()) {
                    (Some(cur), Some(begin)) => {
                        self.key_def.compare_keys(cur, begin)? == Ordering::Less
                    }
                    _ => false,
                }
            };
            if gap_needed {
                cover.push(VyRange::new(
                    self.alloc_range_id(),
                    cursor.clone(),
                    range.begin().map(<[u8]>::to_vec),
                    Arc::clone(&self.key_def),
                ));
            }
            cursor = range.end().map(<[u8]>::to_vec);
            let open_ended = range.end().is_none();
            cover.push(range);
            at_start = false;
            if open_ended {
                cursor = None;
            }
        }
        if cover.is_empty() {
            cover.push(VyRange::new(
                self.alloc_range_id(),
                None,
                None,
                Arc::clone(&self.key_def),
            ));
        } else if let Some(last_end) = cover.last().and_then(|r| r.end().map(<[u8]>::to_vec)) {
            cover.push(VyRange::new(
                self.alloc_range_id(),
                Some(last_end),
                None,
                Arc::clone(&self.key_def),
            ));
        }

        info!(
            space_id = self.space_id,
            index_id = self.index_id,
            ranges = cover.len(),
            "index range cover recovered"
        );

        *self
            .ranges
            .write()
            .map_err(|_| RangeError::Internal("RwLock poisoned".into()))? = cover;
        self.bump_version();
        Ok(())
    }

    /// Coverage check for one scanned range: `None` when fully covered
    /// by `accepted`, otherwise the (possibly clipped) bounds it should
    /// be accepted with.
    fn recover_range(
        &self,
        accepted: &[Arc<VyRange>],
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    ) -> Result<Option<(Option<Vec<u8>>, Option<Vec<u8>>)>, RangeError> {
        let mut begin = begin;
        let mut end = end;
        for other in accepted {
            let covers_begin =
                cmp_begin(&self.key_def, other.begin(), begin.as_deref())? != Ordering::Greater;
            let covers_end =
                cmp_end(&self.key_def, other.end(), end.as_deref())? != Ordering::Less;
            if covers_begin && covers_end {
                return Ok(None);
            }
            if covers_begin
                && cmp_begin(&self.key_def, other.end(), begin.as_deref())? == Ordering::Greater
            {
                // Accepted range covers our prefix: clip the begin.
                begin = other.end().map(<[u8]>::to_vec);
            } else if covers_end
                && cmp_end(&self.key_def, other.begin(), end.as_deref())? == Ordering::Less
            {
                // Accepted range covers our suffix: clip the end.
                end = other.begin().map(<[u8]>::to_vec);
            }
        }
        Ok(Some((begin, end)))
    }
}

impl std::fmt::Debug for LsmIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmIndex")
            .field("space_id", &self.space_id)
            .field("index_id", &self.index_id)
            .field("ranges", &self.ranges().len())
            .finish()
    }
}
