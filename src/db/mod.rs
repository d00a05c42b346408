//! The engine facade.
//!
//! [`Db`] wires the pieces together: spaces and indexes over the LSM
//! backend, MVCC transactions with WAL-first commit, checkpointing
//! into snapshots, background dump/compaction, and the replication
//! relay/applier pair.
//!
//! ## Commit path
//!
//! A commit serializes behind the WAL: the transaction prepares
//! (resolving conflicts), its writes are encoded as one xlog
//! transaction and appended to the WAL, LSNs are assigned in WAL
//! order, and only then are statements applied to the in-memory trees
//! and charged against the quota. Commit order equals LSN order equals
//! WAL order.
//!
//! ## Recovery
//!
//! `Db::open` replays the newest snapshot, then the xlog suffix. A
//! replayed row is dropped when its LSN is already covered by an
//! on-disk run of the target range, which makes replay idempotent.

mod transaction;

#[cfg(test)]
mod tests;

pub use transaction::{SpaceHandle, Transaction};

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{BoxConfig, WalMode};
use crate::error::{BoxError, BoxResult, ErrorCode};
use crate::iterator::{IteratorType, ReadIterator};
use crate::keydef::{KeyDef, KeyPart};
use crate::quota::Quota;
use crate::range::LsmIndex;
use crate::recovery::Recovery;
use crate::replication::applier::{Applier, ApplierConfig};
use crate::replication::relay::{Relay, RelaySource};
use crate::run::{stmt_from_row, stmt_to_row};
use crate::scheduler::Scheduler;
use crate::space::{Engine, Index, IndexBody, IndexDef, Space, SpaceDef};
use crate::tuple::TupleFormat;
use crate::tx::{Tx, TxManager};
use crate::vclock::Vclock;
use crate::xlog::{FileType, Row, RowType, Xdir, XlogCursor, XlogMeta, XlogWriter};

/// Schema of one space passed to [`Db::open`].
pub struct SpaceConfig {
    /// Space definition.
    pub def: SpaceDef,
    /// Index definitions; ordinal 0 must be present and unique.
    pub indexes: Vec<IndexDef>,
}

// ------------------------------------------------------------------------------------------------
// The LSM engine behind the Engine seam
// ------------------------------------------------------------------------------------------------

struct VinylEngine {
    vinyl_dir: std::path::PathBuf,
    instance_uuid: Uuid,
    recovering: AtomicBool,
}

impl Engine for VinylEngine {
    fn name(&self) -> &str {
        "vinyl"
    }

    fn create_index(&self, space: &SpaceDef, def: &IndexDef) -> BoxResult<IndexBody> {
        let lsm = LsmIndex::open(
            &self.vinyl_dir,
            space.id,
            def.index_id,
            Arc::clone(&def.key_def),
            self.instance_uuid,
        )
        .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        Ok(IndexBody::Lsm(lsm))
    }

    fn bootstrap(&self) -> BoxResult<()> {
        Ok(())
    }

    fn begin_recovery(&self) -> BoxResult<()> {
        self.recovering.store(true, AtomicOrdering::Release);
        Ok(())
    }

    fn end_recovery(&self) -> BoxResult<()> {
        self.recovering.store(false, AtomicOrdering::Release);
        Ok(())
    }

    fn checkpoint(&self, _lsn: i64) -> BoxResult<()> {
        // Dump scheduling is driven by the Db facade through the
        // scheduler; nothing engine-local remains to flush.
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Db
// ------------------------------------------------------------------------------------------------

struct WalState {
    writer: Option<XlogWriter>,
    vclock: Vclock,
}

/// An open database instance.
pub struct Db {
    config: BoxConfig,
    instance_uuid: Uuid,
    cluster_uuid: Uuid,
    engine: VinylEngine,
    tx_manager: Arc<TxManager>,
    quota: Arc<Quota>,
    scheduler: Mutex<Option<Scheduler>>,
    spaces: RwLock<HashMap<u32, Arc<Space>>>,
    wal: Mutex<WalState>,
    wal_dir: Xdir,
    snap_dir: Xdir,
    read_only: AtomicBool,
    relay: Mutex<Option<Relay>>,
    appliers: Mutex<Vec<Applier>>,
}

impl Db {
    /// Opens (or bootstraps) an instance: recovers local data into the
    /// given schema, starts the background scheduler, and brings up
    /// replication per the configuration.
    pub fn open(config: BoxConfig, schema: Vec<SpaceConfig>) -> BoxResult<Arc<Db>> {
        let wal_dir = Xdir::new(&config.wal_dir, FileType::Xlog)
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        let snap_dir = Xdir::new(&config.snap_dir, FileType::Snap)
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;

        let (instance_uuid, cluster_uuid) = load_or_create_identity(&config.snap_dir)?;
        let engine = VinylEngine {
            vinyl_dir: config.vinyl_dir.clone(),
            instance_uuid,
            recovering: AtomicBool::new(false),
        };

        let tx_manager = TxManager::new();
        let quota = Arc::new(Quota::new(config.vinyl_memory_limit));
        let read_only = config.read_only || config.hot_standby;

        let db = Arc::new(Db {
            instance_uuid,
            cluster_uuid,
            engine,
            tx_manager,
            quota,
            scheduler: Mutex::new(None),
            spaces: RwLock::new(HashMap::new()),
            wal: Mutex::new(WalState {
                writer: None,
                vclock: Vclock::new(),
            }),
            wal_dir,
            snap_dir,
            read_only: AtomicBool::new(read_only),
            relay: Mutex::new(None),
            appliers: Mutex::new(Vec::new()),
            config,
        });

        // Declare the schema: every index recovers its on-disk state.
        for space_config in schema {
            db.create_space(space_config)?;
        }

        // Two-phase local recovery.
        db.engine.begin_recovery()?;
        let mut recovery = Recovery::new(
            &db.config.snap_dir,
            &db.config.wal_dir,
            db.config.panic_on_snap_error,
            db.config.panic_on_wal_error,
        )
        .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;

        let apply_db = Arc::clone(&db);
        let snap_signature = recovery
            .recover_snapshot(|row| apply_db.apply_recovered_row(row))
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        recovery
            .recover_wals(snap_signature.unwrap_or(0), |row| {
                apply_db.apply_recovered_row(row)
            })
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        let recovered = recovery.finish().clone();
        db.engine.end_recovery()?;

        {
            let mut wal = db
                .wal
                .lock()
                .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))?;
            wal.vclock = recovered;
        }

        // Background machinery.
        let scheduler = Scheduler::start(
            db.config.vinyl_threads,
            Arc::clone(&db.quota),
            Arc::clone(&db.tx_manager),
        );
        for space in db.spaces.read().unwrap_or_else(|e| e.into_inner()).values() {
            // Temporary spaces are memory-only: never dumped, so their
            // content cannot outlive the instance through run files.
            if space.def.temporary {
                continue;
            }
            for index in space.indexes.values() {
                scheduler.register_index(Arc::clone(index.lsm()));
            }
        }
        *db.scheduler
            .lock()
            .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))? =
            Some(scheduler);

        // Replication.
        if let Some(listen) = db.config.listen.clone() {
            let relay = Relay::bind(&listen, Arc::clone(&db) as Arc<dyn RelaySource>)
                .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
            *db.relay
                .lock()
                .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))? =
                Some(relay);
        }
        db.start_appliers()?;

        info!(
            instance = %db.instance_uuid,
            spaces = db.spaces.read().map(|s| s.len()).unwrap_or(0),
            "database open"
        );
        Ok(db)
    }

    /// Shuts the instance down: final checkpoint, then background
    /// teardown.
    pub fn close(&self) -> BoxResult<()> {
        if !self.read_only.load(AtomicOrdering::Acquire) {
            self.checkpoint()?;
        }
        if let Ok(mut appliers) = self.appliers.lock() {
            for applier in appliers.iter_mut() {
                applier.stop();
            }
            appliers.clear();
        }
        if let Ok(mut relay) = self.relay.lock()
            && let Some(relay) = relay.as_mut()
        {
            relay.stop();
        }
        if let Ok(mut scheduler) = self.scheduler.lock()
            && let Some(scheduler) = scheduler.as_mut()
        {
            scheduler.stop();
        }
        if let Ok(mut wal) = self.wal.lock()
            && let Some(writer) = wal.writer.take()
        {
            writer
                .close()
                .map_err(|e| BoxError::new(ErrorCode::WalIo, e.to_string()))?;
        }
        info!("database closed");
        Ok(())
    }

    /// This instance's identity.
    pub fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    /// Last committed LSN.
    pub fn lsn(&self) -> i64 {
        self.tx_manager.lsn()
    }

    /// Current committed vclock.
    pub fn vclock(&self) -> Vclock {
        self.wal
            .lock()
            .map(|w| w.vclock.clone())
            .unwrap_or_default()
    }

    /// Switches the read-only flag at runtime.
    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, AtomicOrdering::Release);
    }

    // --------------------------------------------------------------------------------------------
    // Schema
    // --------------------------------------------------------------------------------------------

    /// Declares a space; its indexes recover their on-disk state.
    pub fn create_space(&self, space_config: SpaceConfig) -> BoxResult<()> {
        let SpaceConfig { def, indexes } = space_config;
        if def.engine != self.engine.name() {
            return Err(BoxError::raise(
                ErrorCode::IllegalParams,
                format!("engine '{}' is interface-only here", def.engine),
            ));
        }
        let primary_def = indexes
            .iter()
            .find(|i| i.index_id == 0)
            .ok_or_else(|| {
                BoxError::raise(
                    ErrorCode::IllegalParams,
                    format!("space '{}' lacks a primary index", def.name),
                )
            })?
            .key_def
            .clone();

        let key_defs: Vec<&KeyDef> = indexes.iter().map(|i| i.key_def.as_ref()).collect();
        let format = TupleFormat::new(&key_defs, def.field_count)
            .map_err(|e| BoxError::new(ErrorCode::FieldTypeMismatch, e.to_string()))?;

        let mut built = std::collections::BTreeMap::new();
        for index_def in indexes {
            let index = self.build_index(&def, &primary_def, index_def)?;
            built.insert(index.def.index_id, index);
        }

        let space = Arc::new(Space {
            def,
            format,
            indexes: built,
        });
        let mut spaces = self
            .spaces
            .write()
            .map_err(|_| BoxError::new(ErrorCode::Internal, "RwLock poisoned"))?;
        spaces.insert(space.def.id, space);
        Ok(())
    }

    fn build_index(
        &self,
        space: &SpaceDef,
        primary_def: &Arc<KeyDef>,
        def: IndexDef,
    ) -> BoxResult<Index> {
        let (cmp_def, stored_def, to_primary) = if def.index_id == 0 {
            (Arc::clone(&def.key_def), Arc::clone(&def.key_def), None)
        } else {
            let cmp_def = KeyDef::build_secondary(primary_def, &def.key_def)
                .map_err(|e| BoxError::new(ErrorCode::IllegalParams, e.to_string()))?;
            let to_primary = KeyDef::build_secondary_to_primary(primary_def, &cmp_def)
                .map_err(|e| BoxError::new(ErrorCode::IllegalParams, e.to_string()))?;
            // Stored secondary tuples hold exactly the comparison key
            // fields, in order: the on-disk key def is positional.
            let stored_parts = cmp_def
                .parts
                .iter()
                .enumerate()
                .map(|(i, part)| KeyPart {
                    field_no: i as u32,
                    field_type: part.field_type,
                })
                .collect();
            let stored_def = KeyDef::new(stored_parts, def.key_def.opts.clone());
            (Arc::new(cmp_def), Arc::new(stored_def), Some(Arc::new(to_primary)))
        };

        let body = self.engine.create_index(
            space,
            &IndexDef {
                key_def: stored_def,
                ..def.clone()
            },
        )?;
        Ok(Index {
            def,
            cmp_def,
            to_primary,
            body,
        })
    }

    /// Space by id.
    pub fn space(&self, space_id: u32) -> BoxResult<Arc<Space>> {
        self.spaces
            .read()
            .map_err(|_| BoxError::new(ErrorCode::Internal, "RwLock poisoned"))?
            .get(&space_id)
            .cloned()
            .ok_or_else(|| {
                BoxError::raise(ErrorCode::NoSuchSpace, format!("no space with id {space_id}"))
            })
    }

    /// Truncates a space: drops and recreates its indexes. The data
    /// files are unlinked and a checkpoint pins the new (empty) state,
    /// so a later replay cannot resurrect old rows.
    pub fn truncate(&self, space_id: u32) -> BoxResult<()> {
        self.check_writable()?;
        let space = self.space(space_id)?;

        let scheduler = self
            .scheduler
            .lock()
            .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))?;
        let mut rebuilt = std::collections::BTreeMap::new();
        for (ordinal, index) in &space.indexes {
            let lsm = index.lsm();
            if let Some(scheduler) = scheduler.as_ref() {
                scheduler.unregister_index(lsm);
            }
            // Drop every run file, then recover into a fresh cover.
            for range in lsm.ranges() {
                for run in range
                    .runs()
                    .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?
                {
                    if let Err(e) = run.unlink() {
                        warn!(run_id = run.id, error = %e, "failed to unlink run on truncate");
                    }
                }
            }
            let fresh = LsmIndex::open(
                &self.config.vinyl_dir,
                space_id,
                *ordinal,
                Arc::clone(lsm.key_def()),
                self.instance_uuid,
            )
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
            if !space.def.temporary
                && let Some(scheduler) = scheduler.as_ref()
            {
                scheduler.register_index(Arc::clone(&fresh));
            }
            rebuilt.insert(
                *ordinal,
                Index {
                    def: index.def.clone(),
                    cmp_def: Arc::clone(&index.cmp_def),
                    to_primary: index.to_primary.clone(),
                    body: IndexBody::Lsm(fresh),
                },
            );
        }
        drop(scheduler);

        let fresh_space = Arc::new(Space {
            def: space.def.clone(),
            format: Arc::clone(&space.format),
            indexes: rebuilt,
        });
        self.spaces
            .write()
            .map_err(|_| BoxError::new(ErrorCode::Internal, "RwLock poisoned"))?
            .insert(space_id, fresh_space);

        info!(space_id, "space truncated");
        self.checkpoint()
    }

    // --------------------------------------------------------------------------------------------
    // Transactions
    // --------------------------------------------------------------------------------------------

    /// Begins a transaction.
    pub fn begin(self: &Arc<Db>, read_only: bool) -> Transaction {
        Transaction {
            db: Arc::clone(self),
            tx: self.tx_manager.begin(read_only),
            engine: Mutex::new(None),
            finished: false,
        }
    }

    fn check_writable(&self) -> BoxResult<()> {
        if self.read_only.load(AtomicOrdering::Acquire) {
            return Err(BoxError::raise(
                ErrorCode::ReadOnly,
                "instance is in read-only mode",
            ));
        }
        Ok(())
    }

    /// Commits a prepared transaction: WAL first, then the mems.
    fn commit_tx(&self, tx: &Tx) -> BoxResult<()> {
        let writes = tx.writes_in_order().map_err(BoxError::from)?;
        if !writes.is_empty() {
            self.check_writable()?;
        }
        tx.prepare().map_err(BoxError::from)?;
        if writes.is_empty() {
            let (_, _) = tx.commit(self.tx_manager.lsn() + 1).map_err(BoxError::from)?;
            return Ok(());
        }

        // Serialize commits behind the WAL writer.
        let mut wal = self
            .wal
            .lock()
            .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))?;
        let first_lsn = self.tx_manager.lsn() + 1;

        // Temporary spaces never reach the WAL (nor, through it, any
        // replica); their writes still take LSNs so the commit order
        // stays one sequence.
        let mut rows = Vec::with_capacity(writes.len());
        let mut last_logged = None;
        let mut temp_cache: HashMap<u32, bool> = HashMap::new();
        for (i, (index, stmt)) in writes.iter().enumerate() {
            let lsn = first_lsn + i as i64;
            let temporary = *temp_cache.entry(index.space_id).or_insert_with(|| {
                self.space(index.space_id)
                    .map(|s| s.def.temporary)
                    .unwrap_or(false)
            });
            if temporary {
                continue;
            }
            last_logged = Some(lsn);
            if self.config.wal_mode != WalMode::None {
                let mut row = stmt_to_row(stmt, index.space_id, index.index_id);
                row.server_id = self.config.instance_id;
                row.lsn = lsn;
                rows.push(row);
            }
        }
        if !rows.is_empty() {
            let writer = self.wal_writer(&mut wal)?;
            writer
                .write_tx(&rows)
                .map_err(|e| BoxError::raise(ErrorCode::WalIo, e.to_string()))?;
        }

        let (squash, bytes) = tx.commit(first_lsn).map_err(BoxError::from)?;
        if let Some(last_lsn) = last_logged {
            wal.vclock.follow(self.config.instance_id, last_lsn);
        }

        // Rotate the WAL when the row budget is spent.
        let rotate = wal
            .writer
            .as_ref()
            .is_some_and(|w| w.row_count() >= self.config.rows_per_wal);
        if rotate
            && let Some(writer) = wal.writer.take()
        {
            writer
                .close()
                .map_err(|e| BoxError::raise(ErrorCode::WalIo, e.to_string()))?;
        }
        drop(wal);

        self.quota.use_(bytes as u64);
        if !squash.is_empty()
            && let Ok(scheduler) = self.scheduler.lock()
            && let Some(scheduler) = scheduler.as_ref()
        {
            for (index, key) in squash {
                scheduler.enqueue_squash(index, key);
            }
        }
        Ok(())
    }

    /// Current WAL writer, opened lazily at the current vclock.
    fn wal_writer<'a>(&self, wal: &'a mut WalState) -> BoxResult<&'a mut XlogWriter> {
        if wal.writer.is_none() {
            let path = self.wal_dir.filename(wal.vclock.sum());
            let meta = XlogMeta {
                filetype: FileType::Xlog,
                instance_uuid: self.instance_uuid,
                vclock: wal.vclock.clone(),
            };
            let writer = XlogWriter::create(&path, &meta, self.config.wal_mode, false)
                .map_err(|e| BoxError::raise(ErrorCode::WalIo, e.to_string()))?;
            wal.writer = Some(writer);
        }
        wal.writer
            .as_mut()
            .ok_or_else(|| BoxError::new(ErrorCode::Internal, "WAL writer vanished"))
    }

    // --------------------------------------------------------------------------------------------
    // Recovery / replication apply
    // --------------------------------------------------------------------------------------------

    /// Applies one recovered WAL/snapshot row, with the at-most-once
    /// filter against on-disk runs.
    fn apply_recovered_row(&self, row: &Row) -> BoxResult<()> {
        self.apply_row(row, false)
    }

    /// Applies one replicated row: logged to the local WAL, then
    /// applied.
    fn apply_replicated_row(&self, row: &Row) -> BoxResult<()> {
        self.apply_row(row, true)
    }

    /// Applies one JOIN-stream row. The bulk stream carries only
    /// primary-index tuples, so secondary statements are derived here.
    fn apply_joined_row(&self, row: &Row) -> BoxResult<()> {
        self.apply_row(row, true)?;
        let (Some(space_id), Some(tuple)) = (row.space_id, &row.tuple) else {
            return Ok(());
        };
        if row.index_id.unwrap_or(0) != 0 {
            return Ok(());
        }
        let Ok(space) = self.space(space_id) else {
            return Ok(());
        };
        for (ordinal, index) in &space.indexes {
            if *ordinal == 0 {
                continue;
            }
            let stored = index
                .cmp_def
                .extract_key(tuple)
                .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
            let mut secondary = row.clone();
            secondary.index_id = Some(*ordinal);
            secondary.tuple = Some(stored);
            self.apply_row(&secondary, true)?;
        }
        Ok(())
    }

    fn apply_row(&self, row: &Row, log_to_wal: bool) -> BoxResult<()> {
        let Some(space_id) = row.space_id else {
            return Ok(()); // heartbeats and markers
        };
        let Ok(space) = self.space(space_id) else {
            warn!(space_id, lsn = row.lsn, "row for unknown space skipped");
            return Ok(());
        };
        if space.def.temporary {
            // Temporary spaces are neither recovered nor replicated.
            return Ok(());
        }
        let stmt = stmt_from_row(row)
            .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
        let index_id = row.index_id.unwrap_or(0);
        let index = space.index(index_id)?;
        let lsm = index.lsm();

        // At-most-once: skip rows already persisted in a run.
        let key = stmt
            .extract_key(lsm.key_def())
            .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
        let max_run_lsn = lsm
            .max_run_lsn_for(&key)
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        if row.lsn <= max_run_lsn {
            debug!(lsn = row.lsn, max_run_lsn, "replayed row already on disk");
        } else {
            lsm.set(stmt)
                .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        }

        if log_to_wal {
            let mut wal = self
                .wal
                .lock()
                .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))?;
            if self.config.wal_mode != WalMode::None {
                let writer = self.wal_writer(&mut wal)?;
                writer
                    .write_tx(std::slice::from_ref(row))
                    .map_err(|e| BoxError::raise(ErrorCode::WalIo, e.to_string()))?;
            }
            wal.vclock.follow(row.server_id, row.lsn);
        }
        self.tx_manager.set_lsn(row.lsn);
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Checkpointing
    // --------------------------------------------------------------------------------------------

    /// Writes a snapshot of all non-temporary spaces and waits for the
    /// LSM memory at or below the snapshot LSN to reach disk, then
    /// collects old snapshots and WAL files.
    pub fn checkpoint(&self) -> BoxResult<()> {
        let vclock = self.vclock();
        let lsn = self.tx_manager.lsn();
        let signature = vclock.sum();

        if self.snap_dir.find(signature).ok().flatten().map(|(s, _)| s) == Some(signature) {
            debug!(signature, "checkpoint already exists");
            return Ok(());
        }

        // Rotate the WAL so files below the snapshot become collectable.
        {
            let mut wal = self
                .wal
                .lock()
                .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))?;
            if let Some(writer) = wal.writer.take() {
                writer
                    .close()
                    .map_err(|e| BoxError::raise(ErrorCode::WalIo, e.to_string()))?;
            }
        }

        let meta = XlogMeta {
            filetype: FileType::Snap,
            instance_uuid: self.instance_uuid,
            vclock: vclock.clone(),
        };
        let path = self.snap_dir.filename(signature);
        let mut writer = XlogWriter::create(&path, &meta, self.config.wal_mode, true)
            .map_err(|e| BoxError::raise(ErrorCode::System, e.to_string()))?;
        for row in self.snapshot_rows_at(lsn)? {
            writer.write_row(&row);
        }
        writer
            .flush_tx()
            .map_err(|e| BoxError::raise(ErrorCode::System, e.to_string()))?;
        writer
            .close()
            .map_err(|e| BoxError::raise(ErrorCode::System, e.to_string()))?;
        info!(signature, lsn, "snapshot written");

        // Push LSM memory below the checkpoint to disk.
        if let Ok(scheduler) = self.scheduler.lock()
            && let Some(scheduler) = scheduler.as_ref()
        {
            scheduler.begin_checkpoint(lsn);
            if !scheduler.wait_checkpoint(lsn, Duration::from_secs(60)) {
                return Err(BoxError::raise(
                    ErrorCode::System,
                    "checkpoint dump did not complete",
                ));
            }
        }

        self.collect_garbage()?;
        Ok(())
    }

    /// Removes snapshots beyond the retention count and WAL files below
    /// the oldest retained snapshot.
    fn collect_garbage(&self) -> BoxResult<()> {
        let snaps = self
            .snap_dir
            .scan()
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        let keep = self.config.snapshot_count.max(1);
        if snaps.len() > keep {
            let cutoff = snaps[snaps.len() - keep].0;
            self.snap_dir
                .collect_garbage(cutoff)
                .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        }
        if let Some((oldest_kept, _)) = self
            .snap_dir
            .scan()
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?
            .first()
        {
            self.wal_dir
                .collect_garbage(*oldest_kept)
                .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        }
        Ok(())
    }

    /// Snapshot content: INSERT rows for all non-temporary spaces in
    /// ascending `(space_id, primary key)` order, visible at `lsn`.
    fn snapshot_rows_at(&self, lsn: i64) -> BoxResult<Vec<Row>> {
        let spaces = {
            let guard = self
                .spaces
                .read()
                .map_err(|_| BoxError::new(ErrorCode::Internal, "RwLock poisoned"))?;
            let mut spaces: Vec<Arc<Space>> = guard.values().cloned().collect();
            spaces.sort_by_key(|s| s.def.id);
            spaces
        };

        let mut rows = Vec::new();
        for space in spaces {
            if space.def.temporary {
                continue;
            }
            let primary = space.primary()?;
            let mut reader = ReadIterator::new(
                Arc::clone(primary.lsm()),
                IteratorType::Ge,
                &[],
                lsn,
                None,
            );
            while let Some(stmt) = reader
                .next()
                .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?
            {
                let mut row = stmt_to_row(&stmt, space.def.id, 0);
                row.row_type = RowType::Insert;
                row.server_id = self.config.instance_id;
                rows.push(row);
            }
        }
        Ok(rows)
    }

    // --------------------------------------------------------------------------------------------
    // Replication wiring
    // --------------------------------------------------------------------------------------------

    fn start_appliers(self: &Arc<Db>) -> BoxResult<()> {
        if self.config.replication_source.is_empty() {
            return Ok(());
        }
        let fresh = self.lsn() == 0;
        let mut appliers = Vec::new();
        for uri in &self.config.replication_source {
            let join_sink = {
                let db = Arc::clone(self);
                Box::new(move |row: &Row| db.apply_joined_row(row))
                    as crate::replication::applier::RowSink
            };
            let final_sink = {
                let db = Arc::clone(self);
                Box::new(move |row: &Row| db.apply_replicated_row(row))
                    as crate::replication::applier::RowSink
            };
            let subscribe_sink = {
                let db = Arc::clone(self);
                Box::new(move |row: &Row| db.apply_replicated_row(row))
                    as crate::replication::applier::RowSink
            };
            let applier = Applier::start(
                ApplierConfig {
                    uri: uri.clone(),
                    instance_uuid: self.instance_uuid,
                    instance_id: self.config.instance_id,
                    cluster_uuid: self.cluster_uuid,
                    expected_master_uuid: None,
                    need_join: fresh,
                    subscribe_vclock: self.vclock(),
                },
                join_sink,
                final_sink,
                subscribe_sink,
            );
            appliers.push(applier);
        }
        // Release the pause barrier once every applier is connected (or
        // failed); a single follower chain needs no tighter ceremony.
        for applier in &appliers {
            applier.wait_state(
                crate::replication::applier::ApplierState::Connected,
                Duration::from_secs(10),
            );
        }
        for applier in &appliers {
            applier.resume();
        }
        *self
            .appliers
            .lock()
            .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))? = appliers;
        Ok(())
    }
}

impl RelaySource for Db {
    fn instance_uuid(&self) -> Uuid {
        self.instance_uuid
    }

    fn cluster_uuid(&self) -> Uuid {
        self.cluster_uuid
    }

    fn vclock(&self) -> Vclock {
        Db::vclock(self)
    }

    fn snapshot_rows(&self) -> BoxResult<Vec<Row>> {
        self.snapshot_rows_at(self.tx_manager.lsn())
    }

    fn rows_since(&self, vclock: &Vclock) -> BoxResult<Vec<Row>> {
        // Temporary spaces never replicate; their rows cannot reach the
        // WAL in the first place, but a log written before a space was
        // redeclared temporary must not leak either.
        let temporary: HashSet<u32> = self
            .spaces
            .read()
            .map_err(|_| BoxError::new(ErrorCode::Internal, "RwLock poisoned"))?
            .values()
            .filter(|s| s.def.temporary)
            .map(|s| s.def.id)
            .collect();

        // Feed from the durable log: scan completed and in-progress
        // WAL state through the directory.
        let files = self
            .wal_dir
            .scan()
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
        let mut rows = Vec::new();
        for (_, path) in files {
            collect_wal_rows(&path, vclock, &temporary, &mut rows)?;
        }
        // The open WAL file is still `.inprogress` and invisible to the
        // scan; when a replica runs dry while rows sit in it, rotate it
        // into view.
        if rows.is_empty() {
            let mut wal = self
                .wal
                .lock()
                .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))?;
            if wal.writer.as_ref().is_some_and(|w| w.row_count() > 0)
                && let Some(writer) = wal.writer.take()
            {
                writer
                    .close()
                    .map_err(|e| BoxError::new(ErrorCode::WalIo, e.to_string()))?;
                drop(wal);
                let files = self
                    .wal_dir
                    .scan()
                    .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
                rows.clear();
                for (_, path) in files {
                    collect_wal_rows(&path, vclock, &temporary, &mut rows)?;
                }
            }
        }
        rows.sort_by_key(|r| r.lsn);
        Ok(rows)
    }
}

fn collect_wal_rows(
    path: &Path,
    vclock: &Vclock,
    temporary: &HashSet<u32>,
    rows: &mut Vec<Row>,
) -> BoxResult<()> {
    let mut cursor = XlogCursor::open_expect(path, FileType::Xlog)
        .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
    loop {
        match cursor.next_tx() {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => return Err(BoxError::new(ErrorCode::XlogGap, e.to_string())),
        }
        while let Some(row) = cursor
            .next_row()
            .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?
        {
            if row.space_id == Some(crate::xlog::ROW_INDEX_SPACE_ID) {
                continue;
            }
            if row.space_id.is_some_and(|id| temporary.contains(&id)) {
                continue;
            }
            if row.lsn > vclock.get(row.server_id) {
                rows.push(row);
            }
        }
    }
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Identity persistence
// ------------------------------------------------------------------------------------------------

fn load_or_create_identity(snap_dir: &Path) -> BoxResult<(Uuid, Uuid)> {
    std::fs::create_dir_all(snap_dir)
        .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
    let path = snap_dir.join("instance.meta");
    if let Ok(text) = std::fs::read_to_string(&path) {
        let mut lines = text.lines();
        let instance = lines.next().and_then(|l| Uuid::parse_str(l.trim()).ok());
        let cluster = lines.next().and_then(|l| Uuid::parse_str(l.trim()).ok());
        if let (Some(instance), Some(cluster)) = (instance, cluster) {
            return Ok((instance, cluster));
        }
        warn!(path = %path.display(), "instance meta unreadable, regenerating");
    }
    let instance = Uuid::new_v4();
    let cluster = Uuid::new_v4();
    std::fs::write(&path, format!("{instance}\n{cluster}\n"))
        .map_err(|e| BoxError::new(ErrorCode::System, e.to_string()))?;
    Ok((instance, cluster))
}
