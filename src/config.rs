//! Engine configuration.
//!
//! One plain struct covers every recognized option; [`Db::open`]
//! (`crate::db::Db::open`) consumes it. Defaults are production-shaped;
//! tests override the handful of knobs they exercise via struct-update
//! syntax.

use std::path::PathBuf;
use std::time::Duration;

pub use crate::xlog::SyncMode as WalMode;

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct BoxConfig {
    /// Bind address for the replication relay; `None` disables it.
    pub listen: Option<String>,
    /// Directory for write-ahead logs.
    pub wal_dir: PathBuf,
    /// Directory for snapshots.
    pub snap_dir: PathBuf,
    /// Root directory for LSM data (`<vinyl_dir>/<space>/<index>/`).
    pub vinyl_dir: PathBuf,
    /// Hard memory quota for in-memory trees, bytes.
    pub vinyl_memory_limit: u64,
    /// Dump/compaction worker threads.
    pub vinyl_threads: usize,
    /// Default target size of one range, bytes.
    pub vinyl_range_size: u64,
    /// Default target size of one run page, bytes.
    pub vinyl_page_size: u32,
    /// Default run count per range that triggers compaction.
    pub vinyl_compact_wm: u32,
    /// WAL durability mode.
    pub wal_mode: WalMode,
    /// Rows per WAL file before rotation.
    pub rows_per_wal: u64,
    /// Background snapshot interval; `None` disables it.
    pub snapshot_period: Option<Duration>,
    /// Snapshots retained by garbage collection.
    pub snapshot_count: usize,
    /// Master URIs to replicate from.
    pub replication_source: Vec<String>,
    /// Reject write requests.
    pub read_only: bool,
    /// Origin id of this instance within the replica set.
    pub instance_id: u32,
    /// Stop recovery on a corrupt WAL record instead of skipping it.
    pub panic_on_wal_error: bool,
    /// Stop recovery on a corrupt snapshot record.
    pub panic_on_snap_error: bool,
    /// Follow a data directory owned by another live instance.
    pub hot_standby: bool,
}

impl Default for BoxConfig {
    fn default() -> Self {
        BoxConfig {
            listen: None,
            wal_dir: PathBuf::from("."),
            snap_dir: PathBuf::from("."),
            vinyl_dir: PathBuf::from("."),
            vinyl_memory_limit: 1 << 30,
            vinyl_threads: 2,
            vinyl_range_size: 1 << 30,
            vinyl_page_size: 128 * 1024,
            vinyl_compact_wm: 2,
            wal_mode: WalMode::Write,
            rows_per_wal: 500_000,
            snapshot_period: None,
            snapshot_count: 2,
            replication_source: Vec::new(),
            read_only: false,
            instance_id: 1,
            panic_on_wal_error: true,
            panic_on_snap_error: true,
            hot_standby: false,
        }
    }
}

impl BoxConfig {
    /// A configuration rooted entirely under one directory — the usual
    /// test and embedded-use shape.
    pub fn rooted(dir: impl Into<PathBuf>) -> BoxConfig {
        let dir = dir.into();
        BoxConfig {
            wal_dir: dir.join("wal"),
            snap_dir: dir.join("snap"),
            vinyl_dir: dir.join("vinyl"),
            ..BoxConfig::default()
        }
    }
}
