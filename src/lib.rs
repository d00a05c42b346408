//! # BorealDB
//!
//! An embeddable, transactional database engine built around a
//! **log-structured merge tree** with range partitioning, MVCC
//! transactions, a write-ahead log with snapshots, and asynchronous
//! master→replica replication.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                             Db                                │
//! │   ┌──────────────┐   ┌───────────────┐   ┌────────────────┐   │
//! │   │ Transactions │   │   WAL (xlog)  │   │  Replication   │   │
//! │   │  MVCC + SSI  │   │  + snapshots  │   │ applier/relay  │   │
//! │   └──────┬───────┘   └───────┬───────┘   └────────────────┘   │
//! │          │ commit            │ replay                         │
//! │   ┌──────▼───────────────────▼──────────────────────────────┐ │
//! │   │                     LSM indexes                         │ │
//! │   │  ranges ── active mem ── frozen mems ── runs (disk)     │ │
//! │   └──────────────────────────┬──────────────────────────────┘ │
//! │                              │ dump / compact                 │
//! │   ┌──────────────────────────▼──────────────────────────────┐ │
//! │   │        Scheduler: worker pool + memory quota            │ │
//! │   └─────────────────────────────────────────────────────────┘ │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Engine facade — open, transactions, checkpoint, close |
//! | [`tx`] | MVCC transactions, read/write sets, conflict manager |
//! | [`iterator`] | Run/mem/txw/merge/read/write iterator stack |
//! | [`range`] | Range partitions and the per-index LSM container |
//! | [`run`] | Immutable on-disk runs: pages + page index |
//! | [`mem`] | In-memory statement trees |
//! | [`stmt`] | Statement codec and UPSERT application |
//! | [`tuple`] | Tuples, formats, MessagePack field typing |
//! | [`keydef`] | Multi-part key descriptors and comparators |
//! | [`msgpack`] | The MessagePack wire codec |
//! | [`xlog`] | Append-only row-group files: WAL, snapshots, runs |
//! | [`vclock`] | Per-origin LSN vectors |
//! | [`recovery`] | Two-phase crash recovery |
//! | [`replication`] | Applier and relay state machines |
//! | [`scheduler`] | Background dump/compaction and upsert squash |
//! | [`quota`] | Memory quota with watermark feedback |
//! | [`space`] | Spaces, indexes, engine capability seams |
//! | [`config`] | Engine configuration |
//! | [`error`] | Error taxonomy and diagnostics area |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use borealdb::config::BoxConfig;
//! use borealdb::db::{Db, SpaceConfig};
//! use borealdb::iterator::IteratorType;
//! use borealdb::keydef::{FieldType, KeyDef, KeyDefOpts, KeyPart};
//! use borealdb::space::{IndexDef, IndexKind, SpaceDef};
//!
//! let schema = vec![SpaceConfig {
//!     def: SpaceDef {
//!         id: 512,
//!         name: "test".into(),
//!         engine: "vinyl".into(),
//!         field_count: None,
//!         temporary: false,
//!     },
//!     indexes: vec![IndexDef {
//!         index_id: 0,
//!         name: "pk".into(),
//!         kind: IndexKind::Tree,
//!         key_def: Arc::new(KeyDef::new(
//!             vec![KeyPart { field_no: 0, field_type: FieldType::Unsigned }],
//!             KeyDefOpts::default(),
//!         )),
//!     }],
//! }];
//!
//! let db = Db::open(BoxConfig::rooted("/tmp/my_db"), schema).unwrap();
//!
//! let mut tuple = Vec::new();
//! borealdb::msgpack::write_array_len(&mut tuple, 2);
//! borealdb::msgpack::write_uint(&mut tuple, 1);
//! borealdb::msgpack::write_str(&mut tuple, "hello");
//!
//! let tx = db.begin(false);
//! tx.replace(512, &tuple).unwrap();
//! tx.commit().unwrap();
//!
//! let tx = db.begin(true);
//! let mut key = Vec::new();
//! borealdb::msgpack::write_array_len(&mut key, 1);
//! borealdb::msgpack::write_uint(&mut key, 1);
//! let found = tx.select(512, 0, IteratorType::Eq, &key, 1).unwrap();
//! assert_eq!(found.len(), 1);
//! tx.commit().unwrap();
//!
//! db.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod config;
pub mod db;
pub mod error;
pub mod iterator;
pub mod keydef;
pub mod mem;
pub mod msgpack;
pub mod quota;
pub mod range;
pub mod recovery;
pub mod replication;
pub mod run;
pub mod scheduler;
pub mod space;
pub mod stmt;
pub mod tuple;
pub mod tx;
pub mod vclock;
pub mod xlog;
