//! Spaces, indexes, and the engine capability seams.
//!
//! A space is a numeric-id table with a bag of indexes keyed by
//! ordinal (gaps allowed); index 0 is the primary key. Secondary
//! indexes store full comparison tuples derived with
//! [`KeyDef::build_secondary`] and recover primary keys through the
//! secondary-to-primary extractor.
//!
//! Storage engines plug in behind two small capability traits instead
//! of a class hierarchy: [`Engine`] covers lifecycle (create index,
//! recovery hooks, checkpoint) and [`SpaceHandler`] covers the typed
//! write operations. This crate ships the LSM engine; the in-memory
//! engine is a seam only.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{BoxError, BoxResult, ErrorCode};
use crate::keydef::KeyDef;
use crate::range::LsmIndex;
use crate::tuple::TupleFormat;

/// Index access structure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    /// Hash table (in-memory engine only).
    Hash,
    /// Ordered tree.
    Tree,
    /// Bitset (in-memory engine only).
    Bitset,
    /// R*-tree (in-memory engine only).
    Rtree,
}

/// Index definition: ordinal, name, kind, and key descriptor.
#[derive(Debug, Clone)]
pub struct IndexDef {
    /// Ordinal within the space; 0 is the primary key.
    pub index_id: u32,
    /// Human-readable name.
    pub name: String,
    /// Access structure kind.
    pub kind: IndexKind,
    /// Key descriptor as declared (secondary defs are not yet merged
    /// with the primary).
    pub key_def: Arc<KeyDef>,
}

/// Engine-specific index body.
pub enum IndexBody {
    /// LSM-backed index.
    Lsm(Arc<LsmIndex>),
}

/// One index of a space.
pub struct Index {
    /// Definition.
    pub def: IndexDef,
    /// Full comparison definition (secondary parts + missing primary
    /// parts); equals `def.key_def` for the primary index.
    pub cmp_def: Arc<KeyDef>,
    /// Extractor from a stored secondary tuple back to a primary key.
    pub to_primary: Option<Arc<KeyDef>>,
    /// Engine body.
    pub body: IndexBody,
}

impl Index {
    /// The LSM body of this index.
    pub fn lsm(&self) -> &Arc<LsmIndex> {
        match &self.body {
            IndexBody::Lsm(lsm) => lsm,
        }
    }
}

/// Space definition.
#[derive(Debug, Clone)]
pub struct SpaceDef {
    /// Numeric id.
    pub id: u32,
    /// Human-readable name.
    pub name: String,
    /// Owning engine ("vinyl" here; "memtx" is a seam).
    pub engine: String,
    /// Exact field count enforced on every tuple, when set.
    pub field_count: Option<u32>,
    /// Temporary spaces are memory-only: excluded from the WAL,
    /// snapshots, replication, and background dumps. Their content
    /// does not survive a restart.
    pub temporary: bool,
}

/// A space: definition, tuple format, and its indexes.
pub struct Space {
    /// Definition.
    pub def: SpaceDef,
    /// Tuple format derived from all index key definitions.
    pub format: Arc<TupleFormat>,
    /// Indexes by ordinal; gaps allowed.
    pub indexes: BTreeMap<u32, Index>,
}

impl Space {
    /// The primary index.
    pub fn primary(&self) -> BoxResult<&Index> {
        self.indexes.get(&0).ok_or_else(|| {
            BoxError::new(
                ErrorCode::NoSuchIndex,
                format!("space '{}' has no primary index", self.def.name),
            )
        })
    }

    /// Index by ordinal.
    pub fn index(&self, index_id: u32) -> BoxResult<&Index> {
        self.indexes.get(&index_id).ok_or_else(|| {
            BoxError::new(
                ErrorCode::NoSuchIndex,
                format!("no index #{index_id} in space '{}'", self.def.name),
            )
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Capability traits
// ------------------------------------------------------------------------------------------------

/// Engine lifecycle capabilities.
pub trait Engine: Send + Sync {
    /// Engine name as referenced by space definitions.
    fn name(&self) -> &str;

    /// Creates (or recovers) the body of one index.
    fn create_index(&self, space: &SpaceDef, def: &IndexDef) -> BoxResult<IndexBody>;

    /// Called when a fresh instance bootstraps with no local data.
    fn bootstrap(&self) -> BoxResult<()>;

    /// Called before local rows are replayed into the engine.
    fn begin_recovery(&self) -> BoxResult<()>;

    /// Called after the last local row; the engine goes read-write.
    fn end_recovery(&self) -> BoxResult<()>;

    /// Moves all in-memory state at or below `lsn` to disk.
    fn checkpoint(&self, lsn: i64) -> BoxResult<()>;
}

/// Typed write operations on one space.
pub trait SpaceHandler {
    /// Inserts or overwrites a tuple.
    fn replace(&self, tuple: &[u8]) -> BoxResult<()>;

    /// Deletes by primary or secondary key.
    fn delete(&self, index_id: u32, key: &[u8]) -> BoxResult<()>;

    /// Reads by key, applies operations, writes back.
    fn update(&self, index_id: u32, key: &[u8], ops: &[u8]) -> BoxResult<()>;

    /// Applies operations to an existing tuple or inserts the fallback.
    fn upsert(&self, tuple: &[u8], ops: &[u8]) -> BoxResult<()>;
}
