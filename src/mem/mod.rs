//! In-memory statement trees.
//!
//! A [`VyMem`] absorbs committed statements for one range until a dump
//! moves them to disk. Statements are ordered by `(key per the index
//! key definition ASC, lsn DESC)`, so the newest version of a key is
//! always the first entry of its key group.
//!
//! The tree carries a 32-bit version, bumped on every insert; iterators
//! snapshot the version and rebuild through `restore()` when it moved.
//! `used` tracks the bytes consumed by resident statements and is
//! charged against the engine quota by the committer. A dumped mem is
//! dropped wholesale, reclaiming its whole LSN epoch in one step.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use thiserror::Error;

use crate::keydef::KeyDef;
use crate::stmt::{Statement, StmtError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by mem operations.
#[derive(Debug, Error)]
pub enum MemError {
    /// Key extraction failure.
    #[error("statement error: {0}")]
    Stmt(#[from] StmtError),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Tree key
// ------------------------------------------------------------------------------------------------

/// Sentinel LSN that sorts a probe before every real version of a key.
pub const LSN_PROBE: i64 = i64::MAX - 1;

/// Tree ordering key: extracted key bytes compared through the index
/// key definition, then LSN descending.
#[derive(Clone)]
struct TreeKey {
    key_def: Arc<KeyDef>,
    key: Box<[u8]>,
    lsn: i64,
}

impl TreeKey {
    fn order_keys(&self, other: &TreeKey) -> std::cmp::Ordering {
        self.key_def
            .compare_keys(&self.key, &other.key)
            // Keys in the tree are pre-validated; a decode failure can
            // only mean corruption, where byte order keeps the tree
            // total and deterministic.
            .unwrap_or_else(|_| self.key.cmp(&other.key))
    }
}

impl PartialEq for TreeKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for TreeKey {}
impl PartialOrd for TreeKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TreeKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.order_keys(other)
            .then_with(|| other.lsn.cmp(&self.lsn))
    }
}

impl std::fmt::Debug for TreeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeKey")
            .field("lsn", &self.lsn)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// VyMem
// ------------------------------------------------------------------------------------------------

/// One in-memory statement tree. See the [module docs](self).
pub struct VyMem {
    key_def: Arc<KeyDef>,
    tree: RwLock<BTreeMap<TreeKey, Arc<Statement>>>,
    /// Bumped on every insert so iterators can detect mutation.
    version: AtomicU32,
    /// Bytes consumed by resident statement payloads.
    used: AtomicUsize,
    min_lsn: AtomicI64,
    max_lsn: AtomicI64,
}

impl VyMem {
    /// Creates an empty mem ordered by `key_def`.
    pub fn new(key_def: Arc<KeyDef>) -> Arc<VyMem> {
        Arc::new(VyMem {
            key_def,
            tree: RwLock::new(BTreeMap::new()),
            version: AtomicU32::new(0),
            used: AtomicUsize::new(0),
            min_lsn: AtomicI64::new(i64::MAX),
            max_lsn: AtomicI64::new(0),
        })
    }

    /// Key definition this mem is ordered by.
    pub fn key_def(&self) -> &Arc<KeyDef> {
        &self.key_def
    }

    /// Inserts a statement, unique by `(key, lsn)`; a duplicate insert
    /// of the same version replaces the previous pointer.
    pub fn insert(&self, stmt: Arc<Statement>) -> Result<(), MemError> {
        let key = stmt.extract_key(&self.key_def)?;
        let lsn = stmt.lsn();
        let size = stmt.data().len() + stmt.ops().map_or(0, <[u8]>::len);

        let tree_key = TreeKey {
            key_def: Arc::clone(&self.key_def),
            key: key.into_boxed_slice(),
            lsn,
        };
        {
            let mut tree = self
                .tree
                .write()
                .map_err(|_| MemError::Internal("RwLock poisoned".into()))?;
            tree.insert(tree_key, stmt);
        }

        self.used.fetch_add(size, AtomicOrdering::AcqRel);
        self.min_lsn.fetch_min(lsn, AtomicOrdering::AcqRel);
        self.max_lsn.fetch_max(lsn, AtomicOrdering::AcqRel);
        self.version.fetch_add(1, AtomicOrdering::AcqRel);
        Ok(())
    }

    /// Next older version of the statement's key: the entry with the
    /// same key and the greatest `lsn < stmt.lsn()`.
    pub fn older_lsn(&self, stmt: &Statement) -> Result<Option<Arc<Statement>>, MemError> {
        let key = stmt.extract_key(&self.key_def)?;
        let probe = TreeKey {
            key_def: Arc::clone(&self.key_def),
            key: key.clone().into_boxed_slice(),
            lsn: stmt.lsn(),
        };
        let tree = self
            .tree
            .read()
            .map_err(|_| MemError::Internal("RwLock poisoned".into()))?;
        for (tree_key, candidate) in tree.range((Bound::Excluded(probe.clone()), Bound::Unbounded)) {
            if probe.order_keys(tree_key) != std::cmp::Ordering::Equal {
                return Ok(None);
            }
            if tree_key.lsn < stmt.lsn() {
                return Ok(Some(Arc::clone(candidate)));
            }
        }
        Ok(None)
    }

    /// Newest version of `key` with `lsn ≤ vlsn`, if any.
    pub fn newest_visible(
        &self,
        key: &[u8],
        vlsn: i64,
    ) -> Result<Option<Arc<Statement>>, MemError> {
        let probe = TreeKey {
            key_def: Arc::clone(&self.key_def),
            key: key.to_vec().into_boxed_slice(),
            lsn: LSN_PROBE,
        };
        let tree = self
            .tree
            .read()
            .map_err(|_| MemError::Internal("RwLock poisoned".into()))?;
        for (tree_key, candidate) in tree.range(probe.clone()..) {
            if probe.order_keys(tree_key) != std::cmp::Ordering::Equal {
                return Ok(None);
            }
            if tree_key.lsn <= vlsn {
                return Ok(Some(Arc::clone(candidate)));
            }
        }
        Ok(None)
    }

    /// Snapshots all statements at or after `key` in key order (all
    /// versions, newest first per key). An empty `key` starts at −∞.
    pub fn collect_from(&self, key: &[u8]) -> Result<Vec<Arc<Statement>>, MemError> {
        let tree = self
            .tree
            .read()
            .map_err(|_| MemError::Internal("RwLock poisoned".into()))?;
        if key.is_empty() {
            return Ok(tree.values().cloned().collect());
        }
        let probe = TreeKey {
            key_def: Arc::clone(&self.key_def),
            key: key.to_vec().into_boxed_slice(),
            lsn: LSN_PROBE,
        };
        Ok(tree.range(probe..).map(|(_, v)| Arc::clone(v)).collect())
    }

    /// Snapshots all statements up to and including key group `key`,
    /// in key order. An empty `key` means all of the tree.
    pub fn collect_to(&self, key: &[u8]) -> Result<Vec<Arc<Statement>>, MemError> {
        let tree = self
            .tree
            .read()
            .map_err(|_| MemError::Internal("RwLock poisoned".into()))?;
        if key.is_empty() {
            return Ok(tree.values().cloned().collect());
        }
        // The upper probe sorts after every version of `key` (lsn = -1
        // orders below all real LSNs of the same key).
        let probe = TreeKey {
            key_def: Arc::clone(&self.key_def),
            key: key.to_vec().into_boxed_slice(),
            lsn: -1,
        };
        Ok(tree
            .range(..=probe)
            .map(|(_, v)| Arc::clone(v))
            .collect())
    }

    /// Snapshots the whole tree in key order.
    pub fn collect_all(&self) -> Result<Vec<Arc<Statement>>, MemError> {
        self.collect_from(&[])
    }

    /// Number of resident statements.
    pub fn len(&self) -> usize {
        self.tree.read().map(|t| t.len()).unwrap_or(0)
    }

    /// Whether the tree is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mutation counter.
    pub fn version(&self) -> u32 {
        self.version.load(AtomicOrdering::Acquire)
    }

    /// Bytes consumed by resident statements.
    pub fn used(&self) -> usize {
        self.used.load(AtomicOrdering::Acquire)
    }

    /// Lowest LSN resident in this mem ([`i64::MAX`] when empty).
    pub fn min_lsn(&self) -> i64 {
        self.min_lsn.load(AtomicOrdering::Acquire)
    }

    /// Highest LSN resident in this mem (0 when empty).
    pub fn max_lsn(&self) -> i64 {
        self.max_lsn.load(AtomicOrdering::Acquire)
    }
}

impl std::fmt::Debug for VyMem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VyMem")
            .field("len", &self.len())
            .field("used", &self.used())
            .field("version", &self.version())
            .field("min_lsn", &self.min_lsn())
            .field("max_lsn", &self.max_lsn())
            .finish()
    }
}
