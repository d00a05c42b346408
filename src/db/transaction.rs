//! Typed operations inside a transaction.

use std::sync::{Arc, Mutex};

use tracing::trace;

use crate::error::{BoxError, BoxResult, ErrorCode};
use crate::iterator::{IteratorType, ReadIterator};
use crate::msgpack;
use crate::space::{Index, Space, SpaceHandler};
use crate::stmt::{apply_update_ops, Statement};
use crate::tuple::Tuple;
use crate::tx::Tx;

use super::Db;

/// One open transaction against a [`Db`].
///
/// A transaction binds to the storage engine of the first space it
/// writes; a later write against a space of a different engine fails
/// with a cross-engine error. Dropping without [`Transaction::commit`]
/// rolls back.
pub struct Transaction {
    pub(super) db: Arc<Db>,
    pub(super) tx: Tx,
    /// Engine name of the first written space.
    pub(super) engine: Mutex<Option<String>>,
    pub(super) finished: bool,
}

impl Transaction {
    /// Transaction sequence number.
    pub fn tsn(&self) -> i64 {
        self.tx.tsn()
    }

    /// Opens a savepoint.
    pub fn savepoint(&self) -> BoxResult<usize> {
        self.tx.savepoint().map_err(BoxError::from)
    }

    /// Rolls back to a savepoint.
    pub fn rollback_to(&self, savepoint: usize) -> BoxResult<()> {
        self.tx.rollback_to(savepoint).map_err(BoxError::from)
    }

    /// Commits the transaction.
    pub fn commit(mut self) -> BoxResult<()> {
        self.finished = true;
        self.db.commit_tx(&self.tx)
    }

    /// Rolls the transaction back.
    pub fn rollback(mut self) -> BoxResult<()> {
        self.finished = true;
        self.tx.rollback().map_err(BoxError::from)
    }

    // --------------------------------------------------------------------------------------------
    // Reads
    // --------------------------------------------------------------------------------------------

    /// Selects up to `limit` tuples from `(space, index)` in the order
    /// of the given iterator type. Secondary-index results are
    /// materialized into full tuples through the primary index.
    pub fn select(
        &self,
        space_id: u32,
        index_id: u32,
        itype: IteratorType,
        key: &[u8],
        limit: usize,
    ) -> BoxResult<Vec<Vec<u8>>> {
        let space = self.db.space(space_id)?;
        let index = space.index(index_id)?;
        if !key.is_empty() {
            index
                .lsm()
                .key_def()
                .validate_key(key)
                .map_err(|e| BoxError::raise(ErrorCode::FieldTypeMismatch, e.to_string()))?;
        }

        let lsm = index.lsm();
        let mut reader = ReadIterator::new(
            Arc::clone(lsm),
            itype,
            key,
            self.tx.vlsn(),
            Some(self.tx.txw_snapshot_fn(lsm)),
        );

        let mut out = Vec::new();
        while out.len() < limit {
            let Some(stmt) = reader
                .next()
                .map_err(|e| BoxError::raise(ErrorCode::System, e.to_string()))?
            else {
                break;
            };
            let stmt_key = stmt
                .extract_key(lsm.key_def())
                .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
            self.tx
                .track_read(lsm, &stmt_key, false)
                .map_err(BoxError::from)?;

            if index.def.index_id == 0 {
                out.push(stmt.data().to_vec());
            } else if let Some(full) = self.materialize(&space, index, stmt.data())? {
                out.push(full);
            }
        }
        reader.close();

        if out.is_empty() && !key.is_empty() {
            // Negative lookup: remember the gap so a later writer of
            // this key conflicts with us.
            self.tx
                .track_read(lsm, key, true)
                .map_err(BoxError::from)?;
        }
        trace!(space_id, index_id, found = out.len(), "select");
        Ok(out)
    }

    /// Single-tuple lookup by full primary key.
    pub fn get(&self, space_id: u32, key: &[u8]) -> BoxResult<Option<Vec<u8>>> {
        Ok(self
            .select(space_id, 0, IteratorType::Eq, key, 1)?
            .into_iter()
            .next())
    }

    /// Looks a stored secondary tuple up in the primary index.
    fn materialize(
        &self,
        space: &Arc<Space>,
        index: &Index,
        stored: &[u8],
    ) -> BoxResult<Option<Vec<u8>>> {
        let to_primary = index.to_primary.as_ref().ok_or_else(|| {
            BoxError::new(ErrorCode::Internal, "secondary index without an extractor")
        })?;
        let pk = to_primary
            .extract_key(stored)
            .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
        let primary = space.primary()?;
        let lsm = primary.lsm();
        let mut reader = ReadIterator::new(
            Arc::clone(lsm),
            IteratorType::Eq,
            &pk,
            self.tx.vlsn(),
            Some(self.tx.txw_snapshot_fn(lsm)),
        );
        let result = reader
            .next()
            .map_err(|e| BoxError::raise(ErrorCode::System, e.to_string()))?;
        reader.close();
        Ok(result.map(|stmt| stmt.data().to_vec()))
    }

    // --------------------------------------------------------------------------------------------
    // Writes
    // --------------------------------------------------------------------------------------------

    /// Inserts a tuple; fails with a duplicate-key error when the
    /// primary key (or a unique secondary key) is taken.
    pub fn insert(&self, space_id: u32, tuple: &[u8]) -> BoxResult<()> {
        self.db.check_writable()?;
        let space = self.db.space(space_id)?;
        self.bind_engine(&space)?;
        self.validate(&space, tuple)?;
        let primary = space.primary()?;
        let pk = primary
            .cmp_def
            .extract_key(tuple)
            .map_err(|e| BoxError::raise(ErrorCode::FieldTypeMismatch, e.to_string()))?;

        if self.get(space_id, &pk)?.is_some() {
            return Err(BoxError::raise(
                ErrorCode::DuplicateKey,
                format!(
                    "duplicate key in unique index '{}' of space '{}'",
                    primary.def.name, space.def.name
                ),
            ));
        }
        self.check_unique_secondaries(&space, tuple, &pk)?;
        self.write_tuple(&space, tuple, None)
    }

    /// Inserts or overwrites a tuple.
    pub fn replace(&self, space_id: u32, tuple: &[u8]) -> BoxResult<()> {
        self.db.check_writable()?;
        let space = self.db.space(space_id)?;
        self.bind_engine(&space)?;
        self.validate(&space, tuple)?;
        let primary = space.primary()?;
        let pk = primary
            .cmp_def
            .extract_key(tuple)
            .map_err(|e| BoxError::raise(ErrorCode::FieldTypeMismatch, e.to_string()))?;

        // Secondary maintenance needs the previous version.
        let old = if space.indexes.len() > 1 {
            self.get(space_id, &pk)?
        } else {
            None
        };
        self.write_tuple(&space, tuple, old.as_deref())
    }

    /// Deletes the tuple matching `key` on `(space, index)`.
    pub fn delete(&self, space_id: u32, index_id: u32, key: &[u8]) -> BoxResult<()> {
        self.db.check_writable()?;
        let space = self.db.space(space_id)?;
        self.bind_engine(&space)?;
        let found = self.select(space_id, index_id, IteratorType::Eq, key, 1)?;
        let Some(old) = found.into_iter().next() else {
            return Ok(()); // nothing to delete
        };

        let primary = space.primary()?;
        let pk = primary
            .cmp_def
            .extract_key(&old)
            .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
        self.tx
            .write(primary.lsm(), pk.clone(), Statement::new_delete(&pk))
            .map_err(BoxError::from)?;

        for (ordinal, index) in &space.indexes {
            if *ordinal == 0 {
                continue;
            }
            let stored = index
                .cmp_def
                .extract_key(&old)
                .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
            self.tx
                .write(index.lsm(), stored.clone(), Statement::new_delete(&stored))
                .map_err(BoxError::from)?;
        }
        Ok(())
    }

    /// Reads the tuple matching `key`, applies `ops`, and writes the
    /// result back. Changing the primary key is rejected.
    pub fn update(
        &self,
        space_id: u32,
        index_id: u32,
        key: &[u8],
        ops: &[u8],
    ) -> BoxResult<()> {
        self.db.check_writable()?;
        let space = self.db.space(space_id)?;
        self.bind_engine(&space)?;
        let found = self.select(space_id, index_id, IteratorType::Eq, key, 1)?;
        let Some(old) = found.into_iter().next() else {
            return Ok(()); // update of a missing tuple is a no-op
        };

        let updated = apply_update_ops(&old, ops, 1, false)
            .map_err(|e| BoxError::raise(ErrorCode::IllegalParams, e.to_string()))?;
        self.validate(&space, &updated)?;

        let primary = space.primary()?;
        let old_pk = primary
            .cmp_def
            .extract_key(&old)
            .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
        let new_pk = primary
            .cmp_def
            .extract_key(&updated)
            .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
        if primary
            .cmp_def
            .compare_keys(&old_pk, &new_pk)
            .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?
            != std::cmp::Ordering::Equal
        {
            return Err(BoxError::raise(
                ErrorCode::IllegalParams,
                "update must not modify the primary key",
            ));
        }
        self.write_tuple(&space, &updated, Some(&old))
    }

    /// Applies `ops` to the existing version of the tuple's key, or
    /// inserts the fallback tuple when the key is absent. Spaces with
    /// secondary indexes cannot take upserts.
    pub fn upsert(&self, space_id: u32, tuple: &[u8], ops: &[u8]) -> BoxResult<()> {
        self.db.check_writable()?;
        let space = self.db.space(space_id)?;
        self.bind_engine(&space)?;
        if space.indexes.len() > 1 {
            return Err(BoxError::raise(
                ErrorCode::IllegalParams,
                format!(
                    "space '{}' has secondary indexes, upsert is not supported",
                    space.def.name
                ),
            ));
        }
        self.validate(&space, tuple)?;
        // Ops must at least parse; application is deferred.
        apply_update_ops(tuple, ops, 1, true)
            .map_err(|e| BoxError::raise(ErrorCode::IllegalParams, e.to_string()))?;

        let primary = space.primary()?;
        let pk = primary
            .cmp_def
            .extract_key(tuple)
            .map_err(|e| BoxError::raise(ErrorCode::FieldTypeMismatch, e.to_string()))?;
        self.tx
            .write(primary.lsm(), pk, Statement::new_upsert(tuple, ops))
            .map_err(BoxError::from)
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Pins the transaction to `space`'s engine. The write set of one
    /// transaction must not span engines: the engines would each need
    /// their own prepare/commit, and there is no coordinator between
    /// them.
    fn bind_engine(&self, space: &Arc<Space>) -> BoxResult<()> {
        let mut engine = self
            .engine
            .lock()
            .map_err(|_| BoxError::new(ErrorCode::Internal, "mutex poisoned"))?;
        match engine.as_deref() {
            None => {
                *engine = Some(space.def.engine.clone());
                Ok(())
            }
            Some(bound) if bound == space.def.engine => Ok(()),
            Some(bound) => Err(BoxError::raise(
                ErrorCode::CrossEngineTransaction,
                format!(
                    "transaction already writes engine '{}', space '{}' belongs to '{}'",
                    bound, space.def.name, space.def.engine
                ),
            )),
        }
    }

    fn validate(&self, space: &Arc<Space>, tuple: &[u8]) -> BoxResult<()> {
        Tuple::new(Arc::clone(&space.format), tuple)
            .map_err(|e| BoxError::raise(ErrorCode::FieldTypeMismatch, e.to_string()))?;
        Ok(())
    }

    /// Buffers the primary REPLACE and all secondary maintenance
    /// writes for the transition `old → tuple`.
    fn write_tuple(
        &self,
        space: &Arc<Space>,
        tuple: &[u8],
        old: Option<&[u8]>,
    ) -> BoxResult<()> {
        let primary = space.primary()?;
        let pk = primary
            .cmp_def
            .extract_key(tuple)
            .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
        self.tx
            .write(primary.lsm(), pk, Statement::new_replace(tuple))
            .map_err(BoxError::from)?;

        for (ordinal, index) in &space.indexes {
            if *ordinal == 0 {
                continue;
            }
            let new_stored = index
                .cmp_def
                .extract_key(tuple)
                .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
            if let Some(old) = old {
                let old_stored = index
                    .cmp_def
                    .extract_key(old)
                    .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
                if old_stored != new_stored {
                    self.tx
                        .write(
                            index.lsm(),
                            old_stored.clone(),
                            Statement::new_delete(&old_stored),
                        )
                        .map_err(BoxError::from)?;
                }
            }
            self.tx
                .write(
                    index.lsm(),
                    new_stored.clone(),
                    Statement::new_replace(&new_stored),
                )
                .map_err(BoxError::from)?;
        }
        Ok(())
    }

    /// Enforces uniqueness of declared-unique secondary indexes for a
    /// fresh insert.
    fn check_unique_secondaries(
        &self,
        space: &Arc<Space>,
        tuple: &[u8],
        pk: &[u8],
    ) -> BoxResult<()> {
        for (ordinal, index) in &space.indexes {
            if *ordinal == 0 || !index.def.key_def.opts.unique {
                continue;
            }
            let stored = index
                .cmp_def
                .extract_key(tuple)
                .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
            let declared = key_prefix(&stored, index.def.key_def.part_count())?;
            let hits = self.select(
                space.def.id,
                index.def.index_id,
                IteratorType::Eq,
                &declared,
                1,
            )?;
            if let Some(hit) = hits.first() {
                let primary = space.primary()?;
                let hit_pk = primary
                    .cmp_def
                    .extract_key(hit)
                    .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
                if hit_pk != pk {
                    return Err(BoxError::raise(
                        ErrorCode::DuplicateKey,
                        format!(
                            "duplicate key in unique index '{}' of space '{}'",
                            index.def.name, space.def.name
                        ),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            let _ = self.tx.rollback();
        }
    }
}

/// First `count` values of a key array, re-wrapped as a key array.
fn key_prefix(key: &[u8], count: u32) -> BoxResult<Vec<u8>> {
    let (total, mut pos) = msgpack::read_array_len(key)
        .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
    let take = count.min(total);
    let mut out = Vec::with_capacity(key.len());
    msgpack::write_array_len(&mut out, take);
    for _ in 0..take {
        let len = msgpack::skip_value(&key[pos..])
            .map_err(|e| BoxError::new(ErrorCode::MsgpackDecode, e.to_string()))?;
        out.extend_from_slice(&key[pos..pos + len]);
        pos += len;
    }
    Ok(out)
}

// ------------------------------------------------------------------------------------------------
// Auto-commit space handle
// ------------------------------------------------------------------------------------------------

/// Auto-commit operations on one space — the [`SpaceHandler`] seam.
pub struct SpaceHandle {
    db: Arc<Db>,
    space_id: u32,
}

impl Db {
    /// An auto-commit handle on one space.
    pub fn handler(self: &Arc<Db>, space_id: u32) -> SpaceHandle {
        SpaceHandle {
            db: Arc::clone(self),
            space_id,
        }
    }
}

impl SpaceHandle {
    fn auto<T>(
        &self,
        f: impl FnOnce(&Transaction) -> BoxResult<T>,
    ) -> BoxResult<T> {
        let tx = self.db.begin(false);
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Single lookup by primary key, auto-commit.
    pub fn get(&self, key: &[u8]) -> BoxResult<Option<Vec<u8>>> {
        let tx = self.db.begin(true);
        let result = tx.get(self.space_id, key);
        tx.commit()?;
        result
    }

    /// Range select, auto-commit.
    pub fn select(
        &self,
        index_id: u32,
        itype: IteratorType,
        key: &[u8],
        limit: usize,
    ) -> BoxResult<Vec<Vec<u8>>> {
        let tx = self.db.begin(true);
        let result = tx.select(self.space_id, index_id, itype, key, limit);
        tx.commit()?;
        result
    }

    /// Insert with duplicate-key enforcement, auto-commit.
    pub fn insert(&self, tuple: &[u8]) -> BoxResult<()> {
        self.auto(|tx| tx.insert(self.space_id, tuple))
    }
}

impl SpaceHandler for SpaceHandle {
    fn replace(&self, tuple: &[u8]) -> BoxResult<()> {
        self.auto(|tx| tx.replace(self.space_id, tuple))
    }

    fn delete(&self, index_id: u32, key: &[u8]) -> BoxResult<()> {
        self.auto(|tx| tx.delete(self.space_id, index_id, key))
    }

    fn update(&self, index_id: u32, key: &[u8], ops: &[u8]) -> BoxResult<()> {
        self.auto(|tx| tx.update(self.space_id, index_id, key, ops))
    }

    fn upsert(&self, tuple: &[u8], ops: &[u8]) -> BoxResult<()> {
        self.auto(|tx| tx.upsert(self.space_id, tuple, ops))
    }
}
