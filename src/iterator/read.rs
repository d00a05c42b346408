//! The read iterator — what a SELECT sees.

use std::sync::Arc;

use tracing::trace;

use crate::keydef::KeyDef;
use crate::range::{LsmIndex, VyRange};
use crate::stmt::{apply_upsert, Statement, StmtType};

use super::txw::TxwSnapshotFn;
use super::{
    IteratorError, IteratorType, MemIterator, MergeIterator, RunIterator, TxwIterator,
};

/// Iterates an index in key order, composing a merge iterator per range
/// and materializing what a reader at `vlsn` is allowed to see: UPSERT
/// chains are applied (errors suppressed, the read path never fails on
/// a bad stored op) and keys whose newest visible version is a DELETE
/// are hidden.
///
/// The iterator watches the index and range versions; any structural
/// change (dump publication, compaction, split) rebuilds the merge
/// iterator just past the last returned key, so concurrent background
/// work never skips or duplicates keys.
pub struct ReadIterator {
    index: Arc<LsmIndex>,
    key_def: Arc<KeyDef>,
    itype: IteratorType,
    key: Vec<u8>,
    vlsn: i64,
    txw: Option<Arc<TxwSnapshotFn>>,
    cur_range: Option<Arc<VyRange>>,
    merge: Option<MergeIterator>,
    index_version: u32,
    range_version: u32,
    last_key: Option<Vec<u8>>,
    last_stmt: Option<Arc<Statement>>,
    eof: bool,
}

impl ReadIterator {
    /// Creates a read iterator over `index`.
    pub fn new(
        index: Arc<LsmIndex>,
        itype: IteratorType,
        key: &[u8],
        vlsn: i64,
        txw: Option<Arc<TxwSnapshotFn>>,
    ) -> ReadIterator {
        let key_def = Arc::clone(index.key_def());
        ReadIterator {
            index,
            key_def,
            itype,
            key: key.to_vec(),
            vlsn,
            txw,
            cur_range: None,
            merge: None,
            index_version: 0,
            range_version: 0,
            last_key: None,
            last_stmt: None,
            eof: false,
        }
    }

    /// Search parameters for (re)building the merge iterator: continue
    /// strictly past the last returned key, or start fresh.
    fn search_params(&self) -> (IteratorType, Vec<u8>) {
        match &self.last_key {
            None => (self.itype, self.key.clone()),
            Some(last) => {
                let itype = if self.itype.is_forward() {
                    IteratorType::Gt
                } else {
                    IteratorType::Lt
                };
                (itype, last.clone())
            }
        }
    }

    /// Picks the range containing the current search position.
    fn locate_range(&self) -> Result<Arc<VyRange>, IteratorError> {
        let (_, key) = self.search_params();
        if key.is_empty() {
            let ranges = self.index.ranges();
            let range = if self.itype.is_forward() {
                ranges.first()
            } else {
                ranges.last()
            };
            return range
                .cloned()
                .ok_or_else(|| {
                    IteratorError::Range(crate::range::RangeError::Internal(
                        "range cover is empty".into(),
                    ))
                });
        }
        Ok(self.index.find_range(&key)?)
    }

    /// Builds the merge iterator for `range`, honoring its shadow.
    fn build_merge(&mut self, range: Arc<VyRange>) -> Result<(), IteratorError> {
        let (itype, key) = self.search_params();
        let mut merge = MergeIterator::new(Arc::clone(&self.key_def), itype, &key);

        if let Some(txw) = &self.txw {
            merge.add(
                Box::new(TxwIterator::new(
                    Arc::clone(&self.key_def),
                    itype,
                    &key,
                    Arc::clone(txw),
                )),
                true,
            );
        }

        // During compaction the shadow (the range being compacted away)
        // still holds all history; the new range only absorbs fresh
        // writes into its active mem.
        let shadow = range.shadow()?;
        let history = shadow.as_ref().unwrap_or(&range);

        if shadow.is_some() {
            merge.add(
                Box::new(MemIterator::new(
                    range.active_mem()?,
                    itype,
                    &key,
                    self.vlsn,
                )?),
                false,
            );
        }
        merge.add(
            Box::new(MemIterator::new(
                history.active_mem()?,
                itype,
                &key,
                self.vlsn,
            )?),
            false,
        );
        for mem in history.frozen_mems()? {
            merge.add(
                Box::new(MemIterator::new(mem, itype, &key, self.vlsn)?),
                false,
            );
        }
        for run in history.runs()? {
            merge.add(
                Box::new(RunIterator::new(
                    run,
                    Arc::clone(&self.key_def),
                    itype,
                    &key,
                    self.vlsn,
                )),
                false,
            );
        }

        trace!(
            range_id = range.id,
            sources = merge.src_count(),
            shadowed = shadow.is_some(),
            "read iterator merge built"
        );
        self.index_version = self.index.version();
        self.range_version = range.version();
        self.cur_range = Some(range);
        self.merge = Some(merge);
        Ok(())
    }

    /// Moves to the next range in iteration order; `false` at the end
    /// of the cover.
    fn advance_range(&mut self) -> Result<bool, IteratorError> {
        if self.itype.is_exact() {
            return Ok(false);
        }
        let Some(cur) = self.cur_range.take() else {
            return Ok(false);
        };
        self.merge = None;
        if self.itype.is_forward() {
            let Some(end) = cur.end() else {
                return Ok(false);
            };
            let next = self.index.find_range(end)?;
            self.build_merge(next)?;
        } else {
            let Some(begin) = cur.begin() else {
                return Ok(false);
            };
            // The predecessor is the range whose end equals our begin.
            let ranges = self.index.ranges();
            let mut prev = None;
            for range in ranges {
                if let Some(range_end) = range.end()
                    && self.key_def.compare_keys(range_end, begin)?
                        == std::cmp::Ordering::Equal
                {
                    prev = Some(range);
                    break;
                }
            }
            let Some(prev) = prev else {
                return Ok(false);
            };
            self.build_merge(prev)?;
        }
        Ok(true)
    }

    /// Whether `key` still belongs to the current range.
    fn in_current_range(&self, key: &[u8]) -> Result<bool, IteratorError> {
        let Some(range) = &self.cur_range else {
            return Ok(true);
        };
        Ok(crate::range::key_in_range(
            &self.key_def,
            key,
            range.begin(),
            range.end(),
        )?)
    }

    /// Returns the next visible, materialized statement, or `None` at
    /// the end of the iteration.
    pub fn next(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        if self.eof {
            return Ok(None);
        }
        loop {
            if self.merge.is_none() {
                let range = self.locate_range()?;
                self.build_merge(range)?;
            }

            // A structural change (dump, compaction, split) invalidates
            // the merge iterator; rebuild past the last returned key.
            let range_version = self.cur_range.as_ref().map(|r| r.version()).unwrap_or(0);
            if self.index.version() != self.index_version || range_version != self.range_version
            {
                if self.itype.is_exact() && self.last_key.is_some() {
                    // EQ returns a single key; it was already returned.
                    self.eof = true;
                    return Ok(None);
                }
                self.merge = None;
                self.cur_range = None;
                continue;
            }

            // Mutable sources (the write set, the active mem) may have
            // grown since the last call; reposition them past the last
            // returned statement before advancing.
            let next = {
                let Some(merge) = self.merge.as_mut() else {
                    continue; // rebuilt on the next pass
                };
                merge.restore(self.last_stmt.as_deref())?;
                merge.next_key()?
            };
            let Some(stmt) = next else {
                if self.advance_range()? {
                    continue;
                }
                self.eof = true;
                return Ok(None);
            };

            let stmt_key = stmt.extract_key(&self.key_def)?;
            if !self.in_current_range(&stmt_key)? {
                // A clipped run can hold keys past the range bounds;
                // the owning range will surface them.
                if self.advance_range()? {
                    continue;
                }
                self.eof = true;
                return Ok(None);
            }
            self.last_key = Some(stmt_key);
            self.last_stmt = Some(Arc::clone(&stmt));

            // Apply the UPSERT chain down to a terminal version.
            let mut cur = stmt;
            while cur.stmt_type() == StmtType::Upsert {
                let older = self.merge.as_mut().expect("merge present").next_lsn()?;
                cur = apply_upsert(&cur, older.as_deref(), &self.key_def, true)?;
                if older.is_none() {
                    break;
                }
            }

            match cur.stmt_type() {
                StmtType::Delete => continue,
                _ => return Ok(Some(cur)),
            }
        }
    }

    /// Key of the last returned statement.
    pub fn last_key(&self) -> Option<&[u8]> {
        self.last_key.as_deref()
    }

    /// Closes the iterator.
    pub fn close(&mut self) {
        if let Some(merge) = &mut self.merge {
            merge.close();
        }
        self.merge = None;
        self.eof = true;
    }
}
