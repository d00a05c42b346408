//! The write iterator — the dump/compaction pipeline.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::keydef::KeyDef;
use crate::mem::VyMem;
use crate::run::Run;
use crate::stmt::{apply_upsert, Statement, StmtType};

use super::{IteratorError, IteratorType, MemIterator, MergeIterator, RunIterator};

/// Streams the merged content of a set of mems and runs in `(key ASC,
/// lsn DESC)` order, reduced to what future readers can still need:
///
/// 1. Versions with `lsn > oldest_vlsn` pass through unchanged — some
///    read view may still require them.
/// 2. The newest version at or below `oldest_vlsn` is the boundary:
///    REPLACE passes, DELETE passes unless this is the last level,
///    UPSERT squashes through older versions until it hits a terminal
///    statement (and on the last level a lingering UPSERT materializes
///    as a REPLACE).
/// 3. Everything older is discarded.
pub struct WriteIterator {
    key_def: Arc<KeyDef>,
    merge: MergeIterator,
    oldest_vlsn: i64,
    is_last_level: bool,
    /// Output queue for the current key, newest first.
    pending: VecDeque<Arc<Statement>>,
    eof: bool,
}

impl WriteIterator {
    /// Creates a write iterator; add sources newest-first with
    /// [`WriteIterator::add_mem`] / [`WriteIterator::add_run`].
    pub fn new(key_def: Arc<KeyDef>, oldest_vlsn: i64, is_last_level: bool) -> WriteIterator {
        let merge = MergeIterator::new(Arc::clone(&key_def), IteratorType::All, &[]);
        WriteIterator {
            key_def,
            merge,
            oldest_vlsn,
            is_last_level,
            pending: VecDeque::new(),
            eof: false,
        }
    }

    /// Adds an in-memory tree as a source.
    pub fn add_mem(&mut self, mem: Arc<VyMem>) -> Result<(), IteratorError> {
        let iter = MemIterator::new(mem, IteratorType::All, &[], i64::MAX)?;
        self.merge.add(Box::new(iter), false);
        Ok(())
    }

    /// Adds a run as a source.
    pub fn add_run(&mut self, run: Arc<Run>) {
        let iter = RunIterator::new(
            run,
            Arc::clone(&self.key_def),
            IteratorType::All,
            &[],
            i64::MAX,
        );
        self.merge.add(Box::new(iter), false);
    }

    /// Returns the next statement to write, or `None` when the input is
    /// exhausted.
    pub fn next(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        loop {
            if let Some(stmt) = self.pending.pop_front() {
                return Ok(Some(stmt));
            }
            if self.eof {
                return Ok(None);
            }
            self.fill_next_key()?;
        }
    }

    /// Processes one whole key group into `pending`.
    fn fill_next_key(&mut self) -> Result<(), IteratorError> {
        let Some(newest) = self.merge.next_key()? else {
            self.eof = true;
            return Ok(());
        };

        // 1. Versions some read view may still need.
        let mut cur = Some(newest);
        while let Some(v) = &cur {
            if v.lsn() <= self.oldest_vlsn {
                break;
            }
            self.pending.push_back(Arc::clone(v));
            cur = self.merge.next_lsn()?;
        }

        // 2. The boundary version.
        if let Some(boundary) = cur {
            match boundary.stmt_type() {
                StmtType::Replace => self.pending.push_back(boundary),
                StmtType::Delete => {
                    if !self.is_last_level {
                        self.pending.push_back(boundary);
                    }
                }
                StmtType::Upsert => {
                    let mut acc = boundary;
                    loop {
                        let older = self.merge.next_lsn()?;
                        match older {
                            None => {
                                if self.is_last_level {
                                    acc = apply_upsert(&acc, None, &self.key_def, true)?;
                                }
                                break;
                            }
                            Some(older) => {
                                let terminal = older.stmt_type() != StmtType::Upsert;
                                acc = apply_upsert(&acc, Some(&older), &self.key_def, true)?;
                                if terminal {
                                    break;
                                }
                            }
                        }
                    }
                    self.pending.push_back(acc);
                }
                StmtType::Select => {}
            }
        }

        // 3. Drop the rest of the chain.
        while self.merge.next_lsn()?.is_some() {}
        Ok(())
    }

    /// Closes all sources.
    pub fn close(&mut self) {
        self.merge.close();
        self.pending.clear();
        self.eof = true;
    }
}
