//! K-way merge over statement sources.

use std::cmp::Ordering;
use std::sync::Arc;

use crate::keydef::KeyDef;
use crate::stmt::Statement;

use super::{IteratorError, IteratorType, RestoreResult, StmtIterator};

struct MergeSrc {
    iter: Box<dyn StmtIterator>,
    /// Newest unconsumed statement of the source's current key.
    stmt: Option<Arc<Statement>>,
    /// Whether `stmt` has been fetched at least once.
    primed: bool,
    /// Member of the current key's front: its key equals the merge
    /// iterator's current key.
    front: bool,
    /// Uncommitted source: its versions outrank every committed LSN.
    is_txw: bool,
}

impl MergeSrc {
    fn effective_lsn(&self) -> i64 {
        if self.is_txw {
            i64::MAX
        } else {
            self.stmt.as_ref().map_or(i64::MIN, |s| s.lsn())
        }
    }
}

/// Merges N sources into one `(key, lsn DESC)` stream.
///
/// Sources are added in priority order — transaction writes first, then
/// mutable in-memory trees (newest first), then frozen mems, then runs
/// (newest first). For every key, all sources holding that key form the
/// *front*; versions are drained front-wide in LSN order before the
/// next key is selected.
///
/// When the search key carries all key parts and the type is EQ, GE, or
/// LE, the unique-index fast path stops priming lower-priority sources
/// as soon as a higher-priority source matches the key exactly; with a
/// unique index, nothing below can hold a smaller key.
pub struct MergeIterator {
    key_def: Arc<KeyDef>,
    itype: IteratorType,
    key: Vec<u8>,
    sources: Vec<MergeSrc>,
    /// Key group currently being drained.
    cur_key: Option<Vec<u8>>,
    /// LSN of the last returned version of the current key; `None`
    /// right after the key is selected.
    last_lsn: Option<i64>,
    /// Source that produced the last returned version.
    returned_src: Option<usize>,
    unique_opt: bool,
    eof: bool,
}

impl MergeIterator {
    /// Creates an empty merge iterator; add sources in priority order
    /// with [`MergeIterator::add`].
    pub fn new(key_def: Arc<KeyDef>, itype: IteratorType, key: &[u8]) -> MergeIterator {
        let full_key = !key.is_empty()
            && crate::msgpack::read_array_len(key)
                .map(|(count, _)| count == key_def.part_count())
                .unwrap_or(false);
        let unique_opt = full_key
            && matches!(
                itype,
                IteratorType::Eq | IteratorType::Ge | IteratorType::Le
            );
        MergeIterator {
            key_def,
            itype,
            key: key.to_vec(),
            sources: Vec::new(),
            cur_key: None,
            last_lsn: None,
            returned_src: None,
            unique_opt,
            eof: false,
        }
    }

    /// Adds a source; earlier sources outrank later ones.
    pub fn add(&mut self, iter: Box<dyn StmtIterator>, is_txw: bool) {
        self.sources.push(MergeSrc {
            iter,
            stmt: None,
            primed: false,
            front: false,
            is_txw,
        });
    }

    /// Number of sources.
    pub fn src_count(&self) -> usize {
        self.sources.len()
    }

    fn compare_stmts(&self, a: &Statement, b: &Statement) -> Result<Ordering, IteratorError> {
        Ok(Statement::compare(a, b, &self.key_def)?)
    }

    /// Advances to the next key group and returns its newest version.
    pub fn next_key(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        if self.eof {
            return Ok(None);
        }
        // Consume the previous front.
        for src in &mut self.sources {
            if src.front {
                src.stmt = src.iter.next_key()?;
                src.front = false;
            }
        }

        // Select the best key among sources, priming lazily.
        let mut best: Option<usize> = None;
        for i in 0..self.sources.len() {
            if !self.sources[i].primed {
                self.sources[i].stmt = self.sources[i].iter.next_key()?;
                self.sources[i].primed = true;
            }
            let Some(stmt) = self.sources[i].stmt.clone() else {
                continue;
            };
            match best {
                None => best = Some(i),
                Some(b) => {
                    let Some(cur_best) = self.sources[b].stmt.clone() else {
                        best = Some(i);
                        continue;
                    };
                    let cmp = self.compare_stmts(&stmt, &cur_best)?;
                    let better = if self.itype.is_forward() {
                        cmp == Ordering::Less
                    } else {
                        cmp == Ordering::Greater
                    };
                    if better {
                        best = Some(i);
                    }
                }
            }
            // Unique fast path: an exact match at this priority level
            // makes lower-priority sources irrelevant for selection.
            if self.unique_opt
                && let Some(b) = best
                && let Some(best_stmt) = &self.sources[b].stmt
                && Statement::compare_with_key(best_stmt, &self.key, &self.key_def)?
                    == Ordering::Equal
            {
                break;
            }
        }

        let best_stmt = best.and_then(|b| self.sources[b].stmt.clone());
        let Some(best_stmt) = best_stmt else {
            self.eof = true;
            return Ok(None);
        };
        let cur_key = best_stmt.extract_key(&self.key_def)?;

        // Mark the front: every primed source holding the same key.
        for i in 0..self.sources.len() {
            if !self.sources[i].primed {
                continue;
            }
            let same = match &self.sources[i].stmt {
                Some(stmt) => self.compare_stmts(stmt, &best_stmt)? == Ordering::Equal,
                None => false,
            };
            self.sources[i].front = same;
        }

        // Return the newest version across the front.
        self.cur_key = Some(cur_key);
        self.last_lsn = None;
        self.returned_src = None;
        self.next_front_version()
    }

    /// Returns the next older version of the current key.
    pub fn next_lsn(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        if self.eof || self.cur_key.is_none() {
            return Ok(None);
        }
        // The source that produced the last version steps down its
        // chain first.
        if let Some(i) = self.returned_src {
            self.sources[i].stmt = self.sources[i].iter.next_lsn()?;
        }
        let result = self.next_front_version()?;
        if result.is_none() {
            // The front ran dry; sources skipped by the unique fast
            // path may still hold older versions of this key.
            if self.prime_lagging_sources()? {
                return self.next_front_version();
            }
        }
        Ok(result)
    }

    /// Primes sources skipped by the unique fast path; returns whether
    /// any joined the current front.
    fn prime_lagging_sources(&mut self) -> Result<bool, IteratorError> {
        let Some(cur_key) = self.cur_key.clone() else {
            return Ok(false);
        };
        let mut joined = false;
        for i in 0..self.sources.len() {
            if self.sources[i].primed {
                continue;
            }
            self.sources[i].stmt = self.sources[i].iter.next_key()?;
            self.sources[i].primed = true;
            if let Some(stmt) = &self.sources[i].stmt
                && Statement::compare_with_key(stmt, &cur_key, &self.key_def)?
                    == Ordering::Equal
            {
                self.sources[i].front = true;
                joined = true;
            }
        }
        Ok(joined)
    }

    /// Picks the highest-LSN version below `last_lsn` across the front.
    fn next_front_version(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        loop {
            let mut best: Option<usize> = None;
            let mut advanced_any = false;
            for i in 0..self.sources.len() {
                if !self.sources[i].front || self.sources[i].stmt.is_none() {
                    continue;
                }
                // Skip versions already returned (duplicates across
                // sources share an LSN).
                if let Some(last) = self.last_lsn
                    && self.sources[i].effective_lsn() >= last
                {
                    self.sources[i].stmt = self.sources[i].iter.next_lsn()?;
                    advanced_any = true;
                    continue;
                }
                match best {
                    None => best = Some(i),
                    Some(b) => {
                        if self.sources[i].effective_lsn() > self.sources[b].effective_lsn() {
                            best = Some(i);
                        }
                    }
                }
            }
            if let Some(b) = best
                && let Some(stmt) = self.sources[b].stmt.clone()
            {
                self.last_lsn = Some(self.sources[b].effective_lsn());
                self.returned_src = Some(b);
                return Ok(Some(stmt));
            }
            if !advanced_any {
                return Ok(None);
            }
        }
    }

    /// Re-checks mutable sources; `last` is the last statement the
    /// caller consumed. Returns `Changed` when any source moved.
    pub fn restore(&mut self, last: Option<&Statement>) -> Result<RestoreResult, IteratorError> {
        let mut changed = false;
        for src in &mut self.sources {
            if !src.primed {
                continue;
            }
            if src.iter.restore(last)? == RestoreResult::Changed {
                // The source repositioned itself past `last`; fetch its
                // new current key and keep it out of the stale front.
                src.stmt = src.iter.next_key()?;
                src.front = false;
                changed = true;
            }
        }
        if changed {
            self.eof = false;
            Ok(RestoreResult::Changed)
        } else {
            Ok(RestoreResult::Unchanged)
        }
    }

    /// Closes all sources.
    pub fn close(&mut self) {
        for src in &mut self.sources {
            src.iter.close();
        }
        self.sources.clear();
        self.eof = true;
    }
}
