//! Iterator over one on-disk run.

use std::sync::Arc;

use crate::keydef::KeyDef;
use crate::run::Run;
use crate::stmt::Statement;

use super::{IteratorError, IteratorType, RestoreResult, StmtIterator};

type Page = Arc<Vec<Arc<Statement>>>;

/// Iterator over a [`Run`].
///
/// Pages are located by binary search over the page index (page min
/// keys) and rows by binary search within the decoded page. The two
/// most recently decoded pages are kept resident; a sequential scan
/// therefore decodes each page exactly once.
pub struct RunIterator {
    run: Arc<Run>,
    key_def: Arc<KeyDef>,
    itype: IteratorType,
    key: Vec<u8>,
    vlsn: i64,
    /// Two-slot page LRU: `(page_no, decoded page)`, most recent first.
    cache: Vec<(usize, Page)>,
    /// Current position, `None` before the first `next_key`.
    pos: Option<(usize, usize)>,
    /// Key of the current group.
    cur_key: Option<Vec<u8>>,
    eof: bool,
    closed: bool,
}

impl RunIterator {
    /// Creates an iterator of the given type over `run`.
    pub fn new(
        run: Arc<Run>,
        key_def: Arc<KeyDef>,
        itype: IteratorType,
        key: &[u8],
        vlsn: i64,
    ) -> RunIterator {
        RunIterator {
            run,
            key_def,
            itype,
            key: key.to_vec(),
            vlsn,
            cache: Vec::with_capacity(2),
            pos: None,
            cur_key: None,
            eof: false,
            closed: false,
        }
    }

    fn load_page(&mut self, page_no: usize) -> Result<Page, IteratorError> {
        if let Some(at) = self.cache.iter().position(|(no, _)| *no == page_no) {
            let entry = self.cache.remove(at);
            let page = Arc::clone(&entry.1);
            self.cache.insert(0, entry);
            return Ok(page);
        }
        let page: Page = Arc::new(self.run.read_page(page_no)?);
        self.cache.insert(0, (page_no, Arc::clone(&page)));
        self.cache.truncate(2);
        Ok(page)
    }

    fn stmt_at(&mut self, pos: (usize, usize)) -> Result<Arc<Statement>, IteratorError> {
        let page = self.load_page(pos.0)?;
        Ok(Arc::clone(&page[pos.1]))
    }

    fn page_len(&self, page_no: usize) -> usize {
        self.run.pages()[page_no].count as usize
    }

    fn global_next(&self, pos: (usize, usize)) -> Option<(usize, usize)> {
        let (page, idx) = pos;
        if idx + 1 < self.page_len(page) {
            return Some((page, idx + 1));
        }
        if page + 1 < self.run.pages().len() {
            return Some((page + 1, 0));
        }
        None
    }

    fn global_prev(&self, pos: (usize, usize)) -> Option<(usize, usize)> {
        let (page, idx) = pos;
        if idx > 0 {
            return Some((page, idx - 1));
        }
        let prev = page.checked_sub(1)?;
        Some((prev, self.page_len(prev).checked_sub(1)?))
    }

    fn last_pos(&self) -> Option<(usize, usize)> {
        let pages = self.run.pages();
        let last = pages.len().checked_sub(1)?;
        Some((last, (pages[last].count as usize).checked_sub(1)?))
    }

    /// First position at or after `key` (forward) / at or before it
    /// (reverse); `None` when the run holds nothing on that side.
    fn seek(&mut self) -> Result<Option<(usize, usize)>, IteratorError> {
        if self.run.pages().is_empty() {
            return Ok(None);
        }
        if self.key.is_empty() {
            return Ok(if self.itype.is_forward() {
                Some((0, 0))
            } else {
                self.last_pos()
            });
        }

        let candidate = self.run.search_page(&self.key, &self.key_def)?;
        if self.itype.is_forward() {
            let page_no = candidate.unwrap_or(0);
            let page = self.load_page(page_no)?;
            // First entry with key ≥ the search key.
            let mut lo = 0usize;
            let mut hi = page.len();
            while lo < hi {
                let mid = (lo + hi) / 2;
                match Statement::compare_with_key(&page[mid], &self.key, &self.key_def)? {
                    std::cmp::Ordering::Less => lo = mid + 1,
                    _ => hi = mid,
                }
            }
            if lo < page.len() {
                Ok(Some((page_no, lo)))
            } else if page_no + 1 < self.run.pages().len() {
                Ok(Some((page_no + 1, 0)))
            } else {
                Ok(None)
            }
        } else {
            let Some(page_no) = candidate else {
                // Every key in the run is greater than the search key.
                return Ok(None);
            };
            let page = self.load_page(page_no)?;
            // Last entry with key ≤ the search key.
            let mut lo = 0usize;
            let mut hi = page.len();
            while lo < hi {
                let mid = (lo + hi) / 2;
                match Statement::compare_with_key(&page[mid], &self.key, &self.key_def)? {
                    std::cmp::Ordering::Greater => hi = mid,
                    _ => lo = mid + 1,
                }
            }
            match lo.checked_sub(1) {
                Some(idx) => Ok(Some((page_no, idx))),
                None => {
                    // The whole page is past the key; the previous page
                    // (if any) ends below it.
                    match page_no.checked_sub(1) {
                        Some(prev) => {
                            Ok(Some((prev, self.page_len(prev) - 1)))
                        }
                        None => Ok(None),
                    }
                }
            }
        }
    }

    fn key_of(&mut self, pos: (usize, usize)) -> Result<Vec<u8>, IteratorError> {
        let stmt = self.stmt_at(pos)?;
        Ok(stmt.extract_key(&self.key_def)?)
    }

    /// Moves `pos` to the first version (group start) of the key at
    /// `pos`. Needed in reverse iteration, which enters groups from the
    /// oldest version.
    fn rewind_to_group_start(
        &mut self,
        mut pos: (usize, usize),
        key: &[u8],
    ) -> Result<(usize, usize), IteratorError> {
        while let Some(prev) = self.global_prev(pos) {
            let prev_key = self.key_of(prev)?;
            if self.key_def.compare_keys(&prev_key, key)? != std::cmp::Ordering::Equal {
                break;
            }
            pos = prev;
        }
        Ok(pos)
    }

    fn matches(&self, key: &[u8]) -> Result<bool, IteratorError> {
        if self.key.is_empty() {
            return Ok(true);
        }
        let cmp = self.key_def.compare_keys(key, &self.key)?;
        Ok(match self.itype {
            IteratorType::Eq | IteratorType::Req => cmp == std::cmp::Ordering::Equal,
            IteratorType::Gt => cmp == std::cmp::Ordering::Greater,
            IteratorType::Lt => cmp == std::cmp::Ordering::Less,
            _ => true,
        })
    }
}

impl StmtIterator for RunIterator {
    fn next_key(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        if self.closed || self.eof {
            return Ok(None);
        }
        let forward = self.itype.is_forward();

        loop {
            // Step to the next candidate group entry.
            let candidate = match self.pos {
                None => self.seek()?,
                Some(pos) => {
                    // Skip the remaining versions of the current group.
                    let cur_key = self.cur_key.clone().unwrap_or_default();
                    let mut next = if forward {
                        self.global_next(pos)
                    } else {
                        self.global_prev(pos)
                    };
                    while let Some(p) = next {
                        let k = self.key_of(p)?;
                        if self.key_def.compare_keys(&k, &cur_key)?
                            != std::cmp::Ordering::Equal
                        {
                            break;
                        }
                        next = if forward {
                            self.global_next(p)
                        } else {
                            self.global_prev(p)
                        };
                    }
                    next
                }
            };
            let Some(mut pos) = candidate else {
                self.eof = true;
                return Ok(None);
            };

            let mut key = self.key_of(pos)?;
            if !forward {
                // Entered the group at its oldest version.
                pos = self.rewind_to_group_start(pos, &key)?;
                key = self.key_of(pos)?;
            }

            if !self.matches(&key)? {
                if self.itype.is_exact() {
                    self.eof = true;
                    return Ok(None);
                }
                self.pos = Some(pos);
                self.cur_key = Some(key);
                continue;
            }

            // Walk down the version chain to the first visible LSN.
            let mut visible = None;
            let mut vpos = pos;
            loop {
                let stmt = self.stmt_at(vpos)?;
                if stmt.lsn() <= self.vlsn {
                    visible = Some((vpos, stmt));
                    break;
                }
                let Some(next) = self.global_next(vpos) else {
                    break;
                };
                let next_key = self.key_of(next)?;
                if self.key_def.compare_keys(&next_key, &key)? != std::cmp::Ordering::Equal {
                    break;
                }
                vpos = next;
            }

            match visible {
                Some((vpos, stmt)) => {
                    self.pos = Some(vpos);
                    self.cur_key = Some(key);
                    return Ok(Some(stmt));
                }
                None => {
                    // No visible version; move past the whole group.
                    self.pos = Some(if forward { vpos } else { pos });
                    self.cur_key = Some(key);
                }
            }
        }
    }

    fn next_lsn(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        if self.closed || self.eof {
            return Ok(None);
        }
        let (Some(pos), Some(cur_key)) = (self.pos, self.cur_key.clone()) else {
            return Ok(None);
        };
        let Some(next) = self.global_next(pos) else {
            return Ok(None);
        };
        let key = self.key_of(next)?;
        if self.key_def.compare_keys(&key, &cur_key)? != std::cmp::Ordering::Equal {
            return Ok(None);
        }
        self.pos = Some(next);
        self.stmt_at(next).map(Some)
    }

    fn restore(&mut self, _last: Option<&Statement>) -> Result<RestoreResult, IteratorError> {
        // Runs are immutable after publication.
        Ok(RestoreResult::Unchanged)
    }

    fn close(&mut self) {
        self.closed = true;
        self.cache.clear();
    }
}
