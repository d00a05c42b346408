//! Iterator over one in-memory statement tree.

use std::sync::Arc;

use crate::keydef::KeyDef;
use crate::mem::VyMem;
use crate::stmt::Statement;

use super::{IteratorError, IteratorType, RestoreResult, StmtIterator};

/// All versions of one key, newest first.
struct KeyGroup {
    key: Vec<u8>,
    versions: Vec<Arc<Statement>>,
}

/// Iterator over a [`VyMem`] snapshot.
///
/// The tree is snapshotted at creation (and again on
/// [`StmtIterator::restore`] when the mem's version moved); iteration
/// itself never touches the live tree, so concurrent inserts cannot
/// invalidate a position.
pub struct MemIterator {
    mem: Arc<VyMem>,
    key_def: Arc<KeyDef>,
    itype: IteratorType,
    key: Vec<u8>,
    vlsn: i64,
    groups: Vec<KeyGroup>,
    /// Current group; `None` before the first [`StmtIterator::next_key`].
    group: Option<usize>,
    /// Current version within the group.
    version_at: usize,
    mem_version: u32,
    eof: bool,
    closed: bool,
}

impl MemIterator {
    /// Creates an iterator of the given type over `mem`.
    pub fn new(
        mem: Arc<VyMem>,
        itype: IteratorType,
        key: &[u8],
        vlsn: i64,
    ) -> Result<MemIterator, IteratorError> {
        let key_def = Arc::clone(mem.key_def());
        let mut iter = MemIterator {
            mem,
            key_def,
            itype,
            key: key.to_vec(),
            vlsn,
            groups: Vec::new(),
            group: None,
            version_at: 0,
            mem_version: 0,
            eof: false,
            closed: false,
        };
        iter.rebuild()?;
        Ok(iter)
    }

    /// Snapshots the relevant part of the tree into key groups.
    fn rebuild(&mut self) -> Result<(), IteratorError> {
        self.mem_version = self.mem.version();
        let stmts = if self.itype.is_forward() {
            self.mem.collect_from(&self.key)?
        } else {
            self.mem.collect_to(&self.key)?
        };

        let mut groups: Vec<KeyGroup> = Vec::new();
        for stmt in stmts {
            let key = stmt.extract_key(&self.key_def)?;
            match groups.last_mut() {
                Some(group)
                    if self.key_def.compare_keys(&group.key, &key)?
                        == std::cmp::Ordering::Equal =>
                {
                    group.versions.push(stmt);
                }
                _ => groups.push(KeyGroup {
                    key,
                    versions: vec![stmt],
                }),
            }
        }
        self.groups = groups;
        self.group = None;
        self.version_at = 0;
        self.eof = false;
        Ok(())
    }

    /// Whether group `at` matches the iterator type against the search
    /// key.
    fn group_matches(&self, at: usize) -> Result<bool, IteratorError> {
        if self.key.is_empty() {
            return Ok(true);
        }
        let cmp = self.key_def.compare_keys(&self.groups[at].key, &self.key)?;
        Ok(match self.itype {
            IteratorType::Eq | IteratorType::Req => cmp == std::cmp::Ordering::Equal,
            IteratorType::Gt => cmp == std::cmp::Ordering::Greater,
            IteratorType::Lt => cmp == std::cmp::Ordering::Less,
            _ => true,
        })
    }

    /// First visible version (lsn ≤ vlsn) of group `at`.
    fn visible_version(&self, at: usize) -> Option<usize> {
        self.groups[at]
            .versions
            .iter()
            .position(|s| s.lsn() <= self.vlsn)
    }

    /// Advances `group` to the next candidate in iteration order.
    fn advance_group(&mut self) -> Option<usize> {
        let next = match (self.group, self.itype.is_forward()) {
            (None, true) => 0,
            (Some(g), true) => g + 1,
            (None, false) => self.groups.len().checked_sub(1)?,
            (Some(g), false) => g.checked_sub(1)?,
        };
        if next < self.groups.len() { Some(next) } else { None }
    }

    /// Positions after `last` for restore: the next `next_key` call
    /// must return the first key strictly past it.
    fn seek_past(&mut self, last: &Statement) -> Result<(), IteratorError> {
        let last_key = last.extract_key(&self.key_def)?;
        let forward = self.itype.is_forward();
        let mut positioned = None;
        for (at, group) in self.groups.iter().enumerate() {
            let cmp = self.key_def.compare_keys(&group.key, &last_key)?;
            if forward {
                if cmp != std::cmp::Ordering::Greater {
                    positioned = Some(at);
                }
            } else if cmp != std::cmp::Ordering::Less && positioned.is_none() {
                positioned = Some(at);
            }
        }
        self.group = positioned;
        self.version_at = 0;
        self.eof = false;
        Ok(())
    }
}

impl StmtIterator for MemIterator {
    fn next_key(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        if self.closed || self.eof {
            return Ok(None);
        }
        loop {
            let Some(at) = self.advance_group() else {
                self.eof = true;
                return Ok(None);
            };
            self.group = Some(at);
            if !self.group_matches(at)? {
                if self.itype.is_exact() {
                    self.eof = true;
                    return Ok(None);
                }
                continue;
            }
            if let Some(v) = self.visible_version(at) {
                self.version_at = v;
                return Ok(Some(Arc::clone(&self.groups[at].versions[v])));
            }
        }
    }

    fn next_lsn(&mut self) -> Result<Option<Arc<Statement>>, IteratorError> {
        if self.closed {
            return Ok(None);
        }
        let Some(at) = self.group else {
            return Ok(None);
        };
        if at >= self.groups.len() {
            return Ok(None);
        }
        let next = self.version_at + 1;
        if next >= self.groups[at].versions.len() {
            return Ok(None);
        }
        self.version_at = next;
        Ok(Some(Arc::clone(&self.groups[at].versions[next])))
    }

    fn restore(&mut self, last: Option<&Statement>) -> Result<RestoreResult, IteratorError> {
        if self.closed || self.mem.version() == self.mem_version {
            return Ok(RestoreResult::Unchanged);
        }
        self.rebuild()?;
        if let Some(last) = last {
            self.seek_past(last)?;
        }
        Ok(RestoreResult::Changed)
    }

    fn close(&mut self) {
        self.closed = true;
        self.groups = Vec::new();
    }
}
