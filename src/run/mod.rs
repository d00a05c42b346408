//! Runs — immutable on-disk sorted statement files.
//!
//! A run is the output of a dump or compaction: statements sorted by
//! `(key ASC, lsn DESC)`, split into pages. On disk a run is two files:
//!
//! - `<lsn>.<range>.<run>.run` — xlog meta (`RUN`) followed by one
//!   xlog transaction per page. A page's payload holds the encoded
//!   statement rows and ends with a row-index row giving intra-page
//!   row offsets.
//! - `<lsn>.<range>.<run>.index` — xlog meta (`INDEX`) followed by one
//!   run-info row and one page-info row per page. This file is small
//!   and read eagerly at open; the data file is memory-mapped and
//!   pages are decoded on demand.
//!
//! Runs are immutable after publication; readers hold an `Arc<Run>`
//! for the duration of any I/O so compaction can unlink files without
//! racing in-flight reads.


use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::keydef::{KeyDef, KeyDefError};
use crate::msgpack::{self, MsgpackError};
use crate::stmt::{Statement, StmtType};
use crate::vclock::Vclock;
use crate::xlog::{
    self, FileType, Row, RowType, SyncMode, XlogCursor, XlogError, XlogMeta, XlogWriter,
    PAGE_INFO_SPACE_ID, ROW_INDEX_SPACE_ID, RUN_INFO_SPACE_ID,
};

// Map keys of the run-info row body.
const RUN_MIN_LSN: u64 = 1;
const RUN_MAX_LSN: u64 = 2;
const RUN_PAGE_COUNT: u64 = 3;
const RUN_BEGIN_KEY: u64 = 4;
const RUN_END_KEY: u64 = 5;

// Map keys of the page-info row body.
const PAGE_COUNT: u64 = 1;
const PAGE_MIN_KEY: u64 = 2;
const PAGE_DATA_SIZE: u64 = 3;
const PAGE_ROW_INDEX_OFFSET: u64 = 4;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by run reading and writing.
#[derive(Debug, Error)]
pub enum RunError {
    /// Underlying xlog framing error.
    #[error("xlog error: {0}")]
    Xlog(#[from] XlogError),

    /// MessagePack decoding failure.
    #[error("msgpack error: {0}")]
    Msgpack(#[from] MsgpackError),

    /// Key extraction failure.
    #[error("key def error: {0}")]
    KeyDef(#[from] KeyDefError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The index file references a different run id.
    #[error("run id mismatch: index file says {found}, expected {expected}")]
    RunIdMismatch {
        /// Id the caller expected.
        expected: u32,
        /// Id stored in the index file.
        found: u32,
    },

    /// The index file is structurally broken.
    #[error("malformed run index: {0}")]
    MalformedIndex(String),

    /// A row inside a page could not be turned into a statement.
    #[error("malformed page row: {0}")]
    MalformedRow(String),
}

// ------------------------------------------------------------------------------------------------
// Info structures
// ------------------------------------------------------------------------------------------------

/// Placement and statistics of one page.
#[derive(Debug, Clone)]
pub struct PageInfo {
    /// File offset of the page's fixheader.
    pub offset: u64,
    /// Stored (compressed) payload size.
    pub size: u32,
    /// Payload size before compression.
    pub unpacked_size: u32,
    /// Statements in the page.
    pub count: u32,
    /// Offset of the row-index row within the uncompressed payload.
    pub row_index_offset: u32,
    /// Key of the first statement (MessagePack array).
    pub min_key: Vec<u8>,
}

/// Run-level statistics and bounds.
#[derive(Debug, Clone, Default)]
pub struct RunInfo {
    /// Lowest LSN in the run.
    pub min_lsn: i64,
    /// Highest LSN in the run.
    pub max_lsn: i64,
    /// Number of pages.
    pub page_count: u32,
    /// Total statements.
    pub count: u64,
    /// Total stored bytes across pages.
    pub total_size: u64,
    /// Range begin bound at write time (`None` = −∞).
    pub begin: Option<Vec<u8>>,
    /// Range end bound at write time (`None` = +∞).
    pub end: Option<Vec<u8>>,
}

// ------------------------------------------------------------------------------------------------
// Statement ⇄ row conversion
// ------------------------------------------------------------------------------------------------

/// Encodes a statement as a row for a run page or the WAL.
pub fn stmt_to_row(stmt: &Statement, space_id: u32, index_id: u32) -> Row {
    let mut row = match stmt.stmt_type() {
        StmtType::Replace | StmtType::Select => Row::new(RowType::Replace),
        StmtType::Delete => Row::new(RowType::Delete),
        StmtType::Upsert => Row::new(RowType::Upsert),
    };
    row.lsn = stmt.lsn();
    row.space_id = Some(space_id);
    row.index_id = Some(index_id);
    match stmt.stmt_type() {
        StmtType::Delete | StmtType::Select => row.key = Some(stmt.data().to_vec()),
        _ => row.tuple = Some(stmt.data().to_vec()),
    }
    if let Some(ops) = stmt.ops() {
        row.ops = Some(ops.to_vec());
        row.index_base = Some(1);
    }
    row
}

/// Decodes a row back into a statement.
pub fn stmt_from_row(row: &Row) -> Result<Arc<Statement>, RunError> {
    let stmt = match row.row_type {
        RowType::Insert | RowType::Replace => {
            let tuple = row
                .tuple
                .as_ref()
                .ok_or_else(|| RunError::MalformedRow("REPLACE without tuple".into()))?;
            Statement::new_replace(tuple)
        }
        RowType::Delete => {
            let key = row
                .key
                .as_ref()
                .ok_or_else(|| RunError::MalformedRow("DELETE without key".into()))?;
            Statement::new_delete(key)
        }
        RowType::Upsert => {
            let tuple = row
                .tuple
                .as_ref()
                .ok_or_else(|| RunError::MalformedRow("UPSERT without tuple".into()))?;
            let ops = row
                .ops
                .as_ref()
                .ok_or_else(|| RunError::MalformedRow("UPSERT without ops".into()))?;
            Statement::new_upsert(tuple, ops)
        }
        other => {
            return Err(RunError::MalformedRow(format!(
                "row type {other:?} is not a statement"
            )));
        }
    };
    stmt.set_lsn(row.lsn);
    Ok(stmt)
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Streams sorted statements into a new run.
pub struct RunWriter {
    data: XlogWriter,
    data_path: PathBuf,
    index_path: PathBuf,
    run_id: u32,
    space_id: u32,
    index_id: u32,
    key_def: Arc<KeyDef>,
    page_size: u32,
    instance_uuid: Uuid,
    pages: Vec<PageInfo>,
    info: RunInfo,
    /// Min key of the page being built.
    page_min_key: Option<Vec<u8>>,
}

impl RunWriter {
    /// Creates the `.run`/`.index` pair (in-progress) for a new run.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dir: &Path,
        max_lsn_hint: i64,
        range_id: u32,
        run_id: u32,
        space_id: u32,
        index_id: u32,
        key_def: Arc<KeyDef>,
        page_size: u32,
        instance_uuid: Uuid,
    ) -> Result<RunWriter, RunError> {
        let data_path = xlog::run_filename(dir, max_lsn_hint, range_id, run_id, false);
        let index_path = xlog::run_filename(dir, max_lsn_hint, range_id, run_id, true);
        let meta = XlogMeta {
            filetype: FileType::Run,
            instance_uuid,
            vclock: Vclock::new(),
        };
        let data = XlogWriter::create(&data_path, &meta, SyncMode::Write, true)?;
        Ok(RunWriter {
            data,
            data_path,
            index_path,
            run_id,
            space_id,
            index_id,
            key_def,
            page_size,
            instance_uuid,
            pages: Vec::new(),
            info: RunInfo {
                min_lsn: i64::MAX,
                ..RunInfo::default()
            },
            page_min_key: None,
        })
    }

    /// Appends a statement. Statements must arrive in `(key ASC, lsn
    /// DESC)` order; the writer records bounds and page placement but
    /// does not re-sort.
    pub fn write(&mut self, stmt: &Statement) -> Result<(), RunError> {
        if self.page_min_key.is_none() {
            self.page_min_key = Some(
                stmt.extract_key(&self.key_def)
                    .map_err(|e| RunError::MalformedRow(e.to_string()))?,
            );
        }
        let row = stmt_to_row(stmt, self.space_id, self.index_id);
        self.data.write_row(&row);

        self.info.count += 1;
        self.info.min_lsn = self.info.min_lsn.min(stmt.lsn());
        self.info.max_lsn = self.info.max_lsn.max(stmt.lsn());

        if self.data.tx_buffered() >= self.page_size as usize {
            self.flush_page()?;
        }
        Ok(())
    }

    fn flush_page(&mut self) -> Result<(), RunError> {
        let Some(min_key) = self.page_min_key.take() else {
            return Ok(());
        };
        let Some(tx) = self.data.flush_tx()? else {
            return Ok(());
        };
        self.pages.push(PageInfo {
            offset: tx.offset,
            size: tx.stored_size,
            unpacked_size: tx.unpacked_size,
            count: tx.row_count,
            row_index_offset: tx.row_index_offset,
            min_key,
        });
        self.info.total_size += tx.stored_size as u64;
        Ok(())
    }

    /// Finishes the run: flushes the trailing page, writes the index
    /// file, publishes both files, and opens the result for reading.
    pub fn finish(
        mut self,
        begin: Option<Vec<u8>>,
        end: Option<Vec<u8>>,
    ) -> Result<Arc<Run>, RunError> {
        self.flush_page()?;
        self.info.page_count = self.pages.len() as u32;
        self.info.begin = begin;
        self.info.end = end;
        if self.info.count == 0 {
            self.info.min_lsn = 0;
        }

        let data_path = self.data_path.clone();
        self.data.close()?;

        // Index file: one transaction holding run-info + page-infos.
        let meta = XlogMeta {
            filetype: FileType::Index,
            instance_uuid: self.instance_uuid,
            vclock: Vclock::new(),
        };
        let mut index = XlogWriter::create(&self.index_path, &meta, SyncMode::Write, false)?;
        index.write_row(&encode_run_info(self.run_id, &self.info));
        for page in &self.pages {
            index.write_row(&encode_page_info(self.run_id, page));
        }
        index.flush_tx()?;
        index.close()?;

        info!(
            run_id = self.run_id,
            pages = self.pages.len(),
            stmts = self.info.count,
            bytes = self.info.total_size,
            path = %data_path.display(),
            "run written"
        );

        Run::from_parts(
            self.run_id,
            self.info,
            self.pages,
            data_path,
            self.index_path,
        )
    }

    /// Abandons the run, removing in-progress artifacts.
    pub fn discard(self) -> Result<(), RunError> {
        self.data.discard()?;
        Ok(())
    }
}

fn encode_run_info(run_id: u32, info: &RunInfo) -> Row {
    let mut body = Vec::new();
    let mut pairs = 3;
    if info.begin.is_some() {
        pairs += 1;
    }
    if info.end.is_some() {
        pairs += 1;
    }
    msgpack::write_map_len(&mut body, pairs);
    msgpack::write_uint(&mut body, RUN_MIN_LSN);
    msgpack::write_int(&mut body, info.min_lsn);
    msgpack::write_uint(&mut body, RUN_MAX_LSN);
    msgpack::write_int(&mut body, info.max_lsn);
    msgpack::write_uint(&mut body, RUN_PAGE_COUNT);
    msgpack::write_uint(&mut body, info.page_count as u64);
    if let Some(begin) = &info.begin {
        msgpack::write_uint(&mut body, RUN_BEGIN_KEY);
        body.extend_from_slice(begin);
    }
    if let Some(end) = &info.end {
        msgpack::write_uint(&mut body, RUN_END_KEY);
        body.extend_from_slice(end);
    }

    let mut tuple = Vec::new();
    msgpack::write_array_len(&mut tuple, 2);
    msgpack::write_uint(&mut tuple, run_id as u64);
    tuple.extend_from_slice(&body);

    let mut row = Row::new(RowType::Insert);
    row.space_id = Some(RUN_INFO_SPACE_ID);
    row.tuple = Some(tuple);
    row
}

fn encode_page_info(run_id: u32, page: &PageInfo) -> Row {
    let mut body = Vec::new();
    msgpack::write_map_len(&mut body, 4);
    msgpack::write_uint(&mut body, PAGE_COUNT);
    msgpack::write_uint(&mut body, page.count as u64);
    msgpack::write_uint(&mut body, PAGE_MIN_KEY);
    body.extend_from_slice(&page.min_key);
    msgpack::write_uint(&mut body, PAGE_DATA_SIZE);
    msgpack::write_uint(&mut body, page.unpacked_size as u64);
    msgpack::write_uint(&mut body, PAGE_ROW_INDEX_OFFSET);
    msgpack::write_uint(&mut body, page.row_index_offset as u64);

    let mut tuple = Vec::new();
    msgpack::write_array_len(&mut tuple, 4);
    msgpack::write_uint(&mut tuple, run_id as u64);
    msgpack::write_uint(&mut tuple, page.offset);
    msgpack::write_uint(&mut tuple, page.size as u64);
    tuple.extend_from_slice(&body);

    let mut row = Row::new(RowType::Insert);
    row.space_id = Some(PAGE_INFO_SPACE_ID);
    row.tuple = Some(tuple);
    row
}

// ------------------------------------------------------------------------------------------------
// Run (reader)
// ------------------------------------------------------------------------------------------------

/// An opened, immutable run.
pub struct Run {
    /// Run id, unique within its index.
    pub id: u32,
    info: RunInfo,
    pages: Vec<PageInfo>,
    data_path: PathBuf,
    index_path: PathBuf,
    mmap: Mmap,
}

impl Run {
    fn from_parts(
        id: u32,
        info: RunInfo,
        pages: Vec<PageInfo>,
        data_path: PathBuf,
        index_path: PathBuf,
    ) -> Result<Arc<Run>, RunError> {
        let file = File::open(&data_path)?;
        // SAFETY of the mapping relies on run files being immutable
        // once published; writers never touch a published file.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Arc::new(Run {
            id,
            info,
            pages,
            data_path,
            index_path,
            mmap,
        }))
    }

    /// Opens a run from its index file (and the sibling data file).
    pub fn open(index_path: &Path, expected_run_id: Option<u32>) -> Result<Arc<Run>, RunError> {
        let mut cursor = XlogCursor::open_expect(index_path, FileType::Index)?;
        let mut run_id: Option<u32> = None;
        let mut info = RunInfo::default();
        let mut pages = Vec::new();

        while cursor.next_tx()? {
            while let Some(row) = cursor.next_row()? {
                match row.space_id {
                    Some(RUN_INFO_SPACE_ID) => {
                        let (id, parsed) = decode_run_info(&row)?;
                        run_id = Some(id);
                        info = parsed;
                    }
                    Some(PAGE_INFO_SPACE_ID) => {
                        let (id, page) = decode_page_info(&row)?;
                        if run_id.is_some_and(|r| r != id) {
                            return Err(RunError::MalformedIndex(
                                "page info references a foreign run".into(),
                            ));
                        }
                        pages.push(page);
                    }
                    Some(ROW_INDEX_SPACE_ID) | None => {}
                    Some(other) => {
                        warn!(space_id = other, "unexpected row in run index file");
                    }
                }
            }
        }

        let run_id =
            run_id.ok_or_else(|| RunError::MalformedIndex("missing run-info row".into()))?;
        if let Some(expected) = expected_run_id
            && run_id != expected
        {
            return Err(RunError::RunIdMismatch {
                expected,
                found: run_id,
            });
        }
        if pages.len() != info.page_count as usize {
            return Err(RunError::MalformedIndex(format!(
                "page count mismatch: info says {}, found {}",
                info.page_count,
                pages.len()
            )));
        }

        // Recompute statement count from pages: the run-info row does
        // not carry it.
        info.count = pages.iter().map(|p| p.count as u64).sum();
        info.total_size = pages.iter().map(|p| p.size as u64).sum();

        let data_path = sibling_data_path(index_path);
        debug!(run_id, pages = pages.len(), path = %data_path.display(), "run opened");
        Run::from_parts(run_id, info, pages, data_path, index_path.to_path_buf())
    }

    /// Run-level statistics.
    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    /// Page placements, in key order.
    pub fn pages(&self) -> &[PageInfo] {
        &self.pages
    }

    /// Decodes all statements of one page, in `(key ASC, lsn DESC)`
    /// order.
    pub fn read_page(&self, page_no: usize) -> Result<Vec<Arc<Statement>>, RunError> {
        let page = self
            .pages
            .get(page_no)
            .ok_or_else(|| RunError::MalformedIndex(format!("no page {page_no}")))?;
        let (rows, _) = xlog::decode_tx_block(&self.mmap[page.offset as usize..])?;

        let mut stmts = Vec::with_capacity(page.count as usize);
        let mut pos = 0;
        while pos < rows.len() {
            let (row, n) = Row::decode(&rows[pos..])?;
            pos += n;
            if row.space_id == Some(ROW_INDEX_SPACE_ID) {
                continue;
            }
            stmts.push(stmt_from_row(&row)?);
        }
        Ok(stmts)
    }

    /// Largest page index whose `min_key ≤ key`, or `None` when `key`
    /// precedes the first page. Probe point for forward iteration.
    pub fn search_page(&self, key: &[u8], key_def: &KeyDef) -> Result<Option<usize>, RunError> {
        let mut lo = 0usize;
        let mut hi = self.pages.len();
        while lo < hi {
            let mid = (lo + hi) / 2;
            match key_def.compare_keys(&self.pages[mid].min_key, key)? {
                std::cmp::Ordering::Greater => hi = mid,
                _ => lo = mid + 1,
            }
        }
        Ok(lo.checked_sub(1))
    }

    /// Paths of the backing files.
    pub fn paths(&self) -> (&Path, &Path) {
        (&self.data_path, &self.index_path)
    }

    /// Unlinks the backing files. Readers holding this `Arc<Run>` keep
    /// working off the open mapping.
    pub fn unlink(&self) -> Result<(), RunError> {
        info!(run_id = self.id, path = %self.data_path.display(), "unlinking run files");
        std::fs::remove_file(&self.data_path)?;
        std::fs::remove_file(&self.index_path)?;
        Ok(())
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Run")
            .field("id", &self.id)
            .field("pages", &self.pages.len())
            .field("count", &self.info.count)
            .field("min_lsn", &self.info.min_lsn)
            .field("max_lsn", &self.info.max_lsn)
            .finish()
    }
}

fn sibling_data_path(index_path: &Path) -> PathBuf {
    index_path.with_extension("run")
}

fn decode_run_info(row: &Row) -> Result<(u32, RunInfo), RunError> {
    let tuple = row
        .tuple
        .as_ref()
        .ok_or_else(|| RunError::MalformedIndex("run-info row without tuple".into()))?;
    let (_, mut pos) = msgpack::read_array_len(tuple)?;
    let (run_id, n) = msgpack::read_uint(&tuple[pos..])?;
    pos += n;

    let mut info = RunInfo::default();
    let (pairs, n) = msgpack::read_map_len(&tuple[pos..])?;
    pos += n;
    for _ in 0..pairs {
        let (key, n) = msgpack::read_uint(&tuple[pos..])?;
        pos += n;
        let value_len = msgpack::skip_value(&tuple[pos..])?;
        let value = &tuple[pos..pos + value_len];
        pos += value_len;
        match key {
            RUN_MIN_LSN => info.min_lsn = msgpack::read_int(value)?.0,
            RUN_MAX_LSN => info.max_lsn = msgpack::read_int(value)?.0,
            RUN_PAGE_COUNT => info.page_count = msgpack::read_uint(value)?.0 as u32,
            RUN_BEGIN_KEY => info.begin = Some(value.to_vec()),
            RUN_END_KEY => info.end = Some(value.to_vec()),
            _ => {}
        }
    }
    Ok((run_id as u32, info))
}

fn decode_page_info(row: &Row) -> Result<(u32, PageInfo), RunError> {
    let tuple = row
        .tuple
        .as_ref()
        .ok_or_else(|| RunError::MalformedIndex("page-info row without tuple".into()))?;
    let (_, mut pos) = msgpack::read_array_len(tuple)?;
    let (run_id, n) = msgpack::read_uint(&tuple[pos..])?;
    pos += n;
    let (offset, n) = msgpack::read_uint(&tuple[pos..])?;
    pos += n;
    let (size, n) = msgpack::read_uint(&tuple[pos..])?;
    pos += n;

    let mut page = PageInfo {
        offset,
        size: size as u32,
        unpacked_size: 0,
        count: 0,
        row_index_offset: 0,
        min_key: Vec::new(),
    };
    let (pairs, n) = msgpack::read_map_len(&tuple[pos..])?;
    pos += n;
    for _ in 0..pairs {
        let (key, n) = msgpack::read_uint(&tuple[pos..])?;
        pos += n;
        let value_len = msgpack::skip_value(&tuple[pos..])?;
        let value = &tuple[pos..pos + value_len];
        pos += value_len;
        match key {
            PAGE_COUNT => page.count = msgpack::read_uint(value)?.0 as u32,
            PAGE_MIN_KEY => page.min_key = value.to_vec(),
            PAGE_DATA_SIZE => page.unpacked_size = msgpack::read_uint(value)?.0 as u32,
            PAGE_ROW_INDEX_OFFSET => {
                page.row_index_offset = msgpack::read_uint(value)?.0 as u32
            }
            _ => {}
        }
    }
    if page.min_key.is_empty() {
        return Err(RunError::MalformedIndex("page-info without min key".into()));
    }
    Ok((run_id as u32, page))
}
