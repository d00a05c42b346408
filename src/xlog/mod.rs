//! Xlog — append-only row-group files.
//!
//! One file format backs the write-ahead log (`.xlog`), snapshots
//! (`.snap`), and the LSM run/index files (`.run`/`.index`). A file is:
//!
//! ```text
//! <filetype>\n            ── text meta block
//! <format version>\n
//! Server: <uuid>\n
//! VClock: {1: 42}\n
//! \n
//! [fixheader][payload]    ── transaction 0
//! [fixheader][payload]    ── transaction 1
//! ...
//! ```
//!
//! Each transaction's fixheader is `magic(4) | crc32(4) | len(4) |
//! flags(1)`, all little-endian, with the CRC computed over the stored
//! payload. The payload is a sequence of encoded rows followed by one
//! row-index row listing the byte offset of every row in the block;
//! with the zstd flag set the whole sequence is compressed as one
//! block.
//!
//! Rows are MessagePack maps keyed by small integers ([`rowkey`]).
//!
//! Files are written under a `.inprogress` suffix and renamed into
//! place on close; readers ignore in-progress files. WAL and snapshot
//! files are named by the zero-padded decimal sum of their opening
//! vclock; run files use the hex pattern
//! `<lsn>.<range_id>.<run_id>.{run,index}`.
//!
//! [`XlogCursor`] replays a file transaction by transaction. On a
//! corrupt transaction the caller chooses between failing hard and
//! scanning forward to the next valid magic
//! ([`XlogCursor::skip_to_next_tx`]).

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::msgpack::{self, MpValue, MsgpackError};
use crate::vclock::Vclock;

/// Magic opening every xlog transaction fixheader.
pub const TX_MAGIC: u32 = 0xBA0B_ABED;

/// Fixheader size: magic + crc + len + flags.
pub const FIXHEADER_SIZE: usize = 4 + 4 + 4 + 1;

/// Flag bit: payload is one zstd block.
pub const FLAG_ZSTD: u8 = 0x01;

/// Format version recorded in the meta block.
pub const META_VERSION: &str = "0.13";

/// Suffix of files still being written.
pub const INPROGRESS_SUFFIX: &str = ".inprogress";

/// System space id of the per-transaction row-index row.
pub const ROW_INDEX_SPACE_ID: u32 = 0xFFFF_0001;

/// System space id of run-info rows in `.index` files.
pub const RUN_INFO_SPACE_ID: u32 = 0xFFFF_0002;

/// System space id of page-info rows in `.index` files.
pub const PAGE_INFO_SPACE_ID: u32 = 0xFFFF_0003;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by xlog reading and writing.
#[derive(Debug, Error)]
pub enum XlogError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// MessagePack row decoding failure.
    #[error("msgpack error: {0}")]
    Msgpack(#[from] MsgpackError),

    /// Malformed or truncated meta block.
    #[error("invalid meta block: {0}")]
    InvalidMeta(String),

    /// The meta declares a different filetype than expected.
    #[error("filetype mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        /// Filetype the caller expected.
        expected: &'static str,
        /// Filetype the meta declares.
        found: String,
    },

    /// No transaction magic at the cursor position.
    #[error("bad transaction magic at offset {0}")]
    BadMagic(u64),

    /// Transaction payload failed its CRC check.
    #[error("transaction checksum mismatch at offset {0}")]
    ChecksumMismatch(u64),

    /// zstd compression failure.
    #[error("compression failed: {0}")]
    Compression(String),

    /// zstd decompression failure.
    #[error("decompression failed: {0}")]
    Decompression(String),

    /// Cursor method called in the wrong state.
    #[error("cursor is in state {0:?}")]
    BadState(CursorState),

    /// A row field had an unexpected type or a required field is absent.
    #[error("malformed row: {0}")]
    MalformedRow(String),
}

// ------------------------------------------------------------------------------------------------
// Row keys and types
// ------------------------------------------------------------------------------------------------

/// MessagePack map keys of an encoded row.
pub mod rowkey {
    /// Request type ([`super::RowType`]).
    pub const TYPE: u64 = 0;
    /// Client sync cookie.
    pub const SYNC: u64 = 1;
    /// Origin instance id.
    pub const SERVER_ID: u64 = 2;
    /// Log sequence number.
    pub const LSN: u64 = 3;
    /// Wall-clock timestamp, f64 seconds.
    pub const TIMESTAMP: u64 = 4;
    /// Target space id.
    pub const SPACE_ID: u64 = 16;
    /// Target index ordinal.
    pub const INDEX_ID: u64 = 17;
    /// Field-number base of update operations (0 or 1).
    pub const INDEX_BASE: u64 = 21;
    /// Key (MessagePack array).
    pub const KEY: u64 = 32;
    /// Tuple (MessagePack array).
    pub const TUPLE: u64 = 33;
    /// Update operations (MessagePack array).
    pub const OPS: u64 = 40;
    /// Vector clock (MessagePack map origin → lsn).
    pub const VCLOCK: u64 = 38;
    /// Instance UUID (string).
    pub const INSTANCE_UUID: u64 = 36;
    /// Replica-set UUID (string).
    pub const CLUSTER_UUID: u64 = 37;
}

/// Request type of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RowType {
    /// Heartbeat / acknowledgement; carries no body.
    Nop = 0,
    /// Read request (never logged).
    Select = 1,
    /// Insert (duplicate keys rejected).
    Insert = 2,
    /// Insert-or-overwrite.
    Replace = 3,
    /// Delete by key.
    Delete = 5,
    /// Merge operation with fallback tuple.
    Upsert = 7,
    /// Replication authentication.
    Auth = 50,
    /// Replication bulk-join request / stream end marker.
    Join = 65,
    /// Replication subscription request.
    Subscribe = 66,
    /// Leader vote request.
    Vote = 67,
}

impl RowType {
    /// Decodes a numeric row type.
    pub fn from_u64(v: u64) -> Option<RowType> {
        Some(match v {
            0 => RowType::Nop,
            1 => RowType::Select,
            2 => RowType::Insert,
            3 => RowType::Replace,
            5 => RowType::Delete,
            7 => RowType::Upsert,
            50 => RowType::Auth,
            65 => RowType::Join,
            66 => RowType::Subscribe,
            67 => RowType::Vote,
            _ => return None,
        })
    }
}

// ------------------------------------------------------------------------------------------------
// Row
// ------------------------------------------------------------------------------------------------

/// One logical row: the unit of WAL logging and replication.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Request type.
    pub row_type: RowType,
    /// Client sync cookie (0 when unused).
    pub sync: u64,
    /// Origin instance id.
    pub server_id: u32,
    /// Log sequence number assigned by the origin.
    pub lsn: i64,
    /// Wall-clock timestamp in seconds.
    pub timestamp: f64,
    /// Target space.
    pub space_id: Option<u32>,
    /// Target index ordinal.
    pub index_id: Option<u32>,
    /// Field-number base for `ops`.
    pub index_base: Option<u32>,
    /// Key payload.
    pub key: Option<Vec<u8>>,
    /// Tuple payload.
    pub tuple: Option<Vec<u8>>,
    /// Update-operations payload.
    pub ops: Option<Vec<u8>>,
    /// Vector clock payload (JOIN end marker, SUBSCRIBE request).
    pub vclock: Option<Vclock>,
    /// Instance identity (AUTH, greeting).
    pub instance_uuid: Option<Uuid>,
    /// Replica-set identity (greeting).
    pub cluster_uuid: Option<Uuid>,
}

impl Row {
    /// A bare row of the given type with the current wall clock.
    pub fn new(row_type: RowType) -> Row {
        Row {
            row_type,
            sync: 0,
            server_id: 0,
            lsn: 0,
            timestamp: now_seconds(),
            space_id: None,
            index_id: None,
            index_base: None,
            key: None,
            tuple: None,
            ops: None,
            vclock: None,
            instance_uuid: None,
            cluster_uuid: None,
        }
    }

    /// Encodes the row as a MessagePack map with integer keys.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        let mut count = 4; // TYPE, SERVER_ID, LSN, TIMESTAMP
        if self.sync != 0 {
            count += 1;
        }
        for present in [
            self.space_id.is_some(),
            self.index_id.is_some(),
            self.index_base.is_some(),
            self.key.is_some(),
            self.tuple.is_some(),
            self.ops.is_some(),
            self.vclock.is_some(),
            self.instance_uuid.is_some(),
            self.cluster_uuid.is_some(),
        ] {
            if present {
                count += 1;
            }
        }

        msgpack::write_map_len(buf, count);
        msgpack::write_uint(buf, rowkey::TYPE);
        msgpack::write_uint(buf, self.row_type as u8 as u64);
        if self.sync != 0 {
            msgpack::write_uint(buf, rowkey::SYNC);
            msgpack::write_uint(buf, self.sync);
        }
        msgpack::write_uint(buf, rowkey::SERVER_ID);
        msgpack::write_uint(buf, self.server_id as u64);
        msgpack::write_uint(buf, rowkey::LSN);
        msgpack::write_int(buf, self.lsn);
        msgpack::write_uint(buf, rowkey::TIMESTAMP);
        msgpack::write_double(buf, self.timestamp);
        if let Some(space_id) = self.space_id {
            msgpack::write_uint(buf, rowkey::SPACE_ID);
            msgpack::write_uint(buf, space_id as u64);
        }
        if let Some(index_id) = self.index_id {
            msgpack::write_uint(buf, rowkey::INDEX_ID);
            msgpack::write_uint(buf, index_id as u64);
        }
        if let Some(index_base) = self.index_base {
            msgpack::write_uint(buf, rowkey::INDEX_BASE);
            msgpack::write_uint(buf, index_base as u64);
        }
        if let Some(key) = &self.key {
            msgpack::write_uint(buf, rowkey::KEY);
            buf.extend_from_slice(key);
        }
        if let Some(tuple) = &self.tuple {
            msgpack::write_uint(buf, rowkey::TUPLE);
            buf.extend_from_slice(tuple);
        }
        if let Some(ops) = &self.ops {
            msgpack::write_uint(buf, rowkey::OPS);
            buf.extend_from_slice(ops);
        }
        if let Some(vclock) = &self.vclock {
            msgpack::write_uint(buf, rowkey::VCLOCK);
            let origins: Vec<(u32, i64)> = vclock.origins().collect();
            msgpack::write_map_len(buf, origins.len() as u32);
            for (id, lsn) in origins {
                msgpack::write_uint(buf, id as u64);
                msgpack::write_int(buf, lsn);
            }
        }
        if let Some(uuid) = &self.instance_uuid {
            msgpack::write_uint(buf, rowkey::INSTANCE_UUID);
            msgpack::write_str(buf, &uuid.to_string());
        }
        if let Some(uuid) = &self.cluster_uuid {
            msgpack::write_uint(buf, rowkey::CLUSTER_UUID);
            msgpack::write_str(buf, &uuid.to_string());
        }
    }

    /// Decodes one row, returning `(row, bytes_consumed)`. Unknown keys
    /// are skipped for forward compatibility.
    pub fn decode(buf: &[u8]) -> Result<(Row, usize), XlogError> {
        let (pairs, mut pos) = msgpack::read_map_len(buf)?;
        let mut row = Row::new(RowType::Nop);
        row.timestamp = 0.0;
        for _ in 0..pairs {
            let (key, n) = msgpack::read_uint(&buf[pos..])?;
            pos += n;
            let value_start = pos;
            let value_len = msgpack::skip_value(&buf[pos..])?;
            pos += value_len;
            let value = &buf[value_start..value_start + value_len];
            match key {
                rowkey::TYPE => {
                    let (v, _) = msgpack::read_uint(value)?;
                    row.row_type = RowType::from_u64(v).ok_or_else(|| {
                        XlogError::MalformedRow(format!("unknown row type {v}"))
                    })?;
                }
                rowkey::SYNC => row.sync = msgpack::read_uint(value)?.0,
                rowkey::SERVER_ID => row.server_id = msgpack::read_uint(value)?.0 as u32,
                rowkey::LSN => row.lsn = msgpack::read_int(value)?.0,
                rowkey::TIMESTAMP => {
                    row.timestamp = match msgpack::read_value(value)?.0 {
                        MpValue::Double(v) => v,
                        MpValue::Uint(v) => v as f64,
                        other => {
                            return Err(XlogError::MalformedRow(format!(
                                "timestamp has class {:?}",
                                other.class()
                            )));
                        }
                    }
                }
                rowkey::SPACE_ID => row.space_id = Some(msgpack::read_uint(value)?.0 as u32),
                rowkey::INDEX_ID => row.index_id = Some(msgpack::read_uint(value)?.0 as u32),
                rowkey::INDEX_BASE => {
                    row.index_base = Some(msgpack::read_uint(value)?.0 as u32)
                }
                rowkey::KEY => row.key = Some(value.to_vec()),
                rowkey::TUPLE => row.tuple = Some(value.to_vec()),
                rowkey::OPS => row.ops = Some(value.to_vec()),
                rowkey::VCLOCK => {
                    let (count, mut vpos) = msgpack::read_map_len(value)?;
                    let mut clock = Vclock::new();
                    for _ in 0..count {
                        let (id, n) = msgpack::read_uint(&value[vpos..])?;
                        vpos += n;
                        let (lsn, n) = msgpack::read_int(&value[vpos..])?;
                        vpos += n;
                        clock.follow(id as u32, lsn);
                    }
                    row.vclock = Some(clock);
                }
                rowkey::INSTANCE_UUID => {
                    let (s, _) = msgpack::read_str(value)?;
                    row.instance_uuid = Some(Uuid::parse_str(s).map_err(|e| {
                        XlogError::MalformedRow(format!("bad instance uuid: {e}"))
                    })?);
                }
                rowkey::CLUSTER_UUID => {
                    let (s, _) = msgpack::read_str(value)?;
                    row.cluster_uuid = Some(Uuid::parse_str(s).map_err(|e| {
                        XlogError::MalformedRow(format!("bad cluster uuid: {e}"))
                    })?);
                }
                _ => trace!(key, "skipping unknown row key"),
            }
        }
        Ok((row, pos))
    }
}

/// Current wall clock in seconds.
pub fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ------------------------------------------------------------------------------------------------
// File meta
// ------------------------------------------------------------------------------------------------

/// Filetype declared in the meta block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Write-ahead log.
    Xlog,
    /// Engine snapshot.
    Snap,
    /// LSM run data file.
    Run,
    /// LSM run index file.
    Index,
}

impl FileType {
    /// Meta-block spelling.
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Xlog => "XLOG",
            FileType::Snap => "SNAP",
            FileType::Run => "RUN",
            FileType::Index => "INDEX",
        }
    }

    fn parse(s: &str) -> Option<FileType> {
        Some(match s {
            "XLOG" => FileType::Xlog,
            "SNAP" => FileType::Snap,
            "RUN" => FileType::Run,
            "INDEX" => FileType::Index,
            _ => return None,
        })
    }
}

/// The text meta block opening every xlog-format file.
#[derive(Debug, Clone)]
pub struct XlogMeta {
    /// Declared filetype.
    pub filetype: FileType,
    /// Identity of the writing instance.
    pub instance_uuid: Uuid,
    /// Vclock at the moment the file was opened.
    pub vclock: Vclock,
}

impl XlogMeta {
    fn encode(&self) -> String {
        format!(
            "{}\n{}\nServer: {}\nVClock: {}\n\n",
            self.filetype.as_str(),
            META_VERSION,
            self.instance_uuid,
            self.vclock.to_meta_string(),
        )
    }

    /// Parses the meta block, returning `(meta, byte_length)`.
    fn decode(buf: &[u8]) -> Result<(XlogMeta, usize), XlogError> {
        // The meta block ends at the first empty line.
        let mut end = None;
        for i in 0..buf.len().saturating_sub(1) {
            if buf[i] == b'\n' && buf[i + 1] == b'\n' {
                end = Some(i + 2);
                break;
            }
        }
        let end = end.ok_or_else(|| XlogError::InvalidMeta("unterminated meta block".into()))?;
        let text = std::str::from_utf8(&buf[..end])
            .map_err(|_| XlogError::InvalidMeta("meta block is not UTF-8".into()))?;

        let mut lines = text.lines();
        let filetype_line = lines
            .next()
            .ok_or_else(|| XlogError::InvalidMeta("missing filetype".into()))?;
        let filetype = FileType::parse(filetype_line)
            .ok_or_else(|| XlogError::InvalidMeta(format!("unknown filetype {filetype_line}")))?;
        let _version = lines
            .next()
            .ok_or_else(|| XlogError::InvalidMeta("missing version".into()))?;

        let mut instance_uuid = None;
        let mut vclock = Vclock::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Server: ") {
                instance_uuid = Some(Uuid::parse_str(value.trim()).map_err(|e| {
                    XlogError::InvalidMeta(format!("bad server uuid: {e}"))
                })?);
            } else if let Some(value) = line.strip_prefix("VClock: ") {
                vclock = Vclock::from_meta_string(value)
                    .ok_or_else(|| XlogError::InvalidMeta("bad vclock".into()))?;
            }
        }
        let instance_uuid =
            instance_uuid.ok_or_else(|| XlogError::InvalidMeta("missing server uuid".into()))?;

        Ok((
            XlogMeta {
                filetype,
                instance_uuid,
                vclock,
            },
            end,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Writer
// ------------------------------------------------------------------------------------------------

/// Durability mode of an [`XlogWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    /// Never sync; buffers may be lost on crash.
    None,
    /// Write on every transaction, sync on close.
    #[default]
    Write,
    /// fsync after every transaction.
    Fsync,
}

/// Placement of one flushed transaction within its file.
#[derive(Debug, Clone, Copy)]
pub struct TxInfo {
    /// File offset of the fixheader.
    pub offset: u64,
    /// Stored payload size (after compression).
    pub stored_size: u32,
    /// Payload size before compression.
    pub unpacked_size: u32,
    /// Offset of the row-index row within the uncompressed payload.
    pub row_index_offset: u32,
    /// Data rows in the transaction (excluding the row-index row).
    pub row_count: u32,
}

/// Appends transactions to an `.inprogress` xlog-format file and
/// atomically publishes it on close.
#[derive(Debug)]
pub struct XlogWriter {
    file: File,
    final_path: PathBuf,
    inprogress_path: PathBuf,
    sync_mode: SyncMode,
    compress: bool,
    /// Encoded rows of the open transaction.
    tx_buf: Vec<u8>,
    /// Offset of each buffered row within `tx_buf`.
    tx_offsets: Vec<u32>,
    /// Rows written over the writer's lifetime.
    row_count: u64,
    /// Bytes written to the file so far.
    written: u64,
}

impl XlogWriter {
    /// Creates `<path>.inprogress` and writes the meta block.
    pub fn create(
        path: impl AsRef<Path>,
        meta: &XlogMeta,
        sync_mode: SyncMode,
        compress: bool,
    ) -> Result<XlogWriter, XlogError> {
        let final_path = path.as_ref().to_path_buf();
        let inprogress_path = inprogress_name(&final_path);
        let mut file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&inprogress_path)?;
        let meta_bytes = meta.encode();
        file.write_all(meta_bytes.as_bytes())?;

        info!(path = %final_path.display(), filetype = meta.filetype.as_str(), "xlog created");

        Ok(XlogWriter {
            file,
            final_path,
            inprogress_path,
            sync_mode,
            compress,
            tx_buf: Vec::new(),
            tx_offsets: Vec::new(),
            row_count: 0,
            written: meta_bytes.len() as u64,
        })
    }

    /// Buffers one row into the open transaction.
    pub fn write_row(&mut self, row: &Row) {
        self.tx_offsets.push(self.tx_buf.len() as u32);
        row.encode(&mut self.tx_buf);
        self.row_count += 1;
    }

    /// Closes the open transaction: appends the row-index row, frames
    /// the block with a fixheader, and writes it out. Returns the
    /// transaction's placement, or `None` when no rows were buffered.
    pub fn flush_tx(&mut self) -> Result<Option<TxInfo>, XlogError> {
        if self.tx_offsets.is_empty() {
            return Ok(None);
        }
        let row_count = self.tx_offsets.len() as u32;
        let row_index_offset = self.tx_buf.len() as u32;

        // Row index: offsets of every row, as a bin of u32 LE.
        let mut index_tuple = Vec::with_capacity(self.tx_offsets.len() * 4 + 8);
        msgpack::write_array_len(&mut index_tuple, 1);
        let mut raw = Vec::with_capacity(self.tx_offsets.len() * 4);
        for off in &self.tx_offsets {
            raw.extend_from_slice(&off.to_le_bytes());
        }
        msgpack::write_bin(&mut index_tuple, &raw);

        let mut index_row = Row::new(RowType::Insert);
        index_row.space_id = Some(ROW_INDEX_SPACE_ID);
        index_row.tuple = Some(index_tuple);
        index_row.encode(&mut self.tx_buf);

        let unpacked_size = self.tx_buf.len() as u32;
        let payload = if self.compress {
            zstd::stream::encode_all(&self.tx_buf[..], 0)
                .map_err(|e| XlogError::Compression(e.to_string()))?
        } else {
            std::mem::take(&mut self.tx_buf)
        };

        let mut hasher = Crc32::new();
        hasher.update(&payload);
        let crc = hasher.finalize();

        let mut header = [0u8; FIXHEADER_SIZE];
        header[0..4].copy_from_slice(&TX_MAGIC.to_le_bytes());
        header[4..8].copy_from_slice(&crc.to_le_bytes());
        header[8..12].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[12] = if self.compress { FLAG_ZSTD } else { 0 };

        self.file.write_all(&header)?;
        self.file.write_all(&payload)?;
        if self.sync_mode == SyncMode::Fsync {
            self.file.sync_all()?;
        }

        let info = TxInfo {
            offset: self.written,
            stored_size: payload.len() as u32,
            unpacked_size,
            row_index_offset,
            row_count,
        };
        self.written += (FIXHEADER_SIZE + payload.len()) as u64;

        trace!(
            rows = row_count,
            bytes = payload.len(),
            compressed = self.compress,
            "xlog transaction flushed"
        );

        self.tx_buf.clear();
        self.tx_offsets.clear();
        Ok(Some(info))
    }

    /// Writes a whole transaction in one call.
    pub fn write_tx(&mut self, rows: &[Row]) -> Result<(), XlogError> {
        for row in rows {
            self.write_row(row);
        }
        self.flush_tx()?;
        Ok(())
    }

    /// Bytes written to the file so far (flushed transactions only).
    pub fn position(&self) -> u64 {
        self.written
    }

    /// Encoded bytes buffered in the open transaction.
    pub fn tx_buffered(&self) -> usize {
        self.tx_buf.len()
    }

    /// Rows written so far.
    pub fn row_count(&self) -> u64 {
        self.row_count
    }

    /// Final (post-rename) path of the file.
    pub fn path(&self) -> &Path {
        &self.final_path
    }

    /// Flushes, syncs, and renames the file into its final name.
    pub fn close(mut self) -> Result<PathBuf, XlogError> {
        self.flush_tx()?;
        if self.sync_mode != SyncMode::None {
            self.file.sync_all()?;
        }
        fs::rename(&self.inprogress_path, &self.final_path)?;
        if let Some(dir) = self.final_path.parent()
            && let Ok(dir) = File::open(dir)
        {
            let _ = dir.sync_all();
        }
        info!(path = %self.final_path.display(), rows = self.row_count, "xlog closed");
        Ok(self.final_path.clone())
    }

    /// Abandons the file, removing the `.inprogress` artifact.
    pub fn discard(self) -> Result<(), XlogError> {
        fs::remove_file(&self.inprogress_path)?;
        Ok(())
    }
}

fn inprogress_name(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(INPROGRESS_SUFFIX);
    PathBuf::from(name)
}

/// Decodes one transaction block (fixheader + payload) from the front
/// of a byte slice, returning the uncompressed row payload and the
/// total bytes the block occupies. Used for random-access page reads
/// out of a memory-mapped run file.
pub fn decode_tx_block(buf: &[u8]) -> Result<(Vec<u8>, usize), XlogError> {
    if buf.len() < FIXHEADER_SIZE {
        return Err(XlogError::BadMagic(0));
    }
    let magic = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if magic != TX_MAGIC {
        return Err(XlogError::BadMagic(0));
    }
    let crc = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let len = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    let flags = buf[12];
    if buf.len() - FIXHEADER_SIZE < len {
        return Err(XlogError::BadMagic(0));
    }
    let payload = &buf[FIXHEADER_SIZE..FIXHEADER_SIZE + len];

    let mut hasher = Crc32::new();
    hasher.update(payload);
    if hasher.finalize() != crc {
        return Err(XlogError::ChecksumMismatch(0));
    }

    let rows = if flags & FLAG_ZSTD != 0 {
        zstd::stream::decode_all(payload)
            .map_err(|e| XlogError::Decompression(e.to_string()))?
    } else {
        payload.to_vec()
    };
    Ok((rows, FIXHEADER_SIZE + len))
}

// ------------------------------------------------------------------------------------------------
// Cursor
// ------------------------------------------------------------------------------------------------

/// Position of an [`XlogCursor`] within its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Not opened or already closed.
    Closed,
    /// Between transactions.
    Active,
    /// Inside a transaction; rows are available.
    Tx,
    /// Past the last transaction.
    Eof,
}

/// Sequential reader over an xlog-format file.
pub struct XlogCursor {
    buf: Vec<u8>,
    pos: usize,
    meta: XlogMeta,
    state: CursorState,
    /// Decompressed payload of the current transaction.
    tx_rows: Vec<u8>,
    tx_pos: usize,
}

impl XlogCursor {
    /// Opens a file and parses its meta block.
    pub fn open(path: impl AsRef<Path>) -> Result<XlogCursor, XlogError> {
        let mut file = File::open(path.as_ref())?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        let (meta, meta_len) = XlogMeta::decode(&buf)?;
        debug!(path = %path.as_ref().display(), filetype = meta.filetype.as_str(), "xlog opened for replay");
        Ok(XlogCursor {
            buf,
            pos: meta_len,
            meta,
            state: CursorState::Active,
            tx_rows: Vec::new(),
            tx_pos: 0,
        })
    }

    /// Opens a file and verifies its declared filetype.
    pub fn open_expect(
        path: impl AsRef<Path>,
        expected: FileType,
    ) -> Result<XlogCursor, XlogError> {
        let cursor = Self::open(path)?;
        if cursor.meta.filetype != expected {
            return Err(XlogError::TypeMismatch {
                expected: expected.as_str(),
                found: cursor.meta.filetype.as_str().to_string(),
            });
        }
        Ok(cursor)
    }

    /// File meta block.
    pub fn meta(&self) -> &XlogMeta {
        &self.meta
    }

    /// Current state.
    pub fn state(&self) -> CursorState {
        self.state
    }

    /// Advances to the next transaction. Returns `false` at EOF.
    ///
    /// A corrupt fixheader or payload yields an error and leaves the
    /// cursor where it was; the caller either fails hard or calls
    /// [`XlogCursor::skip_to_next_tx`].
    pub fn next_tx(&mut self) -> Result<bool, XlogError> {
        match self.state {
            CursorState::Closed => return Err(XlogError::BadState(self.state)),
            CursorState::Eof => return Ok(false),
            CursorState::Active | CursorState::Tx => {}
        }

        if self.pos == self.buf.len() {
            self.state = CursorState::Eof;
            return Ok(false);
        }
        if self.buf.len() - self.pos < FIXHEADER_SIZE {
            // Trailing garbage shorter than a header: treat as a torn write.
            self.state = CursorState::Eof;
            warn!(offset = self.pos, "xlog ends with a truncated fixheader");
            return Ok(false);
        }

        let at = self.pos;
        let magic = u32::from_le_bytes([
            self.buf[at],
            self.buf[at + 1],
            self.buf[at + 2],
            self.buf[at + 3],
        ]);
        if magic != TX_MAGIC {
            return Err(XlogError::BadMagic(at as u64));
        }
        let crc = u32::from_le_bytes([
            self.buf[at + 4],
            self.buf[at + 5],
            self.buf[at + 6],
            self.buf[at + 7],
        ]);
        let len = u32::from_le_bytes([
            self.buf[at + 8],
            self.buf[at + 9],
            self.buf[at + 10],
            self.buf[at + 11],
        ]) as usize;
        let flags = self.buf[at + 12];

        let payload_start = at + FIXHEADER_SIZE;
        if self.buf.len() - payload_start < len {
            // Torn final transaction.
            self.state = CursorState::Eof;
            warn!(offset = at, "xlog ends with a truncated transaction");
            return Ok(false);
        }
        let payload = &self.buf[payload_start..payload_start + len];

        let mut hasher = Crc32::new();
        hasher.update(payload);
        if hasher.finalize() != crc {
            return Err(XlogError::ChecksumMismatch(at as u64));
        }

        self.tx_rows = if flags & FLAG_ZSTD != 0 {
            zstd::stream::decode_all(payload)
                .map_err(|e| XlogError::Decompression(e.to_string()))?
        } else {
            payload.to_vec()
        };
        self.tx_pos = 0;
        self.pos = payload_start + len;
        self.state = CursorState::Tx;
        Ok(true)
    }

    /// Returns the next row of the current transaction, or `None` at
    /// end-of-transaction. The trailing row-index row is surfaced like
    /// any other; WAL replay filters it by space id.
    pub fn next_row(&mut self) -> Result<Option<Row>, XlogError> {
        if self.state != CursorState::Tx {
            return Err(XlogError::BadState(self.state));
        }
        if self.tx_pos >= self.tx_rows.len() {
            self.state = CursorState::Active;
            return Ok(None);
        }
        let (row, n) = Row::decode(&self.tx_rows[self.tx_pos..])?;
        self.tx_pos += n;
        Ok(Some(row))
    }

    /// Scans forward byte by byte for the next valid transaction magic,
    /// recovering from a corrupt block. Returns `false` when the scan
    /// reaches EOF.
    pub fn skip_to_next_tx(&mut self) -> bool {
        let mut at = self.pos + 1;
        while at + FIXHEADER_SIZE <= self.buf.len() {
            let magic = u32::from_le_bytes([
                self.buf[at],
                self.buf[at + 1],
                self.buf[at + 2],
                self.buf[at + 3],
            ]);
            if magic == TX_MAGIC {
                warn!(skipped = at - self.pos, offset = at, "resuming replay at next magic");
                self.pos = at;
                self.state = CursorState::Active;
                return true;
            }
            at += 1;
        }
        self.pos = self.buf.len();
        self.state = CursorState::Eof;
        false
    }

    /// Closes the cursor.
    pub fn close(&mut self) {
        self.state = CursorState::Closed;
        self.buf = Vec::new();
        self.tx_rows = Vec::new();
    }
}

// ------------------------------------------------------------------------------------------------
// Directory scan
// ------------------------------------------------------------------------------------------------

/// A directory of xlog-format files of one type, named by vclock sum.
#[derive(Debug, Clone)]
pub struct Xdir {
    path: PathBuf,
    filetype: FileType,
}

impl Xdir {
    /// Binds a directory (created if absent) to one filetype. Stale
    /// `.inprogress` artifacts of a crashed writer are removed.
    pub fn new(path: impl AsRef<Path>, filetype: FileType) -> Result<Xdir, XlogError> {
        fs::create_dir_all(path.as_ref())?;
        for entry in fs::read_dir(path.as_ref())? {
            let entry = entry?;
            let p = entry.path();
            if p.is_file()
                && p.to_str().is_some_and(|s| s.ends_with(INPROGRESS_SUFFIX))
            {
                warn!(path = %p.display(), "removing stale in-progress file");
                fs::remove_file(&p)?;
            }
        }
        Ok(Xdir {
            path: path.as_ref().to_path_buf(),
            filetype,
        })
    }

    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn suffix(&self) -> &'static str {
        match self.filetype {
            FileType::Snap => "snap",
            _ => "xlog",
        }
    }

    /// Name for a file opening at vclock sum `signature`.
    pub fn filename(&self, signature: i64) -> PathBuf {
        self.path.join(format!("{:020}.{}", signature, self.suffix()))
    }

    /// Scans for completed files, returning `(signature, path)` pairs
    /// sorted by signature ascending. In-progress files are skipped.
    pub fn scan(&self) -> Result<Vec<(i64, PathBuf)>, XlogError> {
        let mut found = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.ends_with(INPROGRESS_SUFFIX) {
                continue;
            }
            let Some(stem) = name.strip_suffix(&format!(".{}", self.suffix())) else {
                continue;
            };
            if let Ok(signature) = stem.parse::<i64>() {
                found.push((signature, path));
            }
        }
        found.sort_by_key(|(signature, _)| *signature);
        Ok(found)
    }

    /// Latest completed file at or below `signature`, if any.
    pub fn find(&self, signature: i64) -> Result<Option<(i64, PathBuf)>, XlogError> {
        Ok(self
            .scan()?
            .into_iter()
            .filter(|(s, _)| *s <= signature)
            .next_back())
    }

    /// Removes completed files with signature strictly below `keep`.
    pub fn collect_garbage(&self, keep: i64) -> Result<usize, XlogError> {
        let mut removed = 0;
        for (signature, path) in self.scan()? {
            if signature < keep {
                info!(path = %path.display(), signature, "removing old xlog file");
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// File name of a run data or index file: `<lsn>.<range>.<run>` in hex.
pub fn run_filename(dir: &Path, lsn: i64, range_id: u32, run_id: u32, index: bool) -> PathBuf {
    dir.join(format!(
        "{:016x}.{:08x}.{:08x}.{}",
        lsn,
        range_id,
        run_id,
        if index { "index" } else { "run" }
    ))
}

/// Parses a run/index file name back into `(lsn, range_id, run_id)`.
pub fn parse_run_filename(name: &str) -> Option<(i64, u32, u32, bool)> {
    let (stem, index) = if let Some(stem) = name.strip_suffix(".index") {
        (stem, true)
    } else if let Some(stem) = name.strip_suffix(".run") {
        (stem, false)
    } else {
        return None;
    };
    let mut parts = stem.split('.');
    let lsn = i64::from_str_radix(parts.next()?, 16).ok()?;
    let range_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    let run_id = u32::from_str_radix(parts.next()?, 16).ok()?;
    if parts.next().is_some() {
        return None;
    }
    Some((lsn, range_id, run_id, index))
}
