//! Crate-wide error taxonomy.
//!
//! Every error that crosses the engine boundary carries a stable numeric
//! [`ErrorCode`] plus a human-readable message. Subsystems keep their own
//! `thiserror` enums internally; at the request boundary they are folded
//! into a [`BoxError`] so clients observe a single `(code, message)`
//! contract regardless of which layer failed.
//!
//! A thread-local **diagnostics area** records the most recent boundary
//! error raised on the current thread, so background workers can stash a
//! failure where the scheduler (or a test) can inspect it later without
//! threading the error through every channel.

use std::cell::RefCell;
use std::fmt;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error codes
// ------------------------------------------------------------------------------------------------

/// Stable numeric error codes.
///
/// The discriminants are part of the public contract — they are reported
/// to clients and must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum ErrorCode {
    /// Malformed argument to an engine operation.
    IllegalParams = 1,
    /// Memory allocation failure (quota or allocator).
    MemoryIssue = 2,
    /// Duplicate key in a unique index.
    DuplicateKey = 3,
    /// Tuple was not found by the given key.
    TupleNotFound = 4,
    /// The instance is in read-only mode.
    ReadOnly = 5,
    /// No space with the given id.
    NoSuchSpace = 6,
    /// No index with the given ordinal in the space.
    NoSuchIndex = 7,
    /// A field's MessagePack type does not match the index definition.
    FieldTypeMismatch = 8,
    /// MessagePack decoding failure.
    MsgpackDecode = 9,
    /// Write-ahead-log I/O failure.
    WalIo = 10,
    /// A gap was found in the xlog directory (missing LSN range).
    XlogGap = 11,
    /// An xlog file's meta declares an unexpected filetype.
    XlogTypeMismatch = 12,
    /// A run id referenced by an index file is unknown.
    InvalidRunId = 13,
    /// Tuple reference counter overflow.
    TupleRefOverflow = 14,
    /// Arena/slab allocator exhausted.
    ArenaExhausted = 15,
    /// Compression failure.
    Compression = 16,
    /// Decompression failure.
    Decompression = 17,
    /// Transaction aborted due to a read-write conflict.
    TransactionConflict = 18,
    /// Operation requires an active transaction and none is active.
    NoActiveTransaction = 19,
    /// A transaction is already active on this session.
    ActiveTransaction = 20,
    /// A transaction touched spaces of two different engines.
    CrossEngineTransaction = 21,
    /// Nested statement depth limit exceeded.
    NestedStatementLimit = 22,
    /// Engine is still loading (recovery in progress).
    Loading = 23,
    /// Replication peer sent a mismatched instance or cluster UUID.
    ReplicaUuidMismatch = 24,
    /// Operating-system level failure.
    System = 25,
    /// Invariant violation inside the engine.
    Internal = 26,
}

impl ErrorCode {
    /// Numeric code reported to clients.
    pub fn code(self) -> u32 {
        self as u32
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ER{:03}", self.code())
    }
}

// ------------------------------------------------------------------------------------------------
// Boundary error
// ------------------------------------------------------------------------------------------------

/// An error as observed at the engine boundary: a numeric code plus a
/// formatted message.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct BoxError {
    /// Stable numeric code.
    pub code: ErrorCode,
    /// Formatted, human-readable message.
    pub message: String,
}

impl BoxError {
    /// Creates a new boundary error with the given code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Creates the error and records it in the thread-local diagnostics
    /// area in one step.
    pub fn raise(code: ErrorCode, message: impl Into<String>) -> Self {
        let err = Self::new(code, message);
        diag_set(err.clone());
        err
    }
}

impl From<std::io::Error> for BoxError {
    fn from(e: std::io::Error) -> Self {
        BoxError::new(ErrorCode::System, e.to_string())
    }
}

/// Boundary result alias used across the engine facade.
pub type BoxResult<T> = Result<T, BoxError>;

// ------------------------------------------------------------------------------------------------
// Diagnostics area
// ------------------------------------------------------------------------------------------------

thread_local! {
    static DIAG: RefCell<Option<BoxError>> = const { RefCell::new(None) };
}

/// Records `err` as the most recent error for the current thread.
pub fn diag_set(err: BoxError) {
    DIAG.with(|d| *d.borrow_mut() = Some(err));
}

/// Returns the most recent error recorded on the current thread, if any.
pub fn diag_last() -> Option<BoxError> {
    DIAG.with(|d| d.borrow().clone())
}

/// Clears the current thread's diagnostics area.
pub fn diag_clear() {
    DIAG.with(|d| *d.borrow_mut() = None);
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ErrorCode::IllegalParams.code(), 1);
        assert_eq!(ErrorCode::DuplicateKey.code(), 3);
        assert_eq!(ErrorCode::TransactionConflict.code(), 18);
        assert_eq!(ErrorCode::Internal.code(), 26);
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = BoxError::new(ErrorCode::NoSuchSpace, "no space with id 512");
        assert_eq!(err.to_string(), "ER006: no space with id 512");
    }

    #[test]
    fn diag_area_records_last_error() {
        diag_clear();
        assert!(diag_last().is_none());

        let _ = BoxError::raise(ErrorCode::ReadOnly, "instance is read-only");
        let last = diag_last().unwrap();
        assert_eq!(last.code, ErrorCode::ReadOnly);

        let _ = BoxError::raise(ErrorCode::WalIo, "short write");
        assert_eq!(diag_last().unwrap().code, ErrorCode::WalIo);

        diag_clear();
        assert!(diag_last().is_none());
    }
}
