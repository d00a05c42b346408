//! Asynchronous master→replica replication.
//!
//! The protocol runs over a plain TCP connection exchanging
//! length-prefixed encoded rows (`u32 LE length | row`):
//!
//! ```text
//! relay → applier   greeting  (NOP + instance uuid + cluster uuid + vclock)
//! applier → relay   AUTH      (instance uuid)
//! relay → applier   NOP ok    (vclock)
//! applier → relay   JOIN
//! relay → applier   INSERT*   (snapshot rows)
//! relay → applier   JOIN      (final marker with the master vclock)
//! applier → relay   SUBSCRIBE (replica vclock)
//! relay → applier   row / heartbeat stream
//! ```
//!
//! [`applier::Applier`] is the client half: a state machine driven by a
//! dedicated thread with reconnect and exponential back-off.
//! [`relay::Relay`] is the server half, one thread per accepted
//! replica.

pub mod applier;
pub mod relay;


use std::io::{self, Read, Write};
use std::net::TcpStream;

use thiserror::Error;

use crate::error::BoxError;
use crate::xlog::{Row, XlogError};

/// Heartbeat interval on an idle subscription.
pub const HEARTBEAT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Missing heartbeats for this long disconnect the applier.
pub const HEARTBEAT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(4);

/// Upper bound on a single replication message.
const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by replication.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Socket failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Row codec failure.
    #[error("xlog error: {0}")]
    Xlog(#[from] XlogError),

    /// The peer identifies as a different instance than configured.
    #[error("instance UUID mismatch: expected {expected}, peer is {found}")]
    UuidMismatch {
        /// Configured peer identity.
        expected: uuid::Uuid,
        /// Identity the peer presented.
        found: uuid::Uuid,
    },

    /// The peer belongs to a different replica set.
    #[error("replica set UUID mismatch: ours {ours}, peer's {theirs}")]
    ClusterMismatch {
        /// Local replica-set identity.
        ours: uuid::Uuid,
        /// Peer's replica-set identity.
        theirs: uuid::Uuid,
    },

    /// The peer violated the protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// A row sink rejected a row.
    #[error("apply error: {0}")]
    Apply(#[from] BoxError),

    /// No heartbeat within the timeout.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
}

// ------------------------------------------------------------------------------------------------
// Message framing
// ------------------------------------------------------------------------------------------------

/// Writes one length-prefixed row.
pub fn write_msg(stream: &mut TcpStream, row: &Row) -> Result<(), ReplicationError> {
    let mut body = Vec::new();
    row.encode(&mut body);
    let len = body.len() as u32;
    stream.write_all(&len.to_le_bytes())?;
    stream.write_all(&body)?;
    stream.flush()?;
    Ok(())
}

/// Reads one length-prefixed row. Returns `Ok(None)` on a read timeout
/// (the socket's configured read timeout elapsed with no data).
pub fn read_msg(stream: &mut TcpStream) -> Result<Option<Row>, ReplicationError> {
    let mut len_bytes = [0u8; 4];
    match stream.read_exact(&mut len_bytes) {
        Ok(()) => {}
        Err(e)
            if e.kind() == io::ErrorKind::WouldBlock
                || e.kind() == io::ErrorKind::TimedOut =>
        {
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_bytes);
    if len > MAX_MESSAGE_SIZE {
        return Err(ReplicationError::Protocol(format!(
            "message of {len} bytes exceeds the limit"
        )));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body)?;
    let (row, _) = Row::decode(&body)?;
    Ok(Some(row))
}
