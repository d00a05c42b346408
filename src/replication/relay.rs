//! The relay — the server half of replication.

use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{info, warn};
use uuid::Uuid;

use crate::error::BoxResult;
use crate::vclock::Vclock;
use crate::xlog::{Row, RowType};

use super::{read_msg, write_msg, ReplicationError, HEARTBEAT_INTERVAL};

/// What a relay serves: identity, clocks, and row streams. Implemented
/// by the engine facade.
pub trait RelaySource: Send + Sync + 'static {
    /// This instance's identity.
    fn instance_uuid(&self) -> Uuid;
    /// The replica set's identity.
    fn cluster_uuid(&self) -> Uuid;
    /// Current committed vclock.
    fn vclock(&self) -> Vclock;
    /// Full snapshot of all non-temporary spaces, in ascending
    /// `(space_id, primary key)` order. The JOIN bulk stream.
    fn snapshot_rows(&self) -> BoxResult<Vec<Row>>;
    /// Committed rows the peer has not seen, per its vclock.
    fn rows_since(&self, vclock: &Vclock) -> BoxResult<Vec<Row>>;
}

/// Accepts replicas and serves each on its own thread.
pub struct Relay {
    stop: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
    local_addr: std::net::SocketAddr,
}

impl Relay {
    /// Binds `listen` and starts accepting replicas.
    pub fn bind(listen: &str, source: Arc<dyn RelaySource>) -> Result<Relay, ReplicationError> {
        let listener = TcpListener::bind(listen)?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        let stop = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let stop = Arc::clone(&stop);
            std::thread::Builder::new()
                .name("relay.accept".into())
                .spawn(move || {
                    let mut sessions: Vec<JoinHandle<()>> = Vec::new();
                    while !stop.load(AtomicOrdering::Acquire) {
                        match listener.accept() {
                            Ok((stream, peer)) => {
                                info!(%peer, "replica connected");
                                let source = Arc::clone(&source);
                                let stop = Arc::clone(&stop);
                                let handle = std::thread::Builder::new()
                                    .name(format!("relay/{peer}"))
                                    .spawn(move || {
                                        if let Err(e) = serve_replica(stream, source, stop) {
                                            warn!(%peer, error = %e, "relay session ended");
                                        }
                                    });
                                if let Ok(handle) = handle {
                                    sessions.push(handle);
                                }
                            }
                            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                                std::thread::sleep(Duration::from_millis(50));
                            }
                            Err(e) => {
                                warn!(error = %e, "relay accept failed");
                                break;
                            }
                        }
                    }
                    for handle in sessions {
                        let _ = handle.join();
                    }
                })
                .expect("spawning the relay accept thread")
        };

        Ok(Relay {
            stop,
            accept_thread: Some(accept_thread),
            local_addr,
        })
    }

    /// Actual bound address (useful with port 0).
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stops accepting and tears down replica sessions.
    pub fn stop(&mut self) {
        self.stop.store(true, AtomicOrdering::Release);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Relay {
    fn drop(&mut self) {
        self.stop();
    }
}

// ------------------------------------------------------------------------------------------------
// Session
// ------------------------------------------------------------------------------------------------

fn serve_replica(
    mut stream: TcpStream,
    source: Arc<dyn RelaySource>,
    stop: Arc<AtomicBool>,
) -> Result<(), ReplicationError> {
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(Duration::from_millis(100)))?;

    // Greeting.
    let mut greeting = Row::new(RowType::Nop);
    greeting.instance_uuid = Some(source.instance_uuid());
    greeting.cluster_uuid = Some(source.cluster_uuid());
    greeting.vclock = Some(source.vclock());
    write_msg(&mut stream, &greeting)?;

    // AUTH.
    let auth = wait_msg(&mut stream, &stop)?;
    if auth.row_type != RowType::Auth {
        return Err(ReplicationError::Protocol(format!(
            "expected AUTH, got {:?}",
            auth.row_type
        )));
    }
    let replica_uuid = auth
        .instance_uuid
        .ok_or_else(|| ReplicationError::Protocol("AUTH without instance uuid".into()))?;
    let mut ok = Row::new(RowType::Nop);
    ok.vclock = Some(source.vclock());
    write_msg(&mut stream, &ok)?;
    info!(replica = %replica_uuid, "replica authenticated");

    // JOIN (optional) then SUBSCRIBE.
    let request = wait_msg(&mut stream, &stop)?;
    let subscribe = match request.row_type {
        RowType::Join => {
            serve_join(&mut stream, &source)?;
            wait_msg(&mut stream, &stop)?
        }
        _ => request,
    };
    if subscribe.row_type != RowType::Subscribe {
        return Err(ReplicationError::Protocol(format!(
            "expected SUBSCRIBE, got {:?}",
            subscribe.row_type
        )));
    }
    let mut replica_vclock = subscribe.vclock.clone().unwrap_or_default();
    info!(replica = %replica_uuid, vclock = %replica_vclock, "replica subscribed");

    // Continuous feed with heartbeats.
    let mut last_sent = Instant::now();
    loop {
        if stop.load(AtomicOrdering::Acquire) {
            return Ok(());
        }
        let rows = source.rows_since(&replica_vclock)?;
        if rows.is_empty() {
            if last_sent.elapsed() >= HEARTBEAT_INTERVAL {
                write_msg(&mut stream, &Row::new(RowType::Nop))?;
                last_sent = Instant::now();
            }
            std::thread::sleep(Duration::from_millis(50));
            continue;
        }
        for row in rows {
            replica_vclock.follow(row.server_id, row.lsn);
            write_msg(&mut stream, &row)?;
        }
        last_sent = Instant::now();
    }
}

fn serve_join(
    stream: &mut TcpStream,
    source: &Arc<dyn RelaySource>,
) -> Result<(), ReplicationError> {
    // Initial join: the whole snapshot.
    let rows = source.snapshot_rows()?;
    let snapshot_vclock = source.vclock();
    info!(rows = rows.len(), "serving initial join");
    for row in rows {
        write_msg(stream, &row)?;
    }
    let mut marker = Row::new(RowType::Join);
    marker.vclock = Some(snapshot_vclock.clone());
    write_msg(stream, &marker)?;

    // Final join: whatever committed while the snapshot streamed.
    let rows = source.rows_since(&snapshot_vclock)?;
    info!(rows = rows.len(), "serving final join");
    for row in rows {
        write_msg(stream, &row)?;
    }
    let mut marker = Row::new(RowType::Join);
    marker.vclock = Some(source.vclock());
    write_msg(stream, &marker)?;
    Ok(())
}

fn wait_msg(stream: &mut TcpStream, stop: &AtomicBool) -> Result<Row, ReplicationError> {
    loop {
        if stop.load(AtomicOrdering::Acquire) {
            return Err(ReplicationError::Protocol("relay stopping".into()));
        }
        if let Some(row) = read_msg(stream)? {
            return Ok(row);
        }
    }
}
