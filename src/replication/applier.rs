//! The applier — the client half of replication.

use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{bounded, Receiver, Sender};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BoxError;
use crate::vclock::Vclock;
use crate::xlog::{Row, RowType};

use super::{read_msg, write_msg, ReplicationError, HEARTBEAT_TIMEOUT};

/// Applier state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    /// Not started.
    Off,
    /// Opening the socket.
    Connect,
    /// Credentials sent, waiting for acknowledgement.
    Auth,
    /// Authenticated; holding at the pause barrier.
    Connected,
    /// Receiving the snapshot stream.
    InitialJoin,
    /// Receiving the WAL catch-up stream.
    FinalJoin,
    /// Bootstrap complete.
    Joined,
    /// Applying the live subscription stream.
    Follow,
    /// Stopped by the operator.
    Stopped,
    /// Connection lost; reconnecting with back-off.
    Disconnected,
}

/// Row sink for one replication phase.
pub type RowSink = Box<dyn FnMut(&Row) -> Result<(), BoxError> + Send>;

/// Applier configuration.
pub struct ApplierConfig {
    /// Master address, `host:port`.
    pub uri: String,
    /// Local instance identity (self-origin rows are skipped).
    pub instance_uuid: Uuid,
    /// Local instance id (rows from this origin are skipped in FOLLOW).
    pub instance_id: u32,
    /// Replica-set identity; a mismatching master is rejected.
    pub cluster_uuid: Uuid,
    /// Expected master identity, when known from an earlier session.
    pub expected_master_uuid: Option<Uuid>,
    /// Whether the replica needs a bulk JOIN (fresh instance) or can
    /// SUBSCRIBE directly from its vclock.
    pub need_join: bool,
    /// Vclock to subscribe from.
    pub subscribe_vclock: Vclock,
}

struct ApplierShared {
    state: Mutex<ApplierState>,
    stop: AtomicBool,
    /// Once released from the pause barrier, reconnects skip it.
    released: AtomicBool,
    /// Seconds since epoch of the last received row.
    last_row_time: Mutex<f64>,
    /// Replication lag in seconds, from row timestamps.
    lag: Mutex<f64>,
    /// Master identity learned from the greeting.
    master_uuid: Mutex<Option<Uuid>>,
    /// Master vclock learned from the greeting.
    master_vclock: Mutex<Vclock>,
}

/// The applier: connects to one master and pumps its row stream into
/// the configured sinks. See [`ApplierState`] for the FSM.
pub struct Applier {
    shared: Arc<ApplierShared>,
    resume_tx: Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl Applier {
    /// Starts the applier thread. It connects, authenticates, then
    /// holds at CONNECTED until [`Applier::resume`] releases it — the
    /// barrier lets a controller bring up every applier before any
    /// bulk replay begins.
    pub fn start(
        config: ApplierConfig,
        initial_sink: RowSink,
        final_sink: RowSink,
        subscribe_sink: RowSink,
    ) -> Applier {
        let shared = Arc::new(ApplierShared {
            state: Mutex::new(ApplierState::Off),
            stop: AtomicBool::new(false),
            released: AtomicBool::new(false),
            last_row_time: Mutex::new(0.0),
            lag: Mutex::new(0.0),
            master_uuid: Mutex::new(None),
            master_vclock: Mutex::new(Vclock::new()),
        });
        let (resume_tx, resume_rx) = bounded::<()>(1);

        let thread = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("applier/{}", config.uri))
                .spawn(move || {
                    applier_loop(
                        shared,
                        config,
                        resume_rx,
                        initial_sink,
                        final_sink,
                        subscribe_sink,
                    )
                })
                .expect("spawning an applier thread")
        };

        Applier {
            shared,
            resume_tx,
            thread: Some(thread),
        }
    }

    /// Current FSM state.
    pub fn state(&self) -> ApplierState {
        self.shared
            .state
            .lock()
            .map(|s| *s)
            .unwrap_or(ApplierState::Off)
    }

    /// Releases the pause barrier.
    pub fn resume(&self) {
        self.shared.released.store(true, AtomicOrdering::Release);
        let _ = self.resume_tx.try_send(());
    }

    /// Blocks until the applier reaches `state` or the timeout expires.
    pub fn wait_state(&self, state: ApplierState, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.state() == state {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    /// Seconds-since-epoch of the last received row.
    pub fn last_row_time(&self) -> f64 {
        self.shared.last_row_time.lock().map(|t| *t).unwrap_or(0.0)
    }

    /// Replication lag estimate, seconds.
    pub fn lag(&self) -> f64 {
        self.shared.lag.lock().map(|l| *l).unwrap_or(0.0)
    }

    /// Master identity learned from the greeting.
    pub fn master_uuid(&self) -> Option<Uuid> {
        self.shared.master_uuid.lock().ok().and_then(|u| *u)
    }

    /// Master vclock learned from the greeting.
    pub fn master_vclock(&self) -> Vclock {
        self.shared
            .master_vclock
            .lock()
            .map(|v| v.clone())
            .unwrap_or_default()
    }

    /// Stops the applier and joins its thread.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, AtomicOrdering::Release);
        let _ = self.resume_tx.try_send(());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
        if let Ok(mut state) = self.shared.state.lock() {
            *state = ApplierState::Stopped;
        }
    }
}

impl Drop for Applier {
    fn drop(&mut self) {
        self.stop();
    }
}

// ------------------------------------------------------------------------------------------------
// Thread body
// ------------------------------------------------------------------------------------------------

fn set_state(shared: &ApplierShared, state: ApplierState) {
    if let Ok(mut cur) = shared.state.lock() {
        debug!(from = ?*cur, to = ?state, "applier state");
        *cur = state;
    }
}

fn now_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

fn applier_loop(
    shared: Arc<ApplierShared>,
    mut config: ApplierConfig,
    resume_rx: Receiver<()>,
    mut initial_sink: RowSink,
    mut final_sink: RowSink,
    mut subscribe_sink: RowSink,
) {
    let mut backoff = Duration::from_millis(100);
    loop {
        if shared.stop.load(AtomicOrdering::Acquire) {
            break;
        }
        match run_session(
            &shared,
            &mut config,
            &resume_rx,
            &mut initial_sink,
            &mut final_sink,
            &mut subscribe_sink,
        ) {
            Ok(()) => break, // clean stop
            Err(
                e @ (ReplicationError::UuidMismatch { .. }
                | ReplicationError::ClusterMismatch { .. }),
            ) => {
                // Identity errors are fatal; retrying cannot help.
                warn!(uri = %config.uri, error = %e, "applier terminated");
                set_state(&shared, ApplierState::Stopped);
                return;
            }
            Err(e) => {
                warn!(uri = %config.uri, error = %e, backoff = ?backoff, "applier disconnected");
                set_state(&shared, ApplierState::Disconnected);
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(Duration::from_secs(30));
            }
        }
    }
    set_state(&shared, ApplierState::Stopped);
}

fn run_session(
    shared: &Arc<ApplierShared>,
    config: &mut ApplierConfig,
    resume_rx: &Receiver<()>,
    initial_sink: &mut RowSink,
    final_sink: &mut RowSink,
    subscribe_sink: &mut RowSink,
) -> Result<(), ReplicationError> {
    set_state(shared, ApplierState::Connect);
    let mut stream = TcpStream::connect(&config.uri)?;
    stream.set_nodelay(true)?;
    stream.set_read_timeout(Some(HEARTBEAT_TIMEOUT))?;

    // Greeting: the master introduces itself.
    let greeting = read_msg(&mut stream)?
        .ok_or_else(|| ReplicationError::Protocol("no greeting from master".into()))?;
    let master_uuid = greeting
        .instance_uuid
        .ok_or_else(|| ReplicationError::Protocol("greeting without instance uuid".into()))?;
    if let Some(expected) = config.expected_master_uuid
        && expected != master_uuid
    {
        return Err(ReplicationError::UuidMismatch {
            expected,
            found: master_uuid,
        });
    }
    if let Some(theirs) = greeting.cluster_uuid
        && theirs != config.cluster_uuid
    {
        return Err(ReplicationError::ClusterMismatch {
            ours: config.cluster_uuid,
            theirs,
        });
    }
    if let Ok(mut uuid) = shared.master_uuid.lock() {
        *uuid = Some(master_uuid);
    }
    if let Some(vclock) = &greeting.vclock
        && let Ok(mut master_vclock) = shared.master_vclock.lock()
    {
        *master_vclock = vclock.clone();
    }

    // AUTH.
    set_state(shared, ApplierState::Auth);
    let mut auth = Row::new(RowType::Auth);
    auth.instance_uuid = Some(config.instance_uuid);
    write_msg(&mut stream, &auth)?;
    let ok = read_msg(&mut stream)?
        .ok_or_else(|| ReplicationError::Protocol("no auth acknowledgement".into()))?;
    if ok.row_type != RowType::Nop {
        return Err(ReplicationError::Protocol(format!(
            "unexpected auth reply {:?}",
            ok.row_type
        )));
    }

    // Pause barrier: hold here until the controller releases all
    // appliers (or stop is requested). Reconnects skip the barrier.
    set_state(shared, ApplierState::Connected);
    info!(uri = %config.uri, master = %master_uuid, "applier connected, waiting for release");
    while !shared.released.load(AtomicOrdering::Acquire) {
        if shared.stop.load(AtomicOrdering::Acquire) {
            return Ok(());
        }
        if resume_rx.recv_timeout(Duration::from_millis(100)).is_ok() {
            break;
        }
    }

    if config.need_join {
        run_join(shared, config, &mut stream, initial_sink, final_sink)?;
        config.need_join = false;
        set_state(shared, ApplierState::Joined);
    }

    // SUBSCRIBE from our vclock and follow.
    let mut subscribe = Row::new(RowType::Subscribe);
    subscribe.instance_uuid = Some(config.instance_uuid);
    subscribe.vclock = Some(config.subscribe_vclock.clone());
    write_msg(&mut stream, &subscribe)?;
    set_state(shared, ApplierState::Follow);
    info!(uri = %config.uri, "applier following");

    let mut last_heard = Instant::now();
    loop {
        if shared.stop.load(AtomicOrdering::Acquire) {
            return Ok(());
        }
        let Some(row) = read_msg(&mut stream)? else {
            if last_heard.elapsed() > HEARTBEAT_TIMEOUT {
                return Err(ReplicationError::HeartbeatTimeout);
            }
            continue;
        };
        last_heard = Instant::now();
        if let Ok(mut t) = shared.last_row_time.lock() {
            *t = now_seconds();
        }
        if row.row_type == RowType::Nop {
            continue; // heartbeat
        }
        if row.timestamp > 0.0
            && let Ok(mut lag) = shared.lag.lock()
        {
            *lag = (now_seconds() - row.timestamp).max(0.0);
        }
        // Never loop our own rows back.
        if row.server_id == config.instance_id {
            continue;
        }
        subscribe_sink(&row)?;
        config.subscribe_vclock.follow(row.server_id, row.lsn);
    }
}

fn run_join(
    shared: &Arc<ApplierShared>,
    config: &mut ApplierConfig,
    stream: &mut TcpStream,
    initial_sink: &mut RowSink,
    final_sink: &mut RowSink,
) -> Result<(), ReplicationError> {
    let mut join = Row::new(RowType::Join);
    join.instance_uuid = Some(config.instance_uuid);
    write_msg(stream, &join)?;

    // Initial join: the snapshot stream, terminated by a JOIN marker
    // carrying the master's snapshot vclock.
    set_state(shared, ApplierState::InitialJoin);
    let snapshot_vclock = loop {
        let Some(row) = read_msg(stream)? else {
            return Err(ReplicationError::Protocol("join stream stalled".into()));
        };
        match row.row_type {
            RowType::Join => {
                break row.vclock.clone().ok_or_else(|| {
                    ReplicationError::Protocol("join marker without vclock".into())
                })?;
            }
            RowType::Nop => continue,
            _ => initial_sink(&row)?,
        }
    };
    config.subscribe_vclock = snapshot_vclock;

    // Final join: the WAL suffix up to the master's current vclock,
    // terminated by a second marker.
    set_state(shared, ApplierState::FinalJoin);
    loop {
        let Some(row) = read_msg(stream)? else {
            return Err(ReplicationError::Protocol("join stream stalled".into()));
        };
        match row.row_type {
            RowType::Join => {
                if let Some(vclock) = &row.vclock {
                    config.subscribe_vclock = vclock.clone();
                }
                break;
            }
            RowType::Nop => continue,
            _ => {
                final_sink(&row)?;
                config.subscribe_vclock.follow(row.server_id, row.lsn);
            }
        }
    }
    info!(uri = %config.uri, vclock = %config.subscribe_vclock, "join complete");
    Ok(())
}
