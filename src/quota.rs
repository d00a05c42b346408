//! Engine memory quota with watermark feedback.
//!
//! Committed statements charge the quota; dumps release it. A writer
//! that would push `used` past the hard limit blocks until a dump
//! frees memory. The *watermark* sits below the limit and wakes the
//! scheduler early: it is recomputed from the observed transaction
//! write rate and dump bandwidth so that a dump started at the
//! watermark finishes before the limit is hit.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// How much of the recomputation interval the watermark should cover.
const WATERMARK_CHUNK: u64 = 64 * 1024 * 1024;

struct QuotaState {
    used: u64,
    limit: u64,
    watermark: u64,
    /// Bytes charged since the last watermark recomputation.
    charged_since: u64,
    last_recompute: Instant,
    /// Observed dump throughput samples, bytes/second.
    dump_bandwidth: Vec<u64>,
}

/// The engine memory quota. See the [module docs](self).
pub struct Quota {
    state: Mutex<QuotaState>,
    released: Condvar,
}

impl Quota {
    /// Creates a quota with the given hard limit in bytes.
    pub fn new(limit: u64) -> Quota {
        Quota {
            state: Mutex::new(QuotaState {
                used: 0,
                limit,
                watermark: limit,
                charged_since: 0,
                last_recompute: Instant::now(),
                dump_bandwidth: Vec::new(),
            }),
            released: Condvar::new(),
        }
    }

    /// Charges `n` bytes, blocking while `used ≥ limit`.
    pub fn use_(&self, n: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        while state.used >= state.limit {
            warn!(used = state.used, limit = state.limit, "quota exhausted, write stalled");
            let Ok((guard, _)) = self
                .released
                .wait_timeout(state, Duration::from_secs(1))
                .map_err(|_| ())
            else {
                return;
            };
            state = guard;
        }
        state.used += n;
        state.charged_since += n;
    }

    /// Releases `n` bytes, waking stalled writers when crossing the
    /// limit downward.
    pub fn release(&self, n: u64) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let was_over = state.used >= state.limit;
        state.used = state.used.saturating_sub(n);
        let now_under = state.used < state.limit;
        drop(state);
        if was_over && now_under {
            self.released.notify_all();
        }
    }

    /// Bytes currently in use.
    pub fn used(&self) -> u64 {
        self.state.lock().map(|s| s.used).unwrap_or(0)
    }

    /// Hard limit in bytes.
    pub fn limit(&self) -> u64 {
        self.state.lock().map(|s| s.limit).unwrap_or(0)
    }

    /// Current watermark in bytes.
    pub fn watermark(&self) -> u64 {
        self.state.lock().map(|s| s.watermark).unwrap_or(0)
    }

    /// Whether the watermark is exceeded — the scheduler should dump.
    pub fn exceeded(&self) -> bool {
        self.state
            .lock()
            .map(|s| s.used >= s.watermark)
            .unwrap_or(false)
    }

    /// Records the throughput of a completed dump.
    pub fn observe_dump(&self, bytes: u64, elapsed: Duration) {
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 || bytes == 0 {
            return;
        }
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.dump_bandwidth.push((bytes as f64 / secs) as u64);
        // Keep a bounded window of recent observations.
        if state.dump_bandwidth.len() > 128 {
            state.dump_bandwidth.remove(0);
        }
    }

    /// Recomputes the watermark as
    /// `limit − chunk × write_rate / dump_bandwidth`, where the dump
    /// bandwidth is the 10th percentile of observed throughput.
    /// Called periodically by the scheduler.
    pub fn recompute_watermark(&self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let elapsed = state.last_recompute.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return;
        }
        let write_rate = (state.charged_since as f64 / elapsed) as u64;
        state.charged_since = 0;
        state.last_recompute = Instant::now();

        let mut samples = state.dump_bandwidth.clone();
        if samples.is_empty() || write_rate == 0 {
            return;
        }
        samples.sort_unstable();
        let p10 = samples[(samples.len() - 1) / 10];
        if p10 == 0 {
            return;
        }

        let reserve = WATERMARK_CHUNK.saturating_mul(write_rate) / p10;
        state.watermark = state.limit.saturating_sub(reserve).max(state.limit / 2);
        debug!(
            watermark = state.watermark,
            limit = state.limit,
            write_rate,
            dump_bandwidth_p10 = p10,
            "quota watermark recomputed"
        );
    }
}

// ------------------------------------------------------------------------------------------------
// Unit tests
// ------------------------------------------------------------------------------------------------
