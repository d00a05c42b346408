//! Background dump and compaction scheduling.
//!
//! A dedicated scheduler thread watches every registered LSM index and
//! keeps two priority orders over its ranges:
//!
//! - the **dump order**, by lowest in-memory LSN ascending — the range
//!   holding the oldest memory goes first, because it pins both WAL
//!   garbage collection and checkpointing;
//! - the **compaction order**, by on-disk run count descending — the
//!   range with the most runs amplifies reads the worst.
//!
//! A dump is scheduled when a checkpoint wants memory at or below its
//! LSN on disk, or when the quota watermark is exceeded. Otherwise a
//! compaction is scheduled when a range reaches its run-count
//! watermark. Tasks execute on a pool of worker threads; completions
//! flow back over a channel and are published on the scheduler thread.
//!
//! Failures put the scheduler into exponential back-off (1s doubling
//! to 60s, reset by any success); the failed range is left
//! re-schedulable.
//!
//! A separate squash worker materializes over-long UPSERT chains into
//! plain REPLACEs in the background.

#[cfg(test)]
mod tests;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::error::{diag_set, BoxError, ErrorCode};
use crate::iterator::{IteratorType, ReadIterator, WriteIterator};
use crate::mem::VyMem;
use crate::quota::Quota;
use crate::range::{LsmIndex, RangeError, VyRange};
use crate::run::{Run, RunError, RunWriter};
use crate::tx::TxManager;

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const IDLE_WAIT: Duration = Duration::from_millis(100);
const WATERMARK_PERIOD: Duration = Duration::from_secs(1);

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors produced by background tasks.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Range bookkeeping failure.
    #[error("range error: {0}")]
    Range(#[from] RangeError),

    /// Run I/O failure.
    #[error("run error: {0}")]
    Run(#[from] RunError),

    /// Iterator failure inside a task.
    #[error("iterator error: {0}")]
    Iterator(#[from] crate::iterator::IteratorError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Tasks
// ------------------------------------------------------------------------------------------------

struct DumpJob {
    index: Arc<LsmIndex>,
    range: Arc<VyRange>,
    mems: Vec<Arc<VyMem>>,
    oldest_vlsn: i64,
    run_id: u32,
    mem_bytes: u64,
}

struct CompactJob {
    index: Arc<LsmIndex>,
    old_range: Arc<VyRange>,
    new_ranges: Vec<Arc<VyRange>>,
    mems: Vec<Arc<VyMem>>,
    runs: Vec<Arc<Run>>,
    oldest_vlsn: i64,
    run_ids: Vec<u32>,
    mem_bytes: u64,
}

enum Job {
    Dump(DumpJob),
    Compact(CompactJob),
}

enum JobOutput {
    /// Run produced by a dump (`None` when everything was discarded).
    Dump(Option<Arc<Run>>),
    /// One run per result range (`None` for an empty side of a split).
    Compact(Vec<Option<Arc<Run>>>),
}

struct JobResult {
    job: Job,
    output: Result<JobOutput, SchedulerError>,
    elapsed: Duration,
}

fn execute_dump(job: &DumpJob) -> Result<JobOutput, SchedulerError> {
    let key_def = Arc::clone(job.index.key_def());
    let mut wi = WriteIterator::new(Arc::clone(&key_def), job.oldest_vlsn, false);
    for mem in &job.mems {
        wi.add_mem(Arc::clone(mem))?;
    }

    let max_lsn = job.mems.iter().map(|m| m.max_lsn()).max().unwrap_or(0);
    let mut writer = RunWriter::new(
        job.index.dir(),
        max_lsn,
        job.range.id,
        job.run_id,
        job.index.space_id,
        job.index.index_id,
        Arc::clone(&key_def),
        key_def.opts.page_size,
        job.index.instance_uuid(),
    )?;

    let mut count = 0u64;
    while let Some(stmt) = wi.next()? {
        writer.write(&stmt)?;
        count += 1;
    }
    if count == 0 {
        writer.discard()?;
        return Ok(JobOutput::Dump(None));
    }
    let run = writer.finish(
        job.range.begin().map(<[u8]>::to_vec),
        job.range.end().map(<[u8]>::to_vec),
    )?;
    Ok(JobOutput::Dump(Some(run)))
}

fn execute_compact(job: &CompactJob) -> Result<JobOutput, SchedulerError> {
    let key_def = Arc::clone(job.index.key_def());
    let mut wi = WriteIterator::new(Arc::clone(&key_def), job.oldest_vlsn, true);
    for mem in &job.mems {
        wi.add_mem(Arc::clone(mem))?;
    }
    for run in &job.runs {
        wi.add_run(Arc::clone(run));
    }

    let max_lsn = job
        .mems
        .iter()
        .map(|m| m.max_lsn())
        .chain(job.runs.iter().map(|r| r.info().max_lsn))
        .max()
        .unwrap_or(0);

    let mut writers: Vec<Option<RunWriter>> = Vec::new();
    let mut counts: Vec<u64> = Vec::new();
    for (i, range) in job.new_ranges.iter().enumerate() {
        let writer = RunWriter::new(
            job.index.dir(),
            max_lsn,
            range.id,
            job.run_ids[i],
            job.index.space_id,
            job.index.index_id,
            Arc::clone(&key_def),
            key_def.opts.page_size,
            job.index.instance_uuid(),
        )?;
        writers.push(Some(writer));
        counts.push(0);
    }

    // The merged stream is key-ordered; route each statement to the
    // result range that owns its key.
    let mut target = 0usize;
    while let Some(stmt) = wi.next()? {
        let key = stmt
            .extract_key(&key_def)
            .map_err(|e| SchedulerError::Internal(e.to_string()))?;
        while target + 1 < job.new_ranges.len() {
            let next_begin = job.new_ranges[target + 1].begin();
            let crosses = match next_begin {
                Some(begin) => {
                    key_def
                        .compare_keys(&key, begin)
                        .map_err(RangeError::KeyDef)?
                        != std::cmp::Ordering::Less
                }
                None => false,
            };
            if crosses {
                target += 1;
            } else {
                break;
            }
        }
        if let Some(writer) = writers[target].as_mut() {
            writer.write(&stmt)?;
            counts[target] += 1;
        }
    }

    let mut outputs = Vec::new();
    for (i, writer) in writers.into_iter().enumerate() {
        let writer = writer.ok_or_else(|| SchedulerError::Internal("writer taken".into()))?;
        if counts[i] == 0 {
            writer.discard()?;
            outputs.push(None);
            continue;
        }
        let range = &job.new_ranges[i];
        let run = writer.finish(
            range.begin().map(<[u8]>::to_vec),
            range.end().map(<[u8]>::to_vec),
        )?;
        outputs.push(Some(run));
    }
    Ok(JobOutput::Compact(outputs))
}

// ------------------------------------------------------------------------------------------------
// Scheduler
// ------------------------------------------------------------------------------------------------

struct Shared {
    indexes: RwLock<Vec<Arc<LsmIndex>>>,
    quota: Arc<Quota>,
    tx_manager: Arc<TxManager>,
    /// LSN a pending checkpoint wants on disk; `i64::MIN` when none.
    checkpoint_lsn: AtomicI64,
    stop: AtomicBool,
    wakeup: (Mutex<bool>, Condvar),
    in_flight: AtomicU64,
    dump_count: AtomicU64,
    compact_count: AtomicU64,
}

impl Shared {
    fn wake(&self) {
        if let Ok(mut flagged) = self.wakeup.0.lock() {
            *flagged = true;
            self.wakeup.1.notify_all();
        }
    }
}

/// Handle to the background machinery: scheduler thread, worker pool,
/// and the upsert-squash worker.
pub struct Scheduler {
    shared: Arc<Shared>,
    scheduler_thread: Option<JoinHandle<()>>,
    worker_threads: Vec<JoinHandle<()>>,
    squash_thread: Option<JoinHandle<()>>,
    squash_tx: Sender<(Arc<LsmIndex>, Vec<u8>)>,
}

impl Scheduler {
    /// Starts the scheduler with `workers` dump/compaction threads.
    pub fn start(
        workers: usize,
        quota: Arc<Quota>,
        tx_manager: Arc<TxManager>,
    ) -> Scheduler {
        let shared = Arc::new(Shared {
            indexes: RwLock::new(Vec::new()),
            quota,
            tx_manager,
            checkpoint_lsn: AtomicI64::new(i64::MIN),
            stop: AtomicBool::new(false),
            wakeup: (Mutex::new(false), Condvar::new()),
            in_flight: AtomicU64::new(0),
            dump_count: AtomicU64::new(0),
            compact_count: AtomicU64::new(0),
        });

        let (job_tx, job_rx) = unbounded::<Job>();
        let (done_tx, done_rx) = unbounded::<JobResult>();

        let mut worker_threads = Vec::new();
        for worker_id in 0..workers.max(1) {
            let job_rx: Receiver<Job> = job_rx.clone();
            let done_tx = done_tx.clone();
            let shared_w = Arc::clone(&shared);
            worker_threads.push(
                std::thread::Builder::new()
                    .name(format!("vy.worker.{worker_id}"))
                    .spawn(move || {
                        while let Ok(job) = job_rx.recv() {
                            let started = Instant::now();
                            let output = match &job {
                                Job::Dump(dump) => execute_dump(dump),
                                Job::Compact(compact) => execute_compact(compact),
                            };
                            let result = JobResult {
                                job,
                                output,
                                elapsed: started.elapsed(),
                            };
                            if done_tx.send(result).is_err() {
                                break;
                            }
                            // Cross-thread wakeup for the main loop.
                            shared_w.wake();
                        }
                    })
                    .expect("spawning a worker thread"),
            );
        }

        let (squash_tx, squash_rx) = unbounded::<(Arc<LsmIndex>, Vec<u8>)>();
        let squash_thread = {
            let shared_s = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("vy.squash".into())
                .spawn(move || squash_loop(shared_s, squash_rx))
                .expect("spawning the squash thread")
        };

        let scheduler_thread = {
            let shared_s = Arc::clone(&shared);
            std::thread::Builder::new()
                .name("vy.scheduler".into())
                .spawn(move || scheduler_loop(shared_s, job_tx, done_rx))
                .expect("spawning the scheduler thread")
        };

        Scheduler {
            shared,
            scheduler_thread: Some(scheduler_thread),
            worker_threads,
            squash_thread: Some(squash_thread),
            squash_tx,
        }
    }

    /// Registers an index for background maintenance.
    pub fn register_index(&self, index: Arc<LsmIndex>) {
        if let Ok(mut indexes) = self.shared.indexes.write() {
            indexes.push(index);
        }
        self.shared.wake();
    }

    /// Unregisters a dropped index.
    pub fn unregister_index(&self, index: &Arc<LsmIndex>) {
        if let Ok(mut indexes) = self.shared.indexes.write() {
            indexes.retain(|i| !Arc::ptr_eq(i, index));
        }
    }

    /// Queues a key whose upsert chain crossed the squash threshold.
    pub fn enqueue_squash(&self, index: Arc<LsmIndex>, key: Vec<u8>) {
        let _ = self.squash_tx.send((index, key));
    }

    /// Asks the scheduler to move all memory at or below `lsn` to disk.
    pub fn begin_checkpoint(&self, lsn: i64) {
        self.shared.checkpoint_lsn.store(lsn, AtomicOrdering::Release);
        self.shared.wake();
    }

    /// Whether every registered range has dumped its memory at or
    /// below `lsn`.
    pub fn is_dumped_to(&self, lsn: i64) -> bool {
        let Ok(indexes) = self.shared.indexes.read() else {
            return false;
        };
        indexes
            .iter()
            .flat_map(|index| index.ranges())
            .all(|range| range.mem_min_lsn() > lsn)
    }

    /// Blocks until [`Scheduler::is_dumped_to`] holds or the timeout
    /// expires. Returns whether the checkpoint target was reached.
    pub fn wait_checkpoint(&self, lsn: i64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_dumped_to(lsn) {
                self.shared
                    .checkpoint_lsn
                    .store(i64::MIN, AtomicOrdering::Release);
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    /// Completed dump and compaction counts.
    pub fn stats(&self) -> (u64, u64) {
        (
            self.shared.dump_count.load(AtomicOrdering::Acquire),
            self.shared.compact_count.load(AtomicOrdering::Acquire),
        )
    }

    /// Stops all background threads, draining in-flight work.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, AtomicOrdering::Release);
        self.shared.wake();
        if let Some(handle) = self.scheduler_thread.take() {
            let _ = handle.join();
        }
        // The scheduler dropped the job sender; workers drain and exit.
        for handle in self.worker_threads.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = self.squash_thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

// ------------------------------------------------------------------------------------------------
// Scheduler loop
// ------------------------------------------------------------------------------------------------

fn scheduler_loop(shared: Arc<Shared>, job_tx: Sender<Job>, done_rx: Receiver<JobResult>) {
    let mut backoff: Option<Duration> = None;
    let mut last_watermark = Instant::now();

    loop {
        // Drain completed tasks first.
        let mut failed = false;
        while let Ok(result) = done_rx.try_recv() {
            shared.in_flight.fetch_sub(1, AtomicOrdering::AcqRel);
            match complete_job(&shared, result) {
                Ok(()) => backoff = None,
                Err(e) => {
                    failed = true;
                    error!(error = %e, "background task failed");
                    diag_set(BoxError::new(ErrorCode::System, e.to_string()));
                }
            }
        }
        if failed {
            backoff = Some(
                backoff
                    .map(|b| (b * 2).min(BACKOFF_MAX))
                    .unwrap_or(BACKOFF_MIN),
            );
            warn!(backoff = ?backoff, "scheduler backing off after failure");
        }

        if shared.stop.load(AtomicOrdering::Acquire) {
            if shared.in_flight.load(AtomicOrdering::Acquire) == 0 {
                break;
            }
        } else if backoff.is_none() {
            if last_watermark.elapsed() >= WATERMARK_PERIOD {
                shared.quota.recompute_watermark();
                last_watermark = Instant::now();
            }
            match schedule_one(&shared) {
                Ok(Some(job)) => {
                    shared.in_flight.fetch_add(1, AtomicOrdering::AcqRel);
                    if job_tx.send(job).is_err() {
                        break;
                    }
                    continue; // maybe more work is ready
                }
                Ok(None) => {}
                Err(e) => {
                    error!(error = %e, "scheduling failed");
                    backoff = Some(BACKOFF_MIN);
                }
            }
        }

        // Nothing to do: sleep until woken or the back-off elapses.
        let wait = backoff.unwrap_or(IDLE_WAIT);
        if let Ok(mut flagged) = shared.wakeup.0.lock() {
            if !*flagged {
                let (guard, _) = shared
                    .wakeup
                    .1
                    .wait_timeout(flagged, wait)
                    .unwrap_or_else(|e| e.into_inner());
                flagged = guard;
            }
            *flagged = false;
            if backoff.is_some() {
                // The back-off window has been served (or a wakeup cut
                // it short on shutdown).
                backoff = None;
            }
        }
    }
    info!("scheduler stopped");
}

/// Picks at most one task: dumps take priority over compactions.
fn schedule_one(shared: &Arc<Shared>) -> Result<Option<Job>, SchedulerError> {
    let indexes = shared
        .indexes
        .read()
        .map_err(|_| SchedulerError::Internal("RwLock poisoned".into()))?
        .clone();

    let checkpoint_lsn = shared.checkpoint_lsn.load(AtomicOrdering::Acquire);
    let quota_exceeded = shared.quota.exceeded();

    // Dump order: lowest in-memory LSN first.
    let mut dump_head: Option<(i64, Arc<LsmIndex>, Arc<VyRange>)> = None;
    for index in &indexes {
        for range in index.ranges() {
            if range.is_busy() {
                continue;
            }
            let min_lsn = range.mem_min_lsn();
            if min_lsn == i64::MAX {
                continue;
            }
            if dump_head.as_ref().is_none_or(|(best, _, _)| min_lsn < *best) {
                dump_head = Some((min_lsn, Arc::clone(index), range));
            }
        }
    }
    if let Some((min_lsn, index, range)) = dump_head
        && (quota_exceeded || (checkpoint_lsn != i64::MIN && min_lsn <= checkpoint_lsn))
    {
        return Ok(Some(prepare_dump(shared, index, range)?));
    }

    // Compaction order: most runs first.
    let mut compact_head: Option<(usize, Arc<LsmIndex>, Arc<VyRange>)> = None;
    for index in &indexes {
        let compact_wm = index.key_def().opts.compact_wm.max(2) as usize;
        for range in index.ranges() {
            if range.is_busy() {
                continue;
            }
            let runs = range.run_count();
            if runs < compact_wm {
                continue;
            }
            if compact_head.as_ref().is_none_or(|(best, _, _)| runs > *best) {
                compact_head = Some((runs, Arc::clone(index), range));
            }
        }
    }
    if let Some((_, index, range)) = compact_head {
        return Ok(Some(prepare_compact(shared, index, range)?));
    }

    Ok(None)
}

fn prepare_dump(
    shared: &Arc<Shared>,
    index: Arc<LsmIndex>,
    range: Arc<VyRange>,
) -> Result<Job, SchedulerError> {
    if !range.begin_dump()? {
        return Err(SchedulerError::Internal("range became busy".into()));
    }
    // Fresh writes must land in a new mem while the old ones dump.
    range.freeze_mem()?;
    let mems = range.frozen_mems()?;
    if mems.is_empty() {
        range.abort_dump()?;
        return Err(SchedulerError::Internal("nothing to dump".into()));
    }
    let mem_bytes: u64 = mems.iter().map(|m| m.used() as u64).sum();
    let run_id = index.alloc_run_id();
    let oldest_vlsn = shared.tx_manager.min_vlsn();
    debug!(
        space_id = index.space_id,
        index_id = index.index_id,
        range_id = range.id,
        mems = mems.len(),
        bytes = mem_bytes,
        "dump scheduled"
    );
    Ok(Job::Dump(DumpJob {
        index,
        range,
        mems,
        oldest_vlsn,
        run_id,
        mem_bytes,
    }))
}

fn prepare_compact(
    shared: &Arc<Shared>,
    index: Arc<LsmIndex>,
    range: Arc<VyRange>,
) -> Result<Job, SchedulerError> {
    if !range.begin_compact()? {
        return Err(SchedulerError::Internal("range became busy".into()));
    }
    range.freeze_mem()?;
    let mems = range.frozen_mems()?;
    let runs = range.runs()?;
    let mem_bytes: u64 = mems.iter().map(|m| m.used() as u64).sum();

    let split_key = range.needs_split()?;
    let key_def = Arc::clone(index.key_def());
    let new_ranges = match &split_key {
        Some(split) => vec![
            VyRange::new(
                index.alloc_range_id(),
                range.begin().map(<[u8]>::to_vec),
                Some(split.clone()),
                Arc::clone(&key_def),
            ),
            VyRange::new(
                index.alloc_range_id(),
                Some(split.clone()),
                range.end().map(<[u8]>::to_vec),
                Arc::clone(&key_def),
            ),
        ],
        None => vec![VyRange::new(
            index.alloc_range_id(),
            range.begin().map(<[u8]>::to_vec),
            range.end().map(<[u8]>::to_vec),
            Arc::clone(&key_def),
        )],
    };
    for new_range in &new_ranges {
        new_range.set_compact_count(range.compact_count() + 1)?;
        new_range.set_shadow(Some(Arc::clone(&range)))?;
    }
    range.set_new_range_ids(new_ranges.iter().map(|r| r.id).collect())?;

    // Publish the result ranges now: fresh writes go to their active
    // mems while readers keep seeing history through the shadow.
    index.replace_range(&range, new_ranges.clone())?;

    let run_ids = new_ranges.iter().map(|_| index.alloc_run_id()).collect();
    let oldest_vlsn = shared.tx_manager.min_vlsn();
    info!(
        space_id = index.space_id,
        index_id = index.index_id,
        range_id = range.id,
        runs = runs.len(),
        split = split_key.is_some(),
        "compaction scheduled"
    );
    Ok(Job::Compact(CompactJob {
        index,
        old_range: range,
        new_ranges,
        mems,
        runs,
        oldest_vlsn,
        run_ids,
        mem_bytes,
    }))
}

fn complete_job(shared: &Arc<Shared>, result: JobResult) -> Result<(), SchedulerError> {
    match (result.job, result.output) {
        (Job::Dump(job), Ok(JobOutput::Dump(run))) => {
            job.range.complete_dump(&job.mems, run)?;
            shared.quota.release(job.mem_bytes);
            shared.quota.observe_dump(job.mem_bytes, result.elapsed);
            shared.dump_count.fetch_add(1, AtomicOrdering::AcqRel);
            debug!(range_id = job.range.id, elapsed = ?result.elapsed, "dump complete");
            Ok(())
        }
        (Job::Dump(job), Err(e)) => {
            // Keep the mems linked; the range stays re-schedulable.
            job.range.abort_dump()?;
            Err(e)
        }
        (Job::Compact(job), Ok(JobOutput::Compact(outputs))) => {
            for (i, run) in outputs.into_iter().enumerate() {
                let new_range = &job.new_ranges[i];
                if let Some(run) = run {
                    new_range.add_run(run)?;
                }
                new_range.set_shadow(None)?;
            }
            // The old range's runs are superseded; unlink their files.
            for run in &job.runs {
                if let Err(e) = run.unlink() {
                    warn!(run_id = run.id, error = %e, "failed to unlink compacted run");
                }
            }
            shared.quota.release(job.mem_bytes);
            shared.compact_count.fetch_add(1, AtomicOrdering::AcqRel);
            info!(
                old_range = job.old_range.id,
                results = job.new_ranges.len(),
                elapsed = ?result.elapsed,
                "compaction complete"
            );
            Ok(())
        }
        (Job::Compact(job), Err(e)) => {
            // Fold in-flight writes from the result ranges back into
            // the old range, then restore the old cover.
            for new_range in &job.new_ranges {
                for stmt in new_range.active_statements()? {
                    job.old_range.set(stmt)?;
                }
                new_range.set_shadow(None)?;
            }
            job.index
                .replace_span(&job.new_ranges, vec![Arc::clone(&job.old_range)])?;
            job.old_range.abort_compact()?;
            Err(e)
        }
        _ => Err(SchedulerError::Internal(
            "mismatched job/output pairing".into(),
        )),
    }
}

// ------------------------------------------------------------------------------------------------
// Squash worker
// ------------------------------------------------------------------------------------------------

fn squash_loop(shared: Arc<Shared>, rx: Receiver<(Arc<LsmIndex>, Vec<u8>)>) {
    loop {
        let Ok((index, key)) =
            rx.recv_timeout(Duration::from_millis(200))
        else {
            if shared.stop.load(AtomicOrdering::Acquire) {
                break;
            }
            continue;
        };
        if let Err(e) = squash_key(&index, &key) {
            warn!(error = %e, "upsert squash failed");
        }
    }
    info!("squash worker stopped");
}

/// Materializes the newest visible version of `key` as a REPLACE and
/// re-inserts it over the top of the upsert chain, clearing the
/// pending counter.
fn squash_key(index: &Arc<LsmIndex>, key: &[u8]) -> Result<(), SchedulerError> {
    let mut reader = ReadIterator::new(Arc::clone(index), IteratorType::Eq, key, i64::MAX, None);
    let materialized = reader.next()?;
    reader.close();
    let Some(stmt) = materialized else {
        return Ok(()); // chain ended in a DELETE, nothing to pin
    };
    let range = index.find_range(key)?;
    range.set(stmt)?;
    debug!(
        space_id = index.space_id,
        index_id = index.index_id,
        "upsert chain squashed"
    );
    Ok(())
}
