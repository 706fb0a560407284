//! CPU search threads.
//!
//! Each worker owns a fixed slice of the nonce space and re-scans it for
//! every new job. Cancellation is cooperative: the stop flag and the board
//! generation are polled every `check_interval` hashes.

use crate::{board::JobBoard, error::EngineError};
use pickaxe_hash::{double_sha256, meets_target, HeaderTemplate};
use pickaxe_stratum::{Job, ShareCandidate};
use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Size of the 32-bit nonce space
pub const NONCE_SPACE: u64 = 1 << 32;

/// Hands shares from workers to the session without blocking
pub trait ShareSink: Send + Sync {
    /// Returns false when the share had to be dropped
    fn offer(&self, share: ShareCandidate) -> bool;
}

impl ShareSink for mpsc::Sender<ShareCandidate> {
    fn offer(&self, share: ShareCandidate) -> bool {
        match self.try_send(share) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(share)) => {
                warn!(job_id = %share.job_id, "Share queue full, dropping share");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Worker pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of search threads, 0 for one per CPU
    #[serde(default)]
    pub threads: usize,

    /// Hashes between generation/stop checks
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Longest idle wait before re-checking the board
    #[serde(default = "default_idle_poll")]
    pub idle_poll: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            check_interval: default_check_interval(),
            idle_poll: default_idle_poll(),
        }
    }
}

fn default_check_interval() -> u64 { 4096 }
fn default_idle_poll() -> Duration { Duration::from_millis(100) }

/// Resolve a configured thread count, 0 meaning one per CPU
pub fn resolve_thread_count(requested: usize) -> usize {
    if requested == 0 {
        num_cpus::get().max(1)
    } else {
        requested
    }
}

/// Counters shared by all workers
#[derive(Debug, Default)]
pub struct PoolStats {
    hashes: AtomicU64,
    shares_found: AtomicU64,
    shares_dropped: AtomicU64,
    jobs_abandoned: AtomicU64,
    ranges_exhausted: AtomicU64,
}

/// Point-in-time copy of [`PoolStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatsSnapshot {
    pub hashes: u64,
    pub shares_found: u64,
    pub shares_dropped: u64,
    pub jobs_abandoned: u64,
    pub ranges_exhausted: u64,
}

impl PoolStats {
    pub fn snapshot(&self) -> PoolStatsSnapshot {
        PoolStatsSnapshot {
            hashes: self.hashes.load(Ordering::Relaxed),
            shares_found: self.shares_found.load(Ordering::Relaxed),
            shares_dropped: self.shares_dropped.load(Ordering::Relaxed),
            jobs_abandoned: self.jobs_abandoned.load(Ordering::Relaxed),
            ranges_exhausted: self.ranges_exhausted.load(Ordering::Relaxed),
        }
    }
}

/// Half-open slice `[start, end)` of the nonce space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NonceRange {
    pub start: u64,
    pub end: u64,
}

impl NonceRange {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn contains(&self, nonce: u64) -> bool {
        nonce >= self.start && nonce < self.end
    }
}

/// Slice of the nonce space searched by worker `index` of `workers`.
///
/// Every worker gets `floor(2^32 / workers)` nonces; the last one also
/// takes the remainder so the slices cover the space exactly.
pub fn nonce_range(index: usize, workers: usize) -> NonceRange {
    let workers = workers.max(1) as u64;
    let index = index as u64;
    let step = NONCE_SPACE / workers;
    let start = index * step;
    let end = if index + 1 >= workers { NONCE_SPACE } else { start + step };
    NonceRange { start, end }
}

/// Why a scan returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanOutcome {
    /// Every nonce in the range was tried
    Exhausted,
    /// A newer generation appeared on the board
    Superseded,
    /// The stop flag was raised
    Stopped,
}

/// Search `range` of `job`, offering every hit to `sink`.
///
/// The stop flag and the board generation are checked before the first
/// hash and then every `check_interval` hashes, which bounds how long a
/// superseded job keeps being searched.
pub fn scan(
    job: &Job,
    range: NonceRange,
    board: &JobBoard,
    stop: &AtomicBool,
    sink: &dyn ShareSink,
    stats: &PoolStats,
    check_interval: u64,
) -> ScanOutcome {
    let check_interval = check_interval.max(1);
    let mut header = job.header.to_bytes();
    let mut until_check = 0u64;
    let mut hashed = 0u64;
    let mut nonce = range.start;

    let outcome = loop {
        if until_check == 0 {
            stats.hashes.fetch_add(hashed, Ordering::Relaxed);
            hashed = 0;
            if stop.load(Ordering::Relaxed) {
                break ScanOutcome::Stopped;
            }
            if board.current_generation() > job.generation {
                break ScanOutcome::Superseded;
            }
            until_check = check_interval;
        }
        if nonce >= range.end {
            break ScanOutcome::Exhausted;
        }

        let n = nonce as u32;
        HeaderTemplate::write_nonce(&mut header, n);
        let hash = double_sha256(&header);
        if meets_target(&hash, &job.target) {
            stats.shares_found.fetch_add(1, Ordering::Relaxed);
            if !sink.offer(job.candidate(n)) {
                stats.shares_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }

        nonce += 1;
        hashed += 1;
        until_check -= 1;
    };

    stats.hashes.fetch_add(hashed, Ordering::Relaxed);
    outcome
}

struct WorkerContext {
    board: Arc<JobBoard>,
    sink: Arc<dyn ShareSink>,
    stats: Arc<PoolStats>,
    stop: Arc<AtomicBool>,
    check_interval: u64,
    idle_poll: Duration,
}

fn run_worker(index: usize, workers: usize, ctx: Arc<WorkerContext>) {
    let range = nonce_range(index, workers);
    let mut finished = 0u64;
    debug!(worker = index, start = range.start, end = range.end, "Worker started");

    while !ctx.stop.load(Ordering::Relaxed) {
        let seen = ctx.board.current_generation();
        let job = match ctx.board.current() {
            Some(job) if job.generation > finished => job,
            _ => {
                ctx.board.wait_for_change(seen, ctx.idle_poll);
                continue;
            }
        };

        trace!(worker = index, generation = job.generation, job_id = %job.id, "Scanning");
        match scan(
            &job,
            range,
            &ctx.board,
            &ctx.stop,
            ctx.sink.as_ref(),
            &ctx.stats,
            ctx.check_interval,
        ) {
            ScanOutcome::Exhausted => {
                debug!(worker = index, generation = job.generation, "Nonce range exhausted");
                ctx.stats.ranges_exhausted.fetch_add(1, Ordering::Relaxed);
                finished = job.generation;
            }
            ScanOutcome::Superseded => {
                trace!(worker = index, generation = job.generation, "Job superseded");
                ctx.stats.jobs_abandoned.fetch_add(1, Ordering::Relaxed);
            }
            ScanOutcome::Stopped => break,
        }
    }

    debug!(worker = index, "Worker stopped");
}

/// Fixed set of search threads reading one [`JobBoard`]
pub struct WorkerPool {
    threads: usize,
    ctx: Arc<WorkerContext>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(config: &WorkerConfig, board: Arc<JobBoard>, sink: Arc<dyn ShareSink>) -> Self {
        Self {
            threads: resolve_thread_count(config.threads),
            ctx: Arc::new(WorkerContext {
                board,
                sink,
                stats: Arc::new(PoolStats::default()),
                stop: Arc::new(AtomicBool::new(false)),
                check_interval: config.check_interval.max(1),
                idle_poll: config.idle_poll,
            }),
            handles: Vec::new(),
        }
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_running(&self) -> bool {
        !self.handles.is_empty()
    }

    pub fn stats(&self) -> PoolStatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Spawn the worker threads
    pub fn start(&mut self) -> Result<(), EngineError> {
        if self.is_running() {
            return Err(EngineError::AlreadyRunning);
        }
        self.ctx.stop.store(false, Ordering::Relaxed);

        for index in 0..self.threads {
            let ctx = self.ctx.clone();
            let workers = self.threads;
            let spawned = thread::Builder::new()
                .name(format!("pickaxe-worker-{}", index))
                .spawn(move || run_worker(index, workers, ctx));
            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(e) => {
                    self.stop();
                    return Err(EngineError::Spawn(e));
                }
            }
        }

        info!(threads = self.threads, "Worker pool started");
        Ok(())
    }

    /// Raise the stop flag, wake idle workers and join them all
    pub fn stop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.ctx.stop.store(true, Ordering::Relaxed);
        self.ctx.board.wake_all();

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!("Worker thread panicked");
            }
        }
        info!("Worker pool stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
