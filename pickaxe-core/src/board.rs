//! Shared slot holding the job workers search

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use pickaxe_stratum::{Job, JobSink};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// Current job plus its generation.
///
/// One writer (the session), many readers (workers). Readers never take a
/// lock: `current` is an `ArcSwap` load and `current_generation` a single
/// atomic load. The mutex/condvar pair only parks idle workers.
#[derive(Debug, Default)]
pub struct JobBoard {
    slot: ArcSwapOption<Job>,
    generation: AtomicU64,
    idle: Mutex<()>,
    changed: Condvar,
}

impl JobBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current job.
    ///
    /// Generations must strictly increase; a job that does not advance the
    /// generation is dropped.
    pub fn publish(&self, job: Job) {
        let generation = job.generation;
        let current = self.current_generation();
        if generation <= current {
            warn!(generation, current, job_id = %job.id, "Ignoring job that does not advance the generation");
            return;
        }

        // Slot first: a reader that sees the new generation also finds the new job
        self.slot.store(Some(Arc::new(job)));
        self.generation.store(generation, Ordering::Release);
        debug!(generation, "Job published to board");
        self.wake_all();
    }

    /// Drop the current job; workers go idle
    pub fn retract(&self, generation: u64) {
        let current = self.current_generation();
        if generation <= current {
            warn!(generation, current, "Ignoring retract that does not advance the generation");
            return;
        }

        self.slot.store(None);
        self.generation.store(generation, Ordering::Release);
        debug!(generation, "Job retracted from board");
        self.wake_all();
    }

    /// Snapshot of the current job
    pub fn current(&self) -> Option<Arc<Job>> {
        self.slot.load_full()
    }

    #[inline]
    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Park until the generation moves past `seen` or `timeout` elapses.
    ///
    /// Returns the generation observed on wake-up.
    pub fn wait_for_change(&self, seen: u64, timeout: Duration) -> u64 {
        let mut guard = self.idle.lock();
        if self.current_generation() == seen {
            self.changed.wait_for(&mut guard, timeout);
        }
        self.current_generation()
    }

    /// Wake every parked worker
    pub fn wake_all(&self) {
        // Taking the lock orders the wake-up after any waiter's generation check
        let _guard = self.idle.lock();
        self.changed.notify_all();
    }
}

impl JobSink for JobBoard {
    fn publish(&self, job: Job) {
        JobBoard::publish(self, job)
    }

    fn retract(&self, generation: u64) {
        JobBoard::retract(self, generation)
    }

    fn current_generation(&self) -> u64 {
        JobBoard::current_generation(self)
    }
}
