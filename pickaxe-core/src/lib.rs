//! Pickaxe mining core
//!
//! - [`JobBoard`]: lock-free current-job slot with a generation counter
//! - [`WorkerPool`]: CPU threads scanning disjoint nonce ranges
//! - [`MiningEngine`]: wires a Stratum session to the board and the workers

pub mod board;
pub mod engine;
pub mod error;
pub mod worker;

// Re-export main types
pub use board::JobBoard;
pub use engine::{MinerConfig, MinerStats, MiningEngine};
pub use error::{EngineError, Result};
pub use worker::{
    nonce_range, resolve_thread_count, scan, NonceRange, PoolStats, PoolStatsSnapshot, ScanOutcome,
    ShareSink, WorkerConfig, WorkerPool, NONCE_SPACE,
};
