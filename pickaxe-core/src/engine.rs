//! Mining engine: runs pool sessions and feeds the worker pool

use crate::{
    board::JobBoard,
    error::{EngineError, Result},
    worker::{PoolStatsSnapshot, WorkerConfig, WorkerPool},
};
use parking_lot::RwLock;
use pickaxe_stratum::{
    drive, CommitmentSource, Connector, Session, SessionEvent, SessionState, ShareCandidate,
    StratumConfig, ZeroCommitment,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Miner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Stratum configuration
    pub stratum: StratumConfig,

    /// Number of search threads, 0 for one per CPU
    #[serde(default)]
    pub workers: usize,

    /// Hashes between generation/stop checks
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,

    /// Longest idle wait before a worker re-checks the board
    #[serde(default = "default_idle_poll")]
    pub idle_poll: Duration,

    /// Shares buffered between workers and the session
    #[serde(default = "default_share_queue")]
    pub share_queue: usize,
}

impl MinerConfig {
    pub fn new(stratum: StratumConfig) -> Self {
        Self {
            stratum,
            workers: 0,
            check_interval: default_check_interval(),
            idle_poll: default_idle_poll(),
            share_queue: default_share_queue(),
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            threads: self.workers,
            check_interval: self.check_interval,
            idle_poll: self.idle_poll,
        }
    }
}

fn default_check_interval() -> u64 { WorkerConfig::default().check_interval }
fn default_idle_poll() -> Duration { WorkerConfig::default().idle_poll }
fn default_share_queue() -> usize { 256 }

/// Engine-wide counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct MinerStats {
    pub state: Option<SessionState>,
    pub sessions: u64,
    pub jobs_received: u64,
    pub shares_submitted: u64,
    pub shares_accepted: u64,
    pub shares_rejected: u64,
    pub shares_stale: u64,
    pub diagnostics: u64,
    pub pool: PoolStatsSnapshot,
    pub uptime: Duration,
}

impl MinerStats {
    fn record(&mut self, event: &SessionEvent) {
        match event {
            SessionEvent::StateChanged(state) => self.state = Some(*state),
            SessionEvent::JobPublished { .. } => self.jobs_received += 1,
            SessionEvent::ShareSubmitted { .. } => self.shares_submitted += 1,
            SessionEvent::ShareAccepted { .. } => self.shares_accepted += 1,
            SessionEvent::ShareRejected { .. } => self.shares_rejected += 1,
            SessionEvent::ShareStale { .. } => self.shares_stale += 1,
            SessionEvent::Diagnostic(_) => self.diagnostics += 1,
            _ => {}
        }
    }

    /// Average hashes per second since the engine was created
    pub fn hashrate(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.pool.hashes as f64 / secs
        } else {
            0.0
        }
    }

    /// Accepted share ratio in percent
    pub fn acceptance_rate(&self) -> f64 {
        let answered = self.shares_accepted + self.shares_rejected;
        if answered == 0 {
            0.0
        } else {
            self.shares_accepted as f64 * 100.0 / answered as f64
        }
    }
}

/// Composition root: one board, one worker pool, one session at a time
pub struct MiningEngine {
    config: MinerConfig,
    board: Arc<JobBoard>,
    pool: WorkerPool,
    shares: mpsc::Receiver<ShareCandidate>,
    commitment: Arc<dyn CommitmentSource>,
    stats: Arc<RwLock<MinerStats>>,
    created: Instant,
}

impl MiningEngine {
    pub fn new(config: MinerConfig) -> Result<Self> {
        config
            .stratum
            .validate()
            .map_err(EngineError::InvalidConfiguration)?;

        let board = Arc::new(JobBoard::new());
        let (share_tx, shares) = mpsc::channel(config.share_queue.max(1));
        let pool = WorkerPool::new(&config.worker_config(), board.clone(), Arc::new(share_tx));

        Ok(Self {
            config,
            board,
            pool,
            shares,
            commitment: Arc::new(ZeroCommitment),
            stats: Arc::new(RwLock::new(MinerStats::default())),
            created: Instant::now(),
        })
    }

    /// Use `source` for the commitment root of text-protocol jobs
    pub fn with_commitment_source(mut self, source: Arc<dyn CommitmentSource>) -> Self {
        self.commitment = source;
        self
    }

    pub fn config(&self) -> &MinerConfig {
        &self.config
    }

    pub fn board(&self) -> &Arc<JobBoard> {
        &self.board
    }

    pub fn threads(&self) -> usize {
        self.pool.threads()
    }

    /// Start the worker threads; they idle until a job is published
    pub fn start(&mut self) -> Result<()> {
        info!(
            pool = %self.config.stratum.pool.url,
            threads = self.pool.threads(),
            "Starting mining engine"
        );
        self.pool.start()
    }

    /// Run one session lifetime against `connector`.
    ///
    /// Workers keep running across sessions; between them they idle because
    /// the closing session retracts its job.
    pub async fn run_session<C: Connector>(
        &mut self,
        connector: &C,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut session = Session::new(self.config.stratum.clone(), self.board.clone())
            .with_commitment_source(self.commitment.clone());
        self.stats.write().sessions += 1;

        let stats = self.stats.clone();
        let result = drive(&mut session, connector, &mut self.shares, cancel, |event| {
            stats.write().record(event)
        })
        .await;

        let totals = session.stats();
        info!(
            jobs = totals.jobs_received,
            submitted = totals.shares_submitted,
            accepted = totals.shares_accepted,
            rejected = totals.shares_rejected,
            stale = totals.shares_stale,
            "Session ended"
        );
        if let Err(e) = &result {
            warn!(error = %e, "Session failed");
        }
        result.map_err(EngineError::from)
    }

    /// Stop and join the worker threads
    pub fn stop(&mut self) {
        self.pool.stop();
    }

    pub fn stats(&self) -> MinerStats {
        let mut stats = self.stats.read().clone();
        stats.pool = self.pool.stats();
        stats.uptime = self.created.elapsed();
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pickaxe_stratum::{JobId, PoolConfig};

    fn config() -> MinerConfig {
        MinerConfig::new(StratumConfig::new(PoolConfig {
            url: "stratum2+tcp://127.0.0.1:34254".to_string(),
            username: "wallet.worker".to_string(),
            password: "x".to_string(),
            protocol: None,
        }))
    }

    #[test]
    fn test_invalid_pool_url_is_rejected() {
        let mut bad = config();
        bad.stratum.pool.url = "no-port".to_string();
        assert!(matches!(
            MiningEngine::new(bad),
            Err(EngineError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_stats_record_events() {
        let mut stats = MinerStats::default();
        stats.record(&SessionEvent::StateChanged(SessionState::Mining));
        stats.record(&SessionEvent::ShareAccepted { job_id: JobId::Numeric(1) });
        stats.record(&SessionEvent::ShareAccepted { job_id: JobId::Numeric(1) });
        stats.record(&SessionEvent::ShareRejected {
            job_id: JobId::Numeric(1),
            reason: "low difficulty".into(),
        });
        stats.record(&SessionEvent::ShareAccepted { job_id: JobId::Numeric(1) });

        assert_eq!(stats.state, Some(SessionState::Mining));
        assert_eq!(stats.shares_accepted, 3);
        assert_eq!(stats.acceptance_rate(), 75.0);
    }

    #[test]
    fn test_start_and_stop_idle_engine() {
        let mut miner = config();
        miner.workers = 2;
        let mut engine = MiningEngine::new(miner).unwrap();
        engine.start().unwrap();
        assert!(matches!(engine.start(), Err(EngineError::AlreadyRunning)));
        engine.stop();
        assert_eq!(engine.stats().pool.hashes, 0);
    }
}
