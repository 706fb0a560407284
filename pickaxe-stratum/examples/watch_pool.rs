//! Connect to a pool, complete the handshake and log every job it sends.
//!
//! No hashing happens here; this is a quick way to check that a pool URL,
//! credentials and protocol version work together.
//!
//! ```text
//! cargo run -p pickaxe-stratum --example watch_pool -- stratum+tcp://pool.example.com:3333 wallet.worker
//! ```

use pickaxe_stratum::{drive, Job, JobSink, PoolConfig, Session, StratumConfig, TcpConnector};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Default)]
struct LogSink {
    generation: AtomicU64,
}

impl JobSink for LogSink {
    fn publish(&self, job: Job) {
        self.generation.store(job.generation, Ordering::Release);
        info!(
            job_id = %job.id,
            generation = job.generation,
            target = %job.target,
            future = job.future,
            "New job"
        );
    }

    fn retract(&self, generation: u64) {
        self.generation.store(generation, Ordering::Release);
        info!(generation, "Job retracted");
    }

    fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("pickaxe_stratum=debug,watch_pool=info")
        .init();

    let mut args = std::env::args().skip(1);
    let url = args.next().ok_or("usage: watch_pool <url> <user>")?;
    let username = args.next().ok_or("usage: watch_pool <url> <user>")?;

    let config = StratumConfig::new(PoolConfig {
        url,
        username,
        password: "x".to_string(),
        protocol: None,
    });
    config.validate()?;

    let connector = TcpConnector::new(config.connection_timeout);
    let mut session = Session::new(config, Arc::new(LogSink::default()));

    // Nothing is ever submitted
    let (_shares_tx, mut shares) = mpsc::channel(1);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    drive(&mut session, &connector, &mut shares, &cancel, |event| {
        info!(?event, "Session event");
    })
    .await?;

    info!(stats = ?session.stats(), "Done");
    Ok(())
}
