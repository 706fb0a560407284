use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use clap::{Args, ValueEnum};
use pickaxe_core::MiningEngine;
use pickaxe_stratum::{ProtocolVersion, TcpConnector};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{load_config, resolve, Overrides};
use crate::utils::banner;

/// Mine against a pool until interrupted
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Pool URL (stratum+tcp://host:port or stratum2+tcp://host:port)
    #[arg(short = 'o', long, env = "PICKAXE_URL")]
    pub url: Option<String>,

    /// Pool user, usually wallet.worker
    #[arg(short = 'u', long, env = "PICKAXE_USER")]
    pub user: Option<String>,

    /// Pool password
    #[arg(short, long)]
    pub password: Option<String>,

    /// Search threads, 0 for one per CPU
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Force a protocol instead of inferring it from the URL
    #[arg(long, value_enum)]
    pub protocol: Option<ProtocolArg>,

    /// Validate the configuration and exit
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum ProtocolArg {
    V1,
    V2,
}

impl From<ProtocolArg> for ProtocolVersion {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::V1 => ProtocolVersion::V1,
            ProtocolArg::V2 => ProtocolVersion::V2,
        }
    }
}

impl RunArgs {
    fn overrides(&self) -> Overrides {
        Overrides {
            url: self.url.clone(),
            user: self.user.clone(),
            password: self.password.clone(),
            protocol: self.protocol.map(Into::into),
            threads: self.threads,
        }
    }
}

pub async fn execute(args: RunArgs, config_path: Option<&Path>) -> Result<()> {
    let file = load_config(config_path)?;
    let settings = resolve(file, &args.overrides())?;

    let mut engine =
        MiningEngine::new(settings.miner).context("Invalid mining configuration")?;
    let pool = &engine.config().stratum.pool;
    banner::show_run_summary(
        &pool.url,
        &pool.username,
        &format!("{:?}", pool.protocol_version()),
        engine.threads(),
    );

    if args.dry_run {
        println!("Configuration validated successfully");
        return Ok(());
    }

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, shutting down");
                interrupt.cancel();
            }
            Err(e) => error!(error = %e, "Unable to listen for ctrl-c"),
        }
    });

    engine.start()?;
    let result = mine(&mut engine, settings.retry.backoff(), &cancel).await;
    engine.stop();

    banner::show_final_stats(&engine.stats());
    result
}

/// Run sessions back to back until cancelled.
///
/// A session that delivered at least one job resets the backoff; only
/// configuration errors end the loop early.
async fn mine<B: Backoff>(
    engine: &mut MiningEngine,
    mut backoff: B,
    cancel: &CancellationToken,
) -> Result<()> {
    let connector = TcpConnector::new(engine.config().stratum.connection_timeout);

    while !cancel.is_cancelled() {
        let jobs_before = engine.stats().jobs_received;

        match engine.run_session(&connector, cancel).await {
            Ok(()) => info!("Session closed"),
            Err(e) if !e.is_retryable() => return Err(e.into()),
            Err(e) => warn!(error = %e, "Session ended"),
        }

        if cancel.is_cancelled() {
            break;
        }
        if engine.stats().jobs_received > jobs_before {
            backoff.reset();
        }

        let Some(delay) = backoff.next_backoff() else {
            anyhow::bail!("Reconnect attempts exhausted");
        };
        info!(delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    Ok(())
}
