//! Pickaxe Stratum protocol client
//!
//! Speaks both Stratum wire formats to a mining pool:
//!
//! - V1: line-delimited JSON-RPC (`stratum+tcp://`)
//! - V2: fixed-header binary frames (`stratum2+tcp://`)
//!
//! [`Session`] is a sans-IO state machine that turns received bytes into
//! [`Job`]s for a [`JobSink`] and [`ShareCandidate`]s into outgoing frames.
//! [`drive`] runs a session over any [`Connector`], normally TCP.
//!
//! # Example
//!
//! ```no_run
//! use pickaxe_stratum::{drive, Job, JobSink, PoolConfig, Session, StratumConfig, TcpConnector};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! struct PrintSink;
//!
//! impl JobSink for PrintSink {
//!     fn publish(&self, job: Job) {
//!         println!("job {} generation {}", job.id, job.generation);
//!     }
//!     fn retract(&self, _generation: u64) {}
//!     fn current_generation(&self) -> u64 { 0 }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = StratumConfig::new(PoolConfig {
//!         url: "stratum+tcp://pool.example.com:3333".to_string(),
//!         username: "wallet.worker".to_string(),
//!         password: "x".to_string(),
//!         protocol: None,
//!     });
//!
//!     let connector = TcpConnector::new(config.connection_timeout);
//!     let mut session = Session::new(config, Arc::new(PrintSink));
//!     let (_share_tx, mut share_rx) = mpsc::channel(64);
//!
//!     drive(&mut session, &connector, &mut share_rx, &CancellationToken::new(), |_| {}).await?;
//!     Ok(())
//! }
//! ```

pub mod binary;
pub mod config;
pub mod connection;
pub mod error;
pub mod job;
pub mod protocol;
pub mod session;

// Re-export main types
pub use config::{PoolConfig, ProtocolVersion, StratumConfig};
pub use connection::{drive, Connector, TcpConnector};
pub use error::{Result, StratumError};
pub use job::{CommitmentSource, Job, JobId, JobSink, SessionId, ShareCandidate, ZeroCommitment};
pub use session::{Session, SessionEvent, SessionState, SessionStats, SubmitOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
