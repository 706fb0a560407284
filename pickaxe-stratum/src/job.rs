//! Jobs, share candidates and the seams the session publishes through

use crate::protocol::MiningNotify;
use pickaxe_hash::{Hash256, HeaderTemplate, Target};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Job identifier as assigned by the pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobId {
    /// Binary protocol job id
    Numeric(u32),

    /// Text protocol job id
    Text(String),
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobId::Numeric(id) => write!(f, "{}", id),
            JobId::Text(id) => f.write_str(id),
        }
    }
}

/// Session identity negotiated during the handshake
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionId {
    /// Binary protocol channel/session id
    Numeric(u32),

    /// Text protocol subscription id
    Text(String),
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionId::Numeric(id) => write!(f, "{}", id),
            SessionId::Text(id) => f.write_str(id),
        }
    }
}

/// One unit of work.
///
/// Jobs are never mutated once published; a newer job replaces the old one
/// and carries a higher generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub id: JobId,

    /// Header to search, nonce zero
    pub header: HeaderTemplate,

    /// A hash at or below this target is a share
    pub target: Target,

    /// Freshness counter, strictly increasing per board
    pub generation: u64,

    /// Announced ahead of its previous-block hash
    pub future: bool,

    /// Extra nonce 2 the header was assembled with (text protocol)
    pub extranonce2: Option<Vec<u8>>,
}

impl Job {
    /// Share candidate for a nonce that met the target
    pub fn candidate(&self, nonce: u32) -> ShareCandidate {
        let ntime = self.extranonce2.as_ref().map(|_| self.header.timestamp);
        ShareCandidate {
            job_id: self.id.clone(),
            generation: self.generation,
            nonce,
            extranonce2: self.extranonce2.clone(),
            ntime,
        }
    }
}

/// A nonce found by a worker, waiting to be submitted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShareCandidate {
    pub job_id: JobId,
    pub generation: u64,
    pub nonce: u32,

    /// Text protocol only
    pub extranonce2: Option<Vec<u8>>,

    /// Text protocol only
    pub ntime: Option<u32>,
}

/// Receiver of the jobs a session produces.
///
/// Exactly one session writes at a time. `current_generation` seeds the
/// session's counter so generations keep increasing across reconnects.
pub trait JobSink: Send + Sync {
    /// Replace the current job
    fn publish(&self, job: Job);

    /// Drop the current job without a replacement
    fn retract(&self, generation: u64);

    /// Generation of the latest publish or retract
    fn current_generation(&self) -> u64;
}

/// Supplies the commitment root of a text-protocol job.
///
/// Coinbase assembly and merkle-branch folding are outside this crate;
/// whoever owns them plugs in here.
pub trait CommitmentSource: Send + Sync {
    fn commitment_root(
        &self,
        notify: &MiningNotify,
        extranonce1: &[u8],
        extranonce2: &[u8],
    ) -> Hash256;
}

/// Commitment source that always yields the zero root
#[derive(Debug, Clone, Copy, Default)]
pub struct ZeroCommitment;

impl CommitmentSource for ZeroCommitment {
    fn commitment_root(&self, _: &MiningNotify, _: &[u8], _: &[u8]) -> Hash256 {
        Hash256::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_copies_job_identity() {
        let job = Job {
            id: JobId::Text("abc".into()),
            header: HeaderTemplate {
                timestamp: 0x5f000000,
                ..Default::default()
            },
            target: Target::MAX,
            generation: 9,
            future: false,
            extranonce2: Some(vec![0, 0, 0, 1]),
        };

        let share = job.candidate(77);
        assert_eq!(share.job_id, JobId::Text("abc".into()));
        assert_eq!(share.generation, 9);
        assert_eq!(share.nonce, 77);
        assert_eq!(share.extranonce2, Some(vec![0, 0, 0, 1]));
        assert_eq!(share.ntime, Some(0x5f000000));
    }

    #[test]
    fn test_binary_candidate_has_no_text_fields() {
        let job = Job {
            id: JobId::Numeric(42),
            header: HeaderTemplate::default(),
            target: Target::MAX,
            generation: 1,
            future: false,
            extranonce2: None,
        };

        let share = job.candidate(123);
        assert_eq!(share.extranonce2, None);
        assert_eq!(share.ntime, None);
        assert_eq!(job.id.to_string(), "42");
    }
}
