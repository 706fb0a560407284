use thiserror::Error;
use tokio_util::codec::LinesCodecError;

/// Stratum client error types
#[derive(Error, Debug)]
pub enum StratumError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Malformed frame: {0}")]
    Malformed(String),

    #[error("Frame stream desynchronized: {0}")]
    Desync(String),

    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    #[error("Handshake did not complete in time")]
    HandshakeTimeout,

    #[error("JSON-RPC error: {code} - {message}")]
    JsonRpc { code: i64, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed by pool")]
    Eof,

    #[error("Operation not valid while {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Client shutdown")]
    Shutdown,
}

impl StratumError {
    /// Whether the session can keep reading after this error.
    ///
    /// Single malformed frames and unexpected messages are transient; a
    /// desynchronized binary stream or a broken transport is not.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            StratumError::Protocol(_)
                | StratumError::Malformed(_)
                | StratumError::JsonRpc { .. }
                | StratumError::Serialization(_)
        )
    }
}

impl From<LinesCodecError> for StratumError {
    fn from(e: LinesCodecError) -> Self {
        match e {
            LinesCodecError::MaxLineLengthExceeded => {
                StratumError::Malformed("line exceeds maximum length".to_string())
            }
            // LinesCodec only reports InvalidData for non UTF-8 lines
            LinesCodecError::Io(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                StratumError::Malformed(e.to_string())
            }
            LinesCodecError::Io(e) => StratumError::Io(e),
        }
    }
}

pub type Result<T> = std::result::Result<T, StratumError>;
