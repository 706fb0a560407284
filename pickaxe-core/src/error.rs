use pickaxe_stratum::StratumError;
use thiserror::Error;

/// Mining engine error types
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Stratum error: {0}")]
    Stratum(#[from] StratumError),

    #[error("Failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),

    #[error("Worker pool is already running")]
    AlreadyRunning,

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl EngineError {
    /// Whether a later session attempt can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Stratum(e) => !matches!(e, StratumError::InvalidConfiguration(_)),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
