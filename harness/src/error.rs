use protocol::ProtocolError;
use thiserror::Error;

/// Harness errors
#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
