use protocol::ProtocolError;
use std::time::Duration;
use thiserror::Error;

/// Boxed error a tick handler may fail with
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// The transport could not be established
    #[error("failed to connect to {addr}: {source}")]
    Connection {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("handshake failed: {0}")]
    Handshake(#[source] std::io::Error),

    /// The peer broke the protocol; fatal for the connection
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The session is gone; used to fail requests still waiting on it
    #[error("connection closed")]
    ConnectionClosed,

    #[error("request {request_id} timed out after {after:?}")]
    RequestTimedOut { request_id: u64, after: Duration },

    #[error("a tick handler is already registered for this session")]
    HandlerAlreadyRegistered,

    #[error("tick handler failed on tick {tick}: {source}")]
    Handler {
        tick: u64,
        #[source]
        source: HandlerError,
    },

    /// Ticks are answered once; this batch came after the tick's own
    #[error("a batch for tick {tick} or a later tick was already submitted")]
    BatchAlreadySubmitted { tick: u64 },

    #[error("tick handler panicked")]
    HandlerPanicked,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("session task failed: {0}")]
    TaskFailed(String),
}

impl SessionError {
    /// True for the framing and shape violations that kill a connection
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }
}
