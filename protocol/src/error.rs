//! Protocol-level failures shared by every side of the wire

use thiserror::Error;

/// Errors raised while framing, encoding or classifying messages.
///
/// Every variant except `Encode` describes a peer that broke the protocol.
/// A session receiving one of them cannot resynchronize the stream and
/// must terminate.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    /// The frame is not parsable JSON (or exceeds the frame size limit)
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    /// The frame is JSON but matches none of the expected shapes
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// The server pushed a method the client does not handle
    #[error("unknown method pushed by server: {0}")]
    UnknownMethod(String),

    /// A response arrived for a request id with no pending slot
    #[error("response for unknown request id {0}")]
    UnknownCorrelationId(u64),

    #[error("failed to encode message: {0}")]
    Encode(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
