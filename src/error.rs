use thiserror::Error;

use crate::models::DisconnectReason;

/// Failures inside the decoy fleet and the alerting engine.
///
/// None of these are shown to a remote peer; a handler that fails simply
/// drops the connection.
#[derive(Debug, Error)]
pub enum DecoyError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("idle timeout after {0}s")]
    Timeout(u64),

    #[error("event sink unavailable: {0}")]
    SinkUnavailable(String),

    #[error("event store query failed: {0}")]
    Query(String),

    #[error("notifier {channel} failed: {reason}")]
    Notify { channel: String, reason: String },
}

impl DecoyError {
    /// Disconnect reason recorded when this error ends a session.
    pub fn disconnect_reason(&self) -> DisconnectReason {
        match self {
            DecoyError::Timeout(_) => DisconnectReason::Timeout,
            DecoyError::ProtocolViolation(_) => DisconnectReason::ProtocolViolation,
            _ => DisconnectReason::TransportError,
        }
    }
}

impl From<reqwest::Error> for DecoyError {
    fn from(e: reqwest::Error) -> Self {
        DecoyError::SinkUnavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DecoyError>;
