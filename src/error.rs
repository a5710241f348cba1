use std::time::Duration;
use thiserror::Error;

/// Errors raised by the envelope codec, transport drivers and the
/// sender/receiver state machines.
///
/// Per-message failures never escape a send or receive loop as a panic; they
/// are converted into a recorded failure plus the `Display` text of one of
/// these variants.
#[derive(Debug, Error)]
pub enum MessagingError {
    /// The driver could not establish a session with its endpoint.
    #[error("failed to connect to {endpoint}: {reason}")]
    Connection { endpoint: String, reason: String },

    /// No reply arrived before the deadline.
    #[error("timed out after {}ms waiting for a reply", .0.as_millis())]
    Timeout(Duration),

    /// A reply arrived but failed acknowledgment validation.
    #[error("invalid acknowledgment: {0}")]
    InvalidAck(String),

    /// Bytes could not be decoded into an envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// An envelope could not be built from the supplied parts.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    /// Driver-specific failure, surfaced verbatim.
    #[error("transport error: {0}")]
    Transport(String),

    /// A write stalled because the peer stopped draining its socket.
    #[error("timeout sending message due to backpressure")]
    BackpressureTimeout,

    #[error("transport is not connected")]
    NotConnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl MessagingError {
    pub fn connection(endpoint: impl Into<String>, reason: impl ToString) -> Self {
        MessagingError::Connection {
            endpoint: endpoint.into(),
            reason: reason.to_string(),
        }
    }

    pub fn malformed(reason: impl Into<String>) -> Self {
        MessagingError::MalformedEnvelope(reason.into())
    }

    /// True for failures after which a connection can no longer be trusted:
    /// it may sit mid-frame, or still carry replies to an earlier request.
    pub fn poisons_connection(&self) -> bool {
        matches!(
            self,
            MessagingError::Timeout(_)
                | MessagingError::Transport(_)
                | MessagingError::BackpressureTimeout
                | MessagingError::Io(_)
                | MessagingError::InvalidAck(_)
        )
    }
}
