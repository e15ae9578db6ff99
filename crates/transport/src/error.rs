use common::ErrorKind;
use thiserror::Error;

/// Errors raised by the broker connection and its sessions.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// No session is open; publishing fails fast instead of buffering.
    #[error("Not connected to the broker")]
    NotConnected,

    /// The broker could not be reached.
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// The session was closed while the operation was in progress.
    #[error("Broker session closed")]
    SessionClosed,

    /// Reconnection gave up after the configured number of attempts.
    #[error("Broker unavailable after {attempts} reconnection attempts")]
    Unavailable { attempts: u32 },

    /// Publishing to an exchange that was never declared.
    #[error("Exchange not found: {0}")]
    ExchangeNotFound(String),

    /// Consuming from or binding a queue that was never declared.
    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    /// A redeclaration conflicts with the existing declaration, or an
    /// exclusive resource is owned by another session.
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    /// Ack or nack for a delivery the session does not hold.
    #[error("Unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),

    /// Envelope (de)serialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl TransportError {
    /// Returns the taxonomy entry for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::Serialization(_) => ErrorKind::Processing,
            _ => ErrorKind::Transport,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(err: serde_json::Error) -> Self {
        TransportError::Serialization(err.to_string())
    }
}

/// Errors returned by message handlers.
///
/// Any error returned from a handler makes the dispatcher reject the
/// delivery without requeue.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The handler failed while processing the message.
    #[error("Processing failed: {0}")]
    Processing(String),

    /// The message exhausted its retries and is being dead-lettered.
    #[error("Retries exhausted after {attempts} attempts: {reason}")]
    RetryExhausted { attempts: u32, reason: String },

    /// No handler is registered for the message type.
    #[error("No handler registered for message type '{0}'")]
    UnknownMessageType(String),

    /// The payload could not be decoded.
    #[error("Payload decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// A transport call made from inside the handler failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl HandlerError {
    /// Creates a processing error from any displayable value.
    pub fn processing(reason: impl std::fmt::Display) -> Self {
        HandlerError::Processing(reason.to_string())
    }

    /// Returns the taxonomy entry for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            HandlerError::RetryExhausted { .. } => ErrorKind::RetryExhausted,
            HandlerError::Transport(e) => e.kind(),
            _ => ErrorKind::Processing,
        }
    }
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
