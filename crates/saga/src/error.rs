//! Saga error types.

use common::{ErrorKind, SagaId};
use thiserror::Error;
use transport::{HandlerError, TransportError};

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// A saga with this id is already active.
    #[error("Saga {0} has already been started")]
    AlreadyStarted(SagaId),

    /// A saga needs at least one step.
    #[error("Saga {0} has no steps")]
    NoSteps(SagaId),

    /// A participant could not perform its step. Reported to the
    /// orchestrator, which compensates the saga.
    #[error("Saga step '{step}' failed: {reason}")]
    StepFailed { step: String, reason: String },

    /// A participant could not undo its step.
    #[error("Compensation step '{step}' failed: {reason}")]
    CompensationFailed { step: String, reason: String },

    /// The message is not a saga event.
    #[error("Unknown saga event type: {0}")]
    UnknownEvent(String),

    /// Publishing a saga event failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    pub fn step_failed(step: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SagaError::StepFailed {
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    pub fn compensation_failed(step: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        SagaError::CompensationFailed {
            step: step.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            SagaError::Transport(e) => e.kind(),
            SagaError::StepFailed { .. } => ErrorKind::SagaCompensated,
            _ => ErrorKind::Processing,
        }
    }
}

impl From<SagaError> for HandlerError {
    fn from(err: SagaError) -> Self {
        match err {
            SagaError::Transport(e) => HandlerError::Transport(e),
            SagaError::Serialization(e) => HandlerError::Decode(e),
            SagaError::UnknownEvent(t) => HandlerError::UnknownMessageType(t),
            other => HandlerError::processing(other),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
