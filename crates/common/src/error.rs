//! Error taxonomy shared by every crate in the workspace.

use serde::{Deserialize, Serialize};

/// Classification of a failure.
///
/// Transport and Processing failures are recovered locally (reconnection,
/// retry). The remaining kinds are terminal and reach the business layer as
/// typed errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection or channel failure.
    Transport,
    /// A handler failed while processing a message.
    Processing,
    /// A request/reply call or guarded call exceeded its budget.
    Timeout,
    /// A call was rejected by an open circuit breaker.
    CircuitOpen,
    /// A message exhausted its retries and was dead-lettered.
    RetryExhausted,
    /// A saga failed and its completed steps were compensated.
    SagaCompensated,
}

impl ErrorKind {
    /// Returns true if the core recovers from this kind without surfacing it.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, ErrorKind::Transport | ErrorKind::Processing)
    }

    /// Returns the kind name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "transport",
            ErrorKind::Processing => "processing",
            ErrorKind::Timeout => "timeout",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::RetryExhausted => "retry_exhausted",
            ErrorKind::SagaCompensated => "saga_compensated",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
