//! Saga status machine.

use serde::{Deserialize, Serialize};

/// The status of a saga in its lifecycle.
///
/// Status transitions:
/// ```text
/// Active ──┬──► Completed
///          └──► Compensating ──► Failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaStatus {
    /// Steps are being executed.
    #[default]
    Active,

    /// A step failed and compensations are being published.
    Compensating,

    /// All steps completed (terminal).
    Completed,

    /// Compensation finished after a failure (terminal).
    Failed,
}

impl SagaStatus {
    /// Returns true if the saga can begin compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Active)
    }

    /// Returns true if this is a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Failed)
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Active => "Active",
            SagaStatus::Compensating => "Compensating",
            SagaStatus::Completed => "Completed",
            SagaStatus::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
