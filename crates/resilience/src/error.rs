use std::time::Duration;

use common::ErrorKind;
use thiserror::Error;

/// Errors returned by [`CircuitBreaker::execute`](crate::CircuitBreaker::execute).
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// The breaker is open (or a half-open probe is in flight); the
    /// operation was not invoked.
    #[error("Circuit breaker '{name}' is open")]
    Open { name: String },

    /// The operation exceeded the per-call timeout and was dropped.
    #[error("Call through circuit breaker '{name}' timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// The operation itself failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    /// Returns the taxonomy entry for this error; operation failures are
    /// classified as processing errors.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BreakerError::Open { .. } => ErrorKind::CircuitOpen,
            BreakerError::Timeout { .. } => ErrorKind::Timeout,
            BreakerError::Inner(_) => ErrorKind::Processing,
        }
    }

    /// Returns true if the breaker rejected the call without invoking it.
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    /// Returns the operation's own error, if that is what failed.
    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_error_kinds() {
        let open: BreakerError<String> = BreakerError::Open {
            name: "payments".into(),
        };
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert!(open.is_open());
        assert_eq!(open.to_string(), "Circuit breaker 'payments' is open");

        let timeout: BreakerError<String> = BreakerError::Timeout {
            name: "payments".into(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let inner = BreakerError::Inner("card declined".to_string());
        assert_eq!(inner.kind(), ErrorKind::Processing);
        assert_eq!(inner.to_string(), "card declined");
        assert_eq!(inner.into_inner().as_deref(), Some("card declined"));
    }
}
