//! Resilience decorators for message handlers and downstream calls.
//!
//! - [`Retry`]: delay-queue retries with exponential backoff, then dead-letter
//! - [`CircuitBreaker`]: fail fast on a dependency that keeps failing
//! - [`Idempotent`]: skip messages whose business key already completed

pub mod circuit_breaker;
pub mod error;
pub mod idempotency;
pub mod retry;

pub use circuit_breaker::{
    BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitState,
};
pub use error::BreakerError;
pub use idempotency::{
    IdempotencyConfig, IdempotencyStore, Idempotent, InMemoryIdempotencyStore, KeyExtractor,
    default_key,
};
pub use retry::{Retry, RetryPolicy, RetryTopology};
