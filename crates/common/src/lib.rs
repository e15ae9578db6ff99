//! Shared identifiers and the error taxonomy used across the messaging crates.

pub mod error;
pub mod types;

pub use error::ErrorKind;
pub use types::{CorrelationId, MessageId, SagaId};
