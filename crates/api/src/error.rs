//! API error types with HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use saga::SagaError;
use thiserror::Error;
use transport::TransportError;

/// API-level error type that maps to HTTP responses.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found.
    #[error("{0}")]
    NotFound(String),
    /// Bad request from the client.
    #[error("{0}")]
    BadRequest(String),
    /// Saga orchestration error.
    #[error(transparent)]
    Saga(#[from] SagaError),
    /// Broker unreachable or publish failed.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Saga(err) => saga_status(err),
            ApiError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, %status, "request failed");
        }

        let body = serde_json::json!({ "error": self.to_string() });
        (status, axum::Json(body)).into_response()
    }
}

fn saga_status(err: &SagaError) -> StatusCode {
    match err {
        SagaError::AlreadyStarted(_) => StatusCode::CONFLICT,
        SagaError::NoSteps(_) | SagaError::Serialization(_) => StatusCode::BAD_REQUEST,
        SagaError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
