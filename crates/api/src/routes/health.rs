//! Health and circuit breaker endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use resilience::{BreakerSnapshot, CircuitState};
use serde::Serialize;

use crate::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub broker: String,
    pub open_circuits: Vec<String>,
}

/// GET /health — 200 while the broker connection is up, 503 otherwise.
pub async fn check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<HealthResponse>) {
    let connected = state.connection.is_connected();
    let open_circuits = state
        .breakers
        .snapshot()
        .into_iter()
        .filter(|b| b.state == CircuitState::Open)
        .map(|b| b.name)
        .collect();

    let (code, status) = if connected {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
    };
    let response = HealthResponse {
        status,
        broker: format!("{:?}", state.connection.state()),
        open_circuits,
    };
    (code, Json(response))
}

/// GET /breakers — snapshot of every circuit breaker.
pub async fn breakers(State(state): State<Arc<AppState>>) -> Json<Vec<BreakerSnapshot>> {
    Json(state.breakers.snapshot())
}
