//! Saga status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::SagaId;
use saga::{SagaStats, SagaView};

use crate::AppState;
use crate::error::ApiError;

/// GET /sagas — active count and lifetime outcomes.
pub async fn stats(State(state): State<Arc<AppState>>) -> Json<SagaStats> {
    Json(state.orchestrator.registry().stats().await)
}

/// GET /sagas/{id} — an active saga. Finished sagas are no longer tracked.
#[tracing::instrument(skip(state))]
pub async fn get(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SagaView>, ApiError> {
    state
        .orchestrator
        .view(&SagaId::new(id.clone()))
        .await
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("No active saga {id}")))
}
