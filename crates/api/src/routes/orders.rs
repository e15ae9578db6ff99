//! Order intake: each accepted order starts a fulfillment saga.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use saga::{OrderLine, OrderRequest, order_fulfillment};
use serde::{Deserialize, Serialize};

use crate::AppState;
use crate::error::ApiError;

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    /// Generated when absent. Also the saga id.
    pub order_id: Option<String>,
    pub customer_id: String,
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

#[derive(Serialize)]
pub struct OrderAcceptedResponse {
    pub order_id: String,
    pub saga_id: String,
    pub total_cents: u64,
}

/// POST /orders — validate the order and start its fulfillment saga.
#[tracing::instrument(skip(state, req), fields(customer_id = %req.customer_id))]
pub async fn create(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<OrderAcceptedResponse>), ApiError> {
    if req.customer_id.trim().is_empty() {
        return Err(ApiError::BadRequest("customer_id is required".into()));
    }
    if req.items.is_empty() {
        return Err(ApiError::BadRequest("Order has no items".into()));
    }
    if let Some(item) = req.items.iter().find(|i| i.quantity == 0) {
        return Err(ApiError::BadRequest(format!(
            "Invalid quantity for product {}",
            item.product_id
        )));
    }

    let order = OrderRequest {
        order_id: req
            .order_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
        customer_id: req.customer_id,
        items: req
            .items
            .into_iter()
            .map(|i| OrderLine {
                product_id: i.product_id,
                quantity: i.quantity,
                unit_price_cents: i.unit_price_cents,
            })
            .collect(),
    };
    let order_id = order.order_id.clone();
    let total_cents = order
        .total_cents()
        .ok_or_else(|| ApiError::BadRequest("Order total is out of range".into()))?;

    let saga_id = order_fulfillment::start(&state.orchestrator, order).await?;
    tracing::info!(%order_id, total_cents, "order accepted");

    Ok((
        StatusCode::ACCEPTED,
        Json(OrderAcceptedResponse {
            order_id,
            saga_id: saga_id.to_string(),
            total_cents,
        }),
    ))
}
