//! Order fulfillment saga: reserve inventory, charge payment, ship.

use std::sync::Arc;

use common::SagaId;
use resilience::{CircuitBreaker, IdempotencyStore, RetryPolicy};
use serde::{Deserialize, Serialize};
use transport::Connection;

use crate::error::Result;
use crate::orchestrator::SagaOrchestrator;
use crate::participants::{
    InventoryParticipant, InventoryService, PaymentParticipant, PaymentService,
    ShippingParticipant, ShippingService, install_participant,
};

/// The saga type identifier for order fulfillment.
pub const SAGA_TYPE: &str = "OrderFulfillment";

/// Step name: Reserve inventory for the order.
pub const STEP_RESERVE_INVENTORY: &str = "reserve_inventory";

/// Step name: Process payment for the order.
pub const STEP_PROCESS_PAYMENT: &str = "process_payment";

/// Step name: Create shipment for the order.
pub const STEP_CREATE_SHIPMENT: &str = "create_shipment";

/// Steps in execution order.
pub fn steps() -> Vec<String> {
    [STEP_RESERVE_INVENTORY, STEP_PROCESS_PAYMENT, STEP_CREATE_SHIPMENT]
        .map(String::from)
        .to_vec()
}

/// One order line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_cents: u64,
}

/// An order to fulfil.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<OrderLine>,
}

impl OrderRequest {
    /// Sum of all lines, or `None` if it does not fit in a `u64`.
    pub fn total_cents(&self) -> Option<u64> {
        self.items.iter().try_fold(0u64, |total, line| {
            u64::from(line.quantity)
                .checked_mul(line.unit_price_cents)
                .and_then(|amount| total.checked_add(amount))
        })
    }
}

/// Saga data: the order plus what each completed step produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FulfillmentData {
    #[serde(flatten)]
    pub order: OrderRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracking_number: Option<String>,
}

impl From<OrderRequest> for FulfillmentData {
    fn from(order: OrderRequest) -> Self {
        Self {
            order,
            reservation_id: None,
            payment_id: None,
            tracking_number: None,
        }
    }
}

/// Starts an order fulfillment saga keyed by the order id.
#[tracing::instrument(skip(orchestrator, order), fields(saga_type = SAGA_TYPE, order_id = %order.order_id))]
pub async fn start(orchestrator: &SagaOrchestrator, order: OrderRequest) -> Result<SagaId> {
    let saga_id = SagaId::new(order.order_id.clone());
    let data = serde_json::to_value(FulfillmentData::from(order))?;
    orchestrator.start_saga(saga_id.clone(), steps(), data).await?;
    Ok(saga_id)
}

/// The three participants of the order fulfillment saga.
pub struct FulfillmentParticipants<I, P, S> {
    pub inventory: I,
    pub payment: P,
    pub shipping: S,
    /// Guards calls to the payment gateway.
    pub payment_breaker: Arc<CircuitBreaker>,
}

impl<I, P, S> FulfillmentParticipants<I, P, S>
where
    I: InventoryService + 'static,
    P: PaymentService + 'static,
    S: ShippingService + 'static,
{
    /// Declares every participant queue and starts consuming.
    pub async fn install(
        self,
        connection: &Connection,
        policy: &RetryPolicy,
        store: Arc<dyn IdempotencyStore>,
        prefetch: u16,
    ) -> transport::Result<()> {
        install_participant(
            connection,
            InventoryParticipant::new(self.inventory),
            policy.clone(),
            store.clone(),
            prefetch,
        )
        .await?;
        install_participant(
            connection,
            PaymentParticipant::new(self.payment, self.payment_breaker),
            policy.clone(),
            store.clone(),
            prefetch,
        )
        .await?;
        install_participant(
            connection,
            ShippingParticipant::new(self.shipping),
            policy.clone(),
            store,
            prefetch,
        )
        .await
    }
}
