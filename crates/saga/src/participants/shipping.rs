//! Shipping service trait, in-memory implementation and step participant.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::SagaId;
use serde_json::Value;

use super::{StepParticipant, decode_data};
use crate::error::{Result, SagaError};
use crate::order_fulfillment::{FulfillmentData, STEP_CREATE_SHIPMENT};

/// Trait for shipping operations.
#[async_trait]
pub trait ShippingService: Send + Sync {
    /// Creates a shipment for an order, returning its tracking number.
    async fn create_shipment(&self, order_id: &str) -> Result<String>;

    /// Cancels a previously created shipment.
    async fn cancel_shipment(&self, tracking_number: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryShippingState {
    shipments: HashMap<String, String>,
    next_id: u32,
    fail_on_create: bool,
}

/// In-memory shipping service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryShippingService {
    state: Arc<RwLock<InMemoryShippingState>>,
}

impl InMemoryShippingService {
    /// Creates a new in-memory shipping service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to fail every create_shipment call.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.write().fail_on_create = fail;
    }

    /// Returns the number of active shipments.
    pub fn shipment_count(&self) -> usize {
        self.read().shipments.len()
    }

    /// Returns true if a shipment exists with the given tracking number.
    pub fn has_shipment(&self, tracking_number: &str) -> bool {
        self.read().shipments.contains_key(tracking_number)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryShippingState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryShippingState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ShippingService for InMemoryShippingService {
    async fn create_shipment(&self, order_id: &str) -> Result<String> {
        let mut state = self.write();

        if state.fail_on_create {
            return Err(SagaError::step_failed(
                STEP_CREATE_SHIPMENT,
                "Carrier unavailable",
            ));
        }

        state.next_id += 1;
        let tracking_number = format!("TRK-{:06}", state.next_id);
        state
            .shipments
            .insert(tracking_number.clone(), order_id.to_string());

        Ok(tracking_number)
    }

    async fn cancel_shipment(&self, tracking_number: &str) -> Result<()> {
        self.write().shipments.remove(tracking_number);
        Ok(())
    }
}

/// Executes the `create_shipment` step.
pub struct ShippingParticipant<S> {
    service: S,
}

impl<S: ShippingService> ShippingParticipant<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<S: ShippingService> StepParticipant for ShippingParticipant<S> {
    fn step(&self) -> &str {
        STEP_CREATE_SHIPMENT
    }

    async fn execute(&self, _saga_id: &SagaId, data: &Value) -> Result<Value> {
        let mut data: FulfillmentData = decode_data(STEP_CREATE_SHIPMENT, data)?;
        let tracking_number = self.service.create_shipment(&data.order.order_id).await?;
        data.tracking_number = Some(tracking_number);
        Ok(serde_json::to_value(data)?)
    }

    async fn compensate(&self, saga_id: &SagaId, data: &Value) -> Result<()> {
        let data: FulfillmentData = serde_json::from_value(data.clone())?;
        match data.tracking_number {
            Some(tracking_number) => self
                .service
                .cancel_shipment(&tracking_number)
                .await
                .map_err(|e| SagaError::compensation_failed(STEP_CREATE_SHIPMENT, e)),
            None => {
                tracing::info!(%saga_id, "no shipment to cancel");
                Ok(())
            }
        }
    }
}
