//! Inventory service trait, in-memory implementation and step participant.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use common::SagaId;
use serde_json::Value;

use super::{StepParticipant, decode_data};
use crate::error::{Result, SagaError};
use crate::order_fulfillment::{FulfillmentData, OrderLine, STEP_RESERVE_INVENTORY};

/// Trait for inventory management operations.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Reserves stock for the given order lines, returning a reservation id.
    async fn reserve(&self, order_id: &str, items: &[OrderLine]) -> Result<String>;

    /// Releases a previously made reservation.
    async fn release(&self, reservation_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    reservations: HashMap<String, (String, Vec<OrderLine>)>,
    next_id: u32,
    fail_on_reserve: bool,
}

/// In-memory inventory service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to fail every reserve call.
    pub fn set_fail_on_reserve(&self, fail: bool) {
        self.write().fail_on_reserve = fail;
    }

    /// Returns the number of active reservations.
    pub fn reservation_count(&self) -> usize {
        self.read().reservations.len()
    }

    /// Returns true if a reservation exists with the given ID.
    pub fn has_reservation(&self, reservation_id: &str) -> bool {
        self.read().reservations.contains_key(reservation_id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryInventoryState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryInventoryState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn reserve(&self, order_id: &str, items: &[OrderLine]) -> Result<String> {
        let mut state = self.write();

        if state.fail_on_reserve {
            return Err(SagaError::step_failed(
                STEP_RESERVE_INVENTORY,
                "Insufficient stock",
            ));
        }

        state.next_id += 1;
        let reservation_id = format!("RES-{:04}", state.next_id);
        state
            .reservations
            .insert(reservation_id.clone(), (order_id.to_string(), items.to_vec()));

        Ok(reservation_id)
    }

    async fn release(&self, reservation_id: &str) -> Result<()> {
        self.write().reservations.remove(reservation_id);
        Ok(())
    }
}

/// Executes the `reserve_inventory` step.
pub struct InventoryParticipant<I> {
    service: I,
}

impl<I: InventoryService> InventoryParticipant<I> {
    pub fn new(service: I) -> Self {
        Self { service }
    }
}

#[async_trait]
impl<I: InventoryService> StepParticipant for InventoryParticipant<I> {
    fn step(&self) -> &str {
        STEP_RESERVE_INVENTORY
    }

    async fn execute(&self, _saga_id: &SagaId, data: &Value) -> Result<Value> {
        let mut data: FulfillmentData = decode_data(STEP_RESERVE_INVENTORY, data)?;
        let reservation_id = self
            .service
            .reserve(&data.order.order_id, &data.order.items)
            .await?;
        data.reservation_id = Some(reservation_id);
        Ok(serde_json::to_value(data)?)
    }

    async fn compensate(&self, saga_id: &SagaId, data: &Value) -> Result<()> {
        let data: FulfillmentData = serde_json::from_value(data.clone())?;
        match data.reservation_id {
            Some(reservation_id) => self
                .service
                .release(&reservation_id)
                .await
                .map_err(|e| SagaError::compensation_failed(STEP_RESERVE_INVENTORY, e)),
            None => {
                tracing::info!(%saga_id, "no reservation to release");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_fulfillment::OrderRequest;

    fn lines() -> Vec<OrderLine> {
        vec![OrderLine {
            product_id: "SKU-001".into(),
            quantity: 2,
            unit_price_cents: 1000,
        }]
    }

    #[tokio::test]
    async fn test_reserve_and_release() {
        let service = InMemoryInventoryService::new();

        let reservation_id = service.reserve("o-1", &lines()).await.unwrap();
        assert!(reservation_id.starts_with("RES-"));
        assert_eq!(service.reservation_count(), 1);
        assert!(service.has_reservation(&reservation_id));

        service.release(&reservation_id).await.unwrap();
        assert_eq!(service.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_on_reserve_is_a_step_failure() {
        let service = InMemoryInventoryService::new();
        service.set_fail_on_reserve(true);

        let err = service.reserve("o-1", &lines()).await.unwrap_err();
        assert!(matches!(err, SagaError::StepFailed { .. }));
        assert_eq!(service.reservation_count(), 0);
    }

    #[tokio::test]
    async fn test_participant_records_reservation_and_releases_it() {
        let service = InMemoryInventoryService::new();
        let participant = InventoryParticipant::new(service.clone());
        let saga_id = SagaId::new("o-1");
        let order = OrderRequest {
            order_id: "o-1".into(),
            customer_id: "c-1".into(),
            items: lines(),
        };
        let data = serde_json::to_value(FulfillmentData::from(order)).unwrap();

        let result = participant.execute(&saga_id, &data).await.unwrap();
        assert_eq!(result["reservation_id"], "RES-0001");
        assert_eq!(service.reservation_count(), 1);

        participant.compensate(&saga_id, &result).await.unwrap();
        assert_eq!(service.reservation_count(), 0);

        // Compensating before the step ran is a no-op.
        participant.compensate(&saga_id, &data).await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_data_fails_the_step() {
        let participant = InventoryParticipant::new(InMemoryInventoryService::new());
        let err = participant
            .execute(&SagaId::new("o-1"), &serde_json::json!({"nope": 1}))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::StepFailed { .. }));
    }
}
