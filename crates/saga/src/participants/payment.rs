//! Payment service trait, in-memory gateway and step participant.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use common::SagaId;
use resilience::{BreakerError, CircuitBreaker};
use serde_json::Value;

use super::{StepParticipant, decode_data};
use crate::error::{Result, SagaError};
use crate::order_fulfillment::{FulfillmentData, STEP_PROCESS_PAYMENT};

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Charges a customer for an order, returning a payment id.
    async fn charge(&self, order_id: &str, customer_id: &str, amount_cents: u64) -> Result<String>;

    /// Refunds a previously made payment.
    async fn refund(&self, payment_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, (String, String, u64)>,
    next_id: u32,
    fail_on_charge: bool,
    charge_latency: Option<Duration>,
    charge_calls: u32,
}

/// In-memory payment gateway for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the gateway to decline every charge.
    pub fn set_fail_on_charge(&self, fail: bool) {
        self.write().fail_on_charge = fail;
    }

    /// Makes every charge take `latency` before answering.
    pub fn set_charge_latency(&self, latency: Option<Duration>) {
        self.write().charge_latency = latency;
    }

    /// Returns the number of active payments.
    pub fn payment_count(&self) -> usize {
        self.read().payments.len()
    }

    /// Returns how many charges reached the gateway.
    pub fn charge_calls(&self) -> u32 {
        self.read().charge_calls
    }

    /// Returns true if a payment exists with the given ID.
    pub fn has_payment(&self, payment_id: &str) -> bool {
        self.read().payments.contains_key(payment_id)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, InMemoryPaymentState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, InMemoryPaymentState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn charge(&self, order_id: &str, customer_id: &str, amount_cents: u64) -> Result<String> {
        let latency = {
            let mut state = self.write();
            state.charge_calls += 1;
            state.charge_latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.write();
        if state.fail_on_charge {
            return Err(SagaError::step_failed(STEP_PROCESS_PAYMENT, "Payment declined"));
        }

        state.next_id += 1;
        let payment_id = format!("PAY-{:04}", state.next_id);
        state.payments.insert(
            payment_id.clone(),
            (order_id.to_string(), customer_id.to_string(), amount_cents),
        );

        Ok(payment_id)
    }

    async fn refund(&self, payment_id: &str) -> Result<()> {
        self.write().payments.remove(payment_id);
        Ok(())
    }
}

/// Executes the `process_payment` step through a circuit breaker.
///
/// An open circuit or a gateway timeout fails the step, which compensates
/// the saga instead of waiting on an unhealthy gateway.
pub struct PaymentParticipant<P> {
    service: P,
    breaker: Arc<CircuitBreaker>,
}

impl<P: PaymentService> PaymentParticipant<P> {
    pub fn new(service: P, breaker: Arc<CircuitBreaker>) -> Self {
        Self { service, breaker }
    }
}

#[async_trait]
impl<P: PaymentService> StepParticipant for PaymentParticipant<P> {
    fn step(&self) -> &str {
        STEP_PROCESS_PAYMENT
    }

    async fn execute(&self, _saga_id: &SagaId, data: &Value) -> Result<Value> {
        let mut data: FulfillmentData = decode_data(STEP_PROCESS_PAYMENT, data)?;
        let order = &data.order;
        let amount = order.total_cents().ok_or_else(|| {
            SagaError::step_failed(STEP_PROCESS_PAYMENT, "order total out of range")
        })?;
        let charged = self
            .breaker
            .execute(|| self.service.charge(&order.order_id, &order.customer_id, amount))
            .await;
        let payment_id = match charged {
            Ok(payment_id) => payment_id,
            Err(BreakerError::Inner(e)) => return Err(e),
            Err(e) => return Err(SagaError::step_failed(STEP_PROCESS_PAYMENT, e)),
        };
        data.payment_id = Some(payment_id);
        Ok(serde_json::to_value(data)?)
    }

    async fn compensate(&self, saga_id: &SagaId, data: &Value) -> Result<()> {
        let data: FulfillmentData = serde_json::from_value(data.clone())?;
        match data.payment_id {
            Some(payment_id) => self
                .service
                .refund(&payment_id)
                .await
                .map_err(|e| SagaError::compensation_failed(STEP_PROCESS_PAYMENT, e)),
            None => {
                tracing::info!(%saga_id, "no payment to refund");
                Ok(())
            }
        }
    }
}
