//! Step participants: services that execute and compensate saga steps.

pub mod inventory;
pub mod payment;
pub mod shipping;

use std::sync::Arc;

use async_trait::async_trait;
use common::SagaId;
use resilience::{IdempotencyStore, Idempotent, Retry, RetryPolicy, RetryTopology};
use serde_json::Value;
use transport::{
    Binding, Connection, ConsumeOptions, DeliveryContext, ExchangeDeclaration, HandlerError,
    Message, MessageHandler, Outcome, Topology,
};

use crate::error::{Result, SagaError};
use crate::events::{SAGA_EXCHANGE, SagaEvent, compensate_key, execute_key};
use crate::orchestrator::SAGA_DLX;

pub use inventory::{InMemoryInventoryService, InventoryParticipant, InventoryService};
pub use payment::{InMemoryPaymentService, PaymentParticipant, PaymentService};
pub use shipping::{InMemoryShippingService, ShippingParticipant, ShippingService};

/// A service that owns one saga step.
#[async_trait]
pub trait StepParticipant: Send + Sync {
    /// The step name this participant executes.
    fn step(&self) -> &str;

    /// Runs the step. The returned value becomes the data of the next step.
    ///
    /// Return [`SagaError::StepFailed`] to fail the saga; any other error is
    /// treated as transient and retried.
    async fn execute(&self, saga_id: &SagaId, data: &Value) -> Result<Value>;

    /// Undoes the step. Must tolerate a step that never ran.
    async fn compensate(&self, saga_id: &SagaId, data: &Value) -> Result<()>;
}

/// Queue a participant for `step` consumes from.
pub fn participant_queue(step: &str) -> String {
    format!("saga.{step}")
}

/// Participant queue with its retry layout, bound to the execute and
/// compensate keys of `step`.
pub fn participant_topology(step: &str) -> Topology {
    let queue = participant_queue(step);
    let mut topology = RetryTopology::for_queue(&queue, SAGA_DLX).topology();
    topology.add_exchange(ExchangeDeclaration::topic(SAGA_EXCHANGE));
    topology.add_binding(Binding::new(queue.clone(), SAGA_EXCHANGE, execute_key(step)));
    topology.add_binding(Binding::new(queue, SAGA_EXCHANGE, compensate_key(step)));
    topology
}

/// Runs a [`StepParticipant`] on saga commands and reports the outcome.
///
/// A transient error on the last attempt allowed by the retry ceiling is
/// reported as a step failure, so the saga is compensated instead of waiting
/// on a dead-lettered command.
pub struct ParticipantHandler<P> {
    participant: P,
    max_retries: u32,
}

impl<P: StepParticipant> ParticipantHandler<P> {
    /// `max_retries` must match the policy of the surrounding [`Retry`].
    pub fn new(participant: P, max_retries: u32) -> Self {
        Self {
            participant,
            max_retries,
        }
    }

    fn is_last_attempt(&self, message: &Message) -> bool {
        message.attempt_count() >= message.max_attempts().unwrap_or(self.max_retries)
    }

    async fn report(&self, ctx: &DeliveryContext, report: SagaEvent) -> Result<()> {
        ctx.publisher()
            .publish(SAGA_EXCHANGE, &report.routing_key(), report.to_message()?)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl<P: StepParticipant> MessageHandler for ParticipantHandler<P> {
    async fn handle(
        &self,
        message: &Message,
        ctx: &DeliveryContext,
    ) -> std::result::Result<Outcome, HandlerError> {
        let step = self.participant.step();
        match SagaEvent::from_message(message)? {
            SagaEvent::Start(command) | SagaEvent::Continue(command) => {
                if command.step != step {
                    tracing::warn!(step, command_step = %command.step, "command for another step");
                    return Ok(Outcome::Reject);
                }
                let report = match self.participant.execute(&command.saga_id, &command.data).await {
                    Ok(result) => {
                        tracing::info!(saga_id = %command.saga_id, step, "step executed");
                        SagaEvent::step_completed(command.saga_id, step, result)
                    }
                    Err(SagaError::StepFailed { reason, .. }) => {
                        tracing::warn!(saga_id = %command.saga_id, step, %reason, "step failed");
                        SagaEvent::step_failed(command.saga_id, step, reason)
                    }
                    Err(e) if self.is_last_attempt(message) => {
                        tracing::error!(
                            saga_id = %command.saga_id,
                            step,
                            attempt = message.attempt_count(),
                            error = %e,
                            "step retries exhausted, failing saga"
                        );
                        let reason = format!("retries exhausted: {e}");
                        self.report(ctx, SagaEvent::step_failed(command.saga_id, step, reason))
                            .await?;
                        // Still dead-lettered for inspection.
                        return Err(e.into());
                    }
                    Err(e) => return Err(e.into()),
                };
                self.report(ctx, report).await?;
            }
            SagaEvent::Compensate(command) => {
                self.participant
                    .compensate(&command.saga_id, &command.data)
                    .await?;
                tracing::info!(
                    saga_id = %command.saga_id,
                    step,
                    failed_step = %command.failed_step,
                    "step compensated"
                );
            }
            other => {
                tracing::warn!(step, event_type = other.event_type(), "unexpected saga event");
                return Ok(Outcome::Reject);
            }
        }
        Ok(Outcome::Ack)
    }
}

/// Declares the participant's topology and consumes its commands.
///
/// Commands are deduplicated by message id and retried with `policy` before
/// being dead-lettered.
pub async fn install_participant<P>(
    connection: &Connection,
    participant: P,
    policy: RetryPolicy,
    store: Arc<dyn IdempotencyStore>,
    prefetch: u16,
) -> transport::Result<()>
where
    P: StepParticipant + 'static,
{
    let step = participant.step().to_string();
    connection
        .declare_topology(participant_topology(&step))
        .await?;
    let max_retries = policy.max_retries;
    let handler = Retry::wrap(
        Idempotent::with_default_key(ParticipantHandler::new(participant, max_retries), store),
        policy,
    );
    connection
        .consume(
            &participant_queue(&step),
            handler,
            ConsumeOptions::with_prefetch(prefetch).tagged(format!("saga-{step}")),
        )
        .await
}

/// Decodes step data, failing the step when it does not fit.
pub(crate) fn decode_data<T: serde::de::DeserializeOwned>(step: &str, data: &Value) -> Result<T> {
    serde_json::from_value(data.clone()).map_err(|e| SagaError::step_failed(step, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_topology_binds_both_commands() {
        let topology = participant_topology("reserve");
        assert!(topology
            .bindings
            .contains(&Binding::new("saga.reserve", SAGA_EXCHANGE, "saga.reserve.execute")));
        assert!(topology
            .bindings
            .contains(&Binding::new("saga.reserve", SAGA_EXCHANGE, "saga.reserve.compensate")));
        assert!(topology.queues.iter().any(|q| q.name == "saga.reserve.delay"));
    }
}
