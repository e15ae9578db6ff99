//! Saga orchestrator: sequences steps and drives compensation.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use common::{ErrorKind, SagaId};
use resilience::{Retry, RetryPolicy, RetryTopology};
use serde_json::Value;
use transport::{
    Binding, Connection, ConsumeOptions, DeliveryContext, ExchangeDeclaration, HandlerError,
    Message, MessageHandler, Outcome, Publisher, Topology,
};

use crate::error::{Result, SagaError};
use crate::events::{
    CompensateCommand, SAGA_EXCHANGE, SAGA_STEP_COMPLETED, SAGA_STEP_FAILED, SagaCompletedData,
    SagaEvent, SagaFailedData, StepCommand,
};
use crate::instance::{Advance, SagaInstance, SagaView};
use crate::registry::SagaRegistry;
use crate::state::SagaStatus;

/// Queue receiving step reports from participants.
pub const ORCHESTRATOR_QUEUE: &str = "saga.orchestrator";

/// Dead-letter exchange shared by the saga queues.
pub const SAGA_DLX: &str = "saga.dlx";

/// Orchestrates sagas over the message bus.
///
/// The orchestrator publishes one command at a time and waits for the
/// participant's report before publishing the next. A failure report makes
/// it publish compensations for every step before the failed one, most
/// recent first. Terminal sagas are removed from the registry.
pub struct SagaOrchestrator {
    publisher: Publisher,
    registry: SagaRegistry,
}

impl SagaOrchestrator {
    pub fn new(publisher: Publisher, registry: SagaRegistry) -> Self {
        Self {
            publisher,
            registry,
        }
    }

    pub fn registry(&self) -> &SagaRegistry {
        &self.registry
    }

    /// Saga exchange plus the report queue with its retry layout.
    pub fn topology() -> Topology {
        let mut topology = RetryTopology::for_queue(ORCHESTRATOR_QUEUE, SAGA_DLX).topology();
        topology.add_exchange(ExchangeDeclaration::topic(SAGA_EXCHANGE));
        for key in [SAGA_STEP_COMPLETED, SAGA_STEP_FAILED] {
            topology.add_binding(Binding::new(ORCHESTRATOR_QUEUE, SAGA_EXCHANGE, key));
        }
        topology
    }

    /// Declares the orchestrator topology and consumes step reports.
    ///
    /// Reports are consumed with prefetch 1 so they are applied in the order
    /// they were published.
    pub async fn listen(
        self: &Arc<Self>,
        connection: &Connection,
        policy: RetryPolicy,
    ) -> transport::Result<()> {
        connection.declare_topology(Self::topology()).await?;
        let handler = Retry::wrap(StepReportHandler::new(self.clone()), policy);
        connection
            .consume(
                ORCHESTRATOR_QUEUE,
                handler,
                ConsumeOptions::with_prefetch(1).tagged("saga-orchestrator"),
            )
            .await
    }

    /// Starts a saga and publishes `saga.start` for its first step.
    #[tracing::instrument(skip(self, saga_id, steps, initial_data), fields(saga_id = %saga_id))]
    pub async fn start_saga(
        &self,
        saga_id: SagaId,
        steps: Vec<String>,
        initial_data: Value,
    ) -> Result<()> {
        let event = SagaEvent::start(saga_id.clone(), &steps, initial_data.clone())
            .ok_or_else(|| SagaError::NoSteps(saga_id.clone()))?;
        let step_count = steps.len();
        let handle = self
            .registry
            .insert(SagaInstance::new(saga_id.clone(), steps, initial_data))
            .await?;

        // Reports for the first step wait on this lock until the start is out.
        let saga = handle.lock().await;
        if let Err(e) = self.publish(&event).await {
            drop(saga);
            self.registry.discard(&saga_id).await;
            tracing::error!(error = %e, "could not publish saga start, saga discarded");
            return Err(e);
        }

        metrics::counter!("saga_started_total").increment(1);
        tracing::info!(
            first_step = saga.head().unwrap_or_default(),
            step_count,
            "saga started"
        );
        Ok(())
    }

    /// Applies a step completion.
    ///
    /// Ignored, with a warning, for unknown sagas and for steps that are not
    /// the head of the remaining list.
    #[tracing::instrument(skip(self, saga_id, result), fields(saga_id = %saga_id))]
    pub async fn handle_step_complete(
        &self,
        saga_id: &SagaId,
        step: &str,
        result: Value,
    ) -> Result<()> {
        let Some(handle) = self.registry.get(saga_id).await else {
            tracing::warn!(step, "completion for unknown saga ignored");
            return Ok(());
        };
        let mut saga = handle.lock().await;

        let mut next = saga.clone();
        let Some(advance) = next.complete_step(step, result.clone()) else {
            tracing::warn!(
                step,
                expected = saga.head().unwrap_or_default(),
                status = %saga.status(),
                "out-of-order step completion ignored"
            );
            return Ok(());
        };

        match advance {
            Advance::Next(next_step) => {
                let event = SagaEvent::Continue(StepCommand {
                    saga_id: saga_id.clone(),
                    step: next_step.clone(),
                    remaining_steps: next.remaining_steps()[1..].to_vec(),
                    data: result,
                });
                self.publish(&event).await?;
                *saga = next;
                tracing::info!(step, next_step = %next_step, "saga step completed");
            }
            Advance::Finished => {
                let event = SagaEvent::SagaCompleted(SagaCompletedData {
                    saga_id: saga_id.clone(),
                    result,
                    completed_at: Utc::now(),
                });
                self.publish(&event).await?;
                *saga = next;
                let duration = saga.elapsed_secs();
                drop(saga);
                self.registry.finish_completed(saga_id).await;

                metrics::counter!("saga_completed").increment(1);
                metrics::histogram!("saga_duration_seconds").record(duration);
                tracing::info!(step, duration, "saga completed successfully");
            }
        }
        Ok(())
    }

    /// Applies a step failure: publishes `saga.compensate` for every step
    /// before `step` in reverse order, then removes the saga and publishes
    /// `saga.failed`.
    ///
    /// Ignored, with a warning, for unknown sagas, sagas already being
    /// compensated and steps the saga does not have.
    #[tracing::instrument(skip(self, saga_id), fields(saga_id = %saga_id))]
    pub async fn handle_step_failed(&self, saga_id: &SagaId, step: &str, error: &str) -> Result<()> {
        let Some(handle) = self.registry.get(saga_id).await else {
            tracing::warn!(step, "failure for unknown saga ignored");
            return Ok(());
        };
        let mut saga = handle.lock().await;

        if !saga.status().can_compensate() {
            tracing::warn!(step, status = %saga.status(), "failure for inactive saga ignored");
            return Ok(());
        }
        let Some(plan) = saga.compensation_plan(step) else {
            tracing::warn!(step, "failure for a step outside the saga ignored");
            return Ok(());
        };

        saga.begin_compensation();
        tracing::warn!(step, error, compensations = plan.len(), "saga step failed, compensating");

        for compensated in &plan {
            let event = SagaEvent::Compensate(CompensateCommand {
                saga_id: saga_id.clone(),
                step: compensated.clone(),
                failed_step: step.to_string(),
                reason: error.to_string(),
                data: saga.data().clone(),
            });
            if let Err(e) = self.publish(&event).await {
                // Back to active so a redelivered report restarts compensation.
                saga.reactivate();
                return Err(e);
            }
        }

        saga.mark_failed();
        let duration = saga.elapsed_secs();
        drop(saga);
        self.registry.finish_failed(saga_id).await;

        let event = SagaEvent::SagaFailed(SagaFailedData {
            saga_id: saga_id.clone(),
            failed_step: step.to_string(),
            reason: error.to_string(),
            compensated_steps: plan.clone(),
            failed_at: Utc::now(),
        });
        if let Err(e) = self.publish(&event).await {
            tracing::warn!(error = %e, "could not publish saga failure");
        }

        metrics::counter!("saga_failed").increment(1);
        metrics::histogram!("saga_duration_seconds").record(duration);
        tracing::warn!(
            failed_step = step,
            compensated = ?plan,
            error_kind = %ErrorKind::SagaCompensated,
            duration,
            "saga failed after compensation"
        );
        Ok(())
    }

    /// Status of an active saga.
    pub async fn status(&self, saga_id: &SagaId) -> Option<SagaStatus> {
        let handle = self.registry.get(saga_id).await?;
        let status = handle.lock().await.status();
        Some(status)
    }

    pub async fn view(&self, saga_id: &SagaId) -> Option<SagaView> {
        self.registry.view(saga_id).await
    }

    pub async fn active_count(&self) -> usize {
        self.registry.active_count().await
    }

    async fn publish(&self, event: &SagaEvent) -> Result<()> {
        let message = event.to_message()?;
        self.publisher
            .publish(SAGA_EXCHANGE, &event.routing_key(), message)
            .await?;
        Ok(())
    }
}

/// Feeds step reports from the orchestrator queue into a [`SagaOrchestrator`].
pub struct StepReportHandler {
    orchestrator: Arc<SagaOrchestrator>,
}

impl StepReportHandler {
    pub fn new(orchestrator: Arc<SagaOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl MessageHandler for StepReportHandler {
    async fn handle(
        &self,
        message: &Message,
        ctx: &DeliveryContext,
    ) -> std::result::Result<Outcome, HandlerError> {
        match SagaEvent::from_message(message)? {
            SagaEvent::StepCompleted(report) => {
                self.orchestrator
                    .handle_step_complete(&report.saga_id, &report.step, report.result)
                    .await?
            }
            SagaEvent::StepFailed(report) => {
                self.orchestrator
                    .handle_step_failed(&report.saga_id, &report.step, &report.error)
                    .await?
            }
            other => {
                tracing::warn!(
                    queue = ctx.queue(),
                    event_type = other.event_type(),
                    "orchestrator received a non-report saga event"
                );
                return Ok(Outcome::Reject);
            }
        }
        Ok(Outcome::Ack)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use transport::{ConnectionConfig, InMemoryBroker, QueueDeclaration};

    async fn setup() -> (InMemoryBroker, SagaOrchestrator) {
        let (broker, _conn, orchestrator) = setup_with_connection().await;
        (broker, orchestrator)
    }

    async fn setup_with_connection() -> (InMemoryBroker, Connection, SagaOrchestrator) {
        let broker = InMemoryBroker::new();
        let conn = Connection::new(Arc::new(broker.clone()), ConnectionConfig::default());
        conn.connect().await.unwrap();
        let mut topology = Topology::new();
        topology.add_exchange(ExchangeDeclaration::topic(SAGA_EXCHANGE));
        topology.add_queue(QueueDeclaration::durable("events"));
        topology.add_binding(Binding::new("events", SAGA_EXCHANGE, "#"));
        conn.declare_topology(topology).await.unwrap();
        let orchestrator = SagaOrchestrator::new(conn.publisher(), SagaRegistry::new());
        (broker, conn, orchestrator)
    }

    fn steps(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    async fn events(broker: &InMemoryBroker) -> Vec<SagaEvent> {
        broker
            .drain("events")
            .await
            .iter()
            .map(|m| SagaEvent::from_message(m).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_start_publishes_first_step() {
        let (broker, orchestrator) = setup().await;
        orchestrator
            .start_saga("s1".into(), steps(&["reserve", "pay"]), json!({"order_id": "o-1"}))
            .await
            .unwrap();

        let published = events(&broker).await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key(), "saga.reserve.execute");
        assert_eq!(
            orchestrator.status(&"s1".into()).await,
            Some(SagaStatus::Active)
        );
    }

    #[tokio::test]
    async fn test_start_rejects_empty_and_duplicate() {
        let (_broker, orchestrator) = setup().await;
        assert!(matches!(
            orchestrator.start_saga("s1".into(), vec![], json!({})).await,
            Err(SagaError::NoSteps(_))
        ));

        orchestrator
            .start_saga("s1".into(), steps(&["reserve"]), json!({}))
            .await
            .unwrap();
        assert!(matches!(
            orchestrator.start_saga("s1".into(), steps(&["reserve"]), json!({})).await,
            Err(SagaError::AlreadyStarted(_))
        ));
    }

    #[tokio::test]
    async fn test_completion_advances_with_result_as_data() {
        let (broker, orchestrator) = setup().await;
        let id = SagaId::new("s1");
        orchestrator
            .start_saga(id.clone(), steps(&["a", "b", "c"]), json!({"n": 0}))
            .await
            .unwrap();
        broker.drain("events").await;

        orchestrator
            .handle_step_complete(&id, "a", json!({"n": 1}))
            .await
            .unwrap();

        let published = events(&broker).await;
        assert_eq!(
            published,
            vec![SagaEvent::Continue(StepCommand {
                saga_id: id.clone(),
                step: "b".into(),
                remaining_steps: steps(&["c"]),
                data: json!({"n": 1}),
            })]
        );
    }

    #[tokio::test]
    async fn test_out_of_order_and_unknown_completions_ignored() {
        let (broker, orchestrator) = setup().await;
        let id = SagaId::new("s1");
        orchestrator
            .start_saga(id.clone(), steps(&["a", "b"]), json!({}))
            .await
            .unwrap();
        broker.drain("events").await;

        orchestrator.handle_step_complete(&id, "b", json!({})).await.unwrap();
        orchestrator
            .handle_step_complete(&"nope".into(), "a", json!({}))
            .await
            .unwrap();

        assert!(events(&broker).await.is_empty());
        assert_eq!(
            orchestrator.view(&id).await.unwrap().remaining_steps,
            steps(&["a", "b"])
        );
    }

    #[tokio::test]
    async fn test_last_completion_finishes_saga() {
        let (broker, orchestrator) = setup().await;
        let id = SagaId::new("s1");
        orchestrator
            .start_saga(id.clone(), steps(&["a"]), json!({}))
            .await
            .unwrap();
        broker.drain("events").await;

        orchestrator
            .handle_step_complete(&id, "a", json!({"done": true}))
            .await
            .unwrap();

        let published = events(&broker).await;
        assert!(matches!(
            &published[..],
            [SagaEvent::SagaCompleted(d)] if d.result == json!({"done": true})
        ));
        assert_eq!(orchestrator.active_count().await, 0);
        assert_eq!(orchestrator.registry().stats().await.completed, 1);
    }

    #[tokio::test]
    async fn test_failure_compensates_prior_steps_in_reverse() {
        let (broker, orchestrator) = setup().await;
        let id = SagaId::new("s1");
        orchestrator
            .start_saga(id.clone(), steps(&["a", "b", "c"]), json!({}))
            .await
            .unwrap();
        orchestrator.handle_step_complete(&id, "a", json!({})).await.unwrap();
        orchestrator.handle_step_complete(&id, "b", json!({})).await.unwrap();
        broker.drain("events").await;

        orchestrator.handle_step_failed(&id, "c", "boom").await.unwrap();

        let published = events(&broker).await;
        let keys: Vec<String> = published.iter().map(SagaEvent::routing_key).collect();
        assert_eq!(
            keys,
            vec!["saga.b.compensate", "saga.a.compensate", "saga.failed"]
        );
        assert!(orchestrator.status(&id).await.is_none());
        assert_eq!(orchestrator.registry().stats().await.failed, 1);
    }

    #[tokio::test]
    async fn test_failure_while_disconnected_keeps_saga_active() {
        let (_broker, conn, orchestrator) = setup_with_connection().await;
        let id = SagaId::new("s1");
        orchestrator
            .start_saga(id.clone(), steps(&["a", "b"]), json!({}))
            .await
            .unwrap();

        conn.disconnect().await;
        assert!(orchestrator.handle_step_failed(&id, "b", "boom").await.is_err());
        assert_eq!(orchestrator.status(&id).await, Some(SagaStatus::Active));
    }

    #[tokio::test]
    async fn test_unpublished_start_is_not_counted() {
        let (_broker, conn, orchestrator) = setup_with_connection().await;
        conn.disconnect().await;

        let id = SagaId::new("s1");
        let err = orchestrator
            .start_saga(id.clone(), steps(&["a"]), json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, SagaError::Transport(_)));
        assert!(orchestrator.status(&id).await.is_none());

        let stats = orchestrator.registry().stats().await;
        assert_eq!((stats.started, stats.active), (0, 0));
    }
}
