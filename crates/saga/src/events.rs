//! Saga events exchanged between the orchestrator and step participants.
//!
//! All events travel over the [`SAGA_EXCHANGE`] topic exchange:
//!
//! ```text
//! event                  routing key
//! ───────────────────────────────────────────
//! saga.start             saga.<step>.execute
//! saga.continue          saga.<step>.execute
//! saga.compensate        saga.<step>.compensate
//! saga.step.completed    saga.step.completed
//! saga.step.failed       saga.step.failed
//! saga.completed         saga.completed
//! saga.failed            saga.failed
//! ```

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use transport::Message;

use crate::error::{Result, SagaError};

/// Topic exchange carrying every saga event.
pub const SAGA_EXCHANGE: &str = "saga.events";

pub const SAGA_START: &str = "saga.start";
pub const SAGA_CONTINUE: &str = "saga.continue";
pub const SAGA_COMPENSATE: &str = "saga.compensate";
pub const SAGA_STEP_COMPLETED: &str = "saga.step.completed";
pub const SAGA_STEP_FAILED: &str = "saga.step.failed";
pub const SAGA_COMPLETED: &str = "saga.completed";
pub const SAGA_FAILED: &str = "saga.failed";

/// Routing key of the execute command for `step`.
pub fn execute_key(step: &str) -> String {
    format!("saga.{step}.execute")
}

/// Routing key of the compensate command for `step`.
pub fn compensate_key(step: &str) -> String {
    format!("saga.{step}.compensate")
}

/// Events that can occur during saga execution.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaEvent {
    /// Execute the first step.
    Start(StepCommand),

    /// Execute the next step with the previous step's result.
    Continue(StepCommand),

    /// Undo a step that ran before the failed one.
    Compensate(CompensateCommand),

    /// A participant finished its step.
    StepCompleted(StepCompletedData),

    /// A participant could not perform its step.
    StepFailed(StepFailedData),

    /// Every step completed.
    SagaCompleted(SagaCompletedData),

    /// A step failed and compensations were published.
    SagaFailed(SagaFailedData),
}

/// Instruction to a participant to run its step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCommand {
    pub saga_id: SagaId,
    /// The step to execute.
    pub step: String,
    /// Steps that follow this one, in order.
    pub remaining_steps: Vec<String>,
    /// Business data: the initial payload, then each step's result.
    pub data: Value,
}

/// Instruction to a participant to undo its step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensateCommand {
    pub saga_id: SagaId,
    /// The step to undo.
    pub step: String,
    /// The step whose failure triggered compensation.
    pub failed_step: String,
    pub reason: String,
    /// The latest business data known to the orchestrator.
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub saga_id: SagaId,
    pub step: String,
    /// Becomes the data of the next step.
    pub result: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub saga_id: SagaId,
    pub step: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompletedData {
    pub saga_id: SagaId,
    /// Result of the last step.
    pub result: Value,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub saga_id: SagaId,
    pub failed_step: String,
    pub reason: String,
    /// Steps compensated, in the order compensations were published.
    pub compensated_steps: Vec<String>,
    pub failed_at: DateTime<Utc>,
}

impl SagaEvent {
    pub fn start(saga_id: SagaId, steps: &[String], data: Value) -> Option<Self> {
        let (step, rest) = steps.split_first()?;
        Some(SagaEvent::Start(StepCommand {
            saga_id,
            step: step.clone(),
            remaining_steps: rest.to_vec(),
            data,
        }))
    }

    pub fn step_completed(saga_id: SagaId, step: impl Into<String>, result: Value) -> Self {
        SagaEvent::StepCompleted(StepCompletedData {
            saga_id,
            step: step.into(),
            result,
        })
    }

    pub fn step_failed(saga_id: SagaId, step: impl Into<String>, error: impl Into<String>) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            saga_id,
            step: step.into(),
            error: error.into(),
        })
    }

    /// The message type this event travels as.
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::Start(_) => SAGA_START,
            SagaEvent::Continue(_) => SAGA_CONTINUE,
            SagaEvent::Compensate(_) => SAGA_COMPENSATE,
            SagaEvent::StepCompleted(_) => SAGA_STEP_COMPLETED,
            SagaEvent::StepFailed(_) => SAGA_STEP_FAILED,
            SagaEvent::SagaCompleted(_) => SAGA_COMPLETED,
            SagaEvent::SagaFailed(_) => SAGA_FAILED,
        }
    }

    pub fn saga_id(&self) -> &SagaId {
        match self {
            SagaEvent::Start(c) | SagaEvent::Continue(c) => &c.saga_id,
            SagaEvent::Compensate(c) => &c.saga_id,
            SagaEvent::StepCompleted(d) => &d.saga_id,
            SagaEvent::StepFailed(d) => &d.saga_id,
            SagaEvent::SagaCompleted(d) => &d.saga_id,
            SagaEvent::SagaFailed(d) => &d.saga_id,
        }
    }

    /// The routing key on [`SAGA_EXCHANGE`].
    pub fn routing_key(&self) -> String {
        match self {
            SagaEvent::Start(c) | SagaEvent::Continue(c) => execute_key(&c.step),
            SagaEvent::Compensate(c) => compensate_key(&c.step),
            other => other.event_type().to_string(),
        }
    }

    /// Encodes the event as a message correlated by saga id.
    pub fn to_message(&self) -> Result<Message> {
        let payload = match self {
            SagaEvent::Start(c) | SagaEvent::Continue(c) => serde_json::to_vec(c)?,
            SagaEvent::Compensate(c) => serde_json::to_vec(c)?,
            SagaEvent::StepCompleted(d) => serde_json::to_vec(d)?,
            SagaEvent::StepFailed(d) => serde_json::to_vec(d)?,
            SagaEvent::SagaCompleted(d) => serde_json::to_vec(d)?,
            SagaEvent::SagaFailed(d) => serde_json::to_vec(d)?,
        };
        Ok(Message::builder()
            .message_type(self.event_type())
            .payload(payload)
            .correlation_id(self.saga_id().as_str())
            .build())
    }

    /// Decodes an event from a message, dispatching on its type.
    pub fn from_message(message: &Message) -> Result<Self> {
        let event = match message.message_type.as_str() {
            SAGA_START => SagaEvent::Start(message.decode()?),
            SAGA_CONTINUE => SagaEvent::Continue(message.decode()?),
            SAGA_COMPENSATE => SagaEvent::Compensate(message.decode()?),
            SAGA_STEP_COMPLETED => SagaEvent::StepCompleted(message.decode()?),
            SAGA_STEP_FAILED => SagaEvent::StepFailed(message.decode()?),
            SAGA_COMPLETED => SagaEvent::SagaCompleted(message.decode()?),
            SAGA_FAILED => SagaEvent::SagaFailed(message.decode()?),
            other => return Err(SagaError::UnknownEvent(other.to_string())),
        };
        Ok(event)
    }
}
