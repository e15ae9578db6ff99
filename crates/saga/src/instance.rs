//! Saga instance: the orchestrator's record of one business transaction.

use std::time::Instant;

use chrono::{DateTime, Utc};
use common::SagaId;
use serde::Serialize;
use serde_json::Value;

use crate::state::SagaStatus;

/// One saga being orchestrated.
///
/// Keeps the original step list and how many of its steps have completed;
/// the remaining steps are the suffix after the completed ones.
#[derive(Debug, Clone)]
pub struct SagaInstance {
    id: SagaId,
    steps: Vec<String>,
    completed: usize,
    data: Value,
    status: SagaStatus,
    started_at: DateTime<Utc>,
    started: Instant,
}

/// What completing the head step did to the saga.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Advance {
    /// The given step is next.
    Next(String),
    /// No steps remain.
    Finished,
}

impl SagaInstance {
    pub fn new(id: SagaId, steps: Vec<String>, data: Value) -> Self {
        Self {
            id,
            steps,
            completed: 0,
            data,
            status: SagaStatus::Active,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> &SagaId {
        &self.id
    }

    /// All steps in creation order.
    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// Steps not yet completed, head first.
    pub fn remaining_steps(&self) -> &[String] {
        &self.steps[self.completed..]
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.steps[..self.completed]
    }

    /// The step currently expected to report.
    pub fn head(&self) -> Option<&str> {
        self.remaining_steps().first().map(String::as_str)
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    /// Completes the head step, replacing the saga data with its result.
    ///
    /// Returns `None` (and changes nothing) unless `step` is the head of an
    /// active saga.
    pub fn complete_step(&mut self, step: &str, result: Value) -> Option<Advance> {
        if !self.status.can_compensate() || self.head() != Some(step) {
            return None;
        }
        self.completed += 1;
        self.data = result;
        match self.head() {
            Some(next) => Some(Advance::Next(next.to_string())),
            None => {
                self.status = SagaStatus::Completed;
                Some(Advance::Finished)
            }
        }
    }

    /// Steps to undo after `failed_step` failed: every step strictly before
    /// it in creation order, most recent first.
    ///
    /// Returns `None` if `failed_step` is not part of this saga.
    pub fn compensation_plan(&self, failed_step: &str) -> Option<Vec<String>> {
        let position = self.steps.iter().position(|s| s == failed_step)?;
        Some(self.steps[..position].iter().rev().cloned().collect())
    }

    /// Starts compensation. Returns false if the saga is not active.
    pub fn begin_compensation(&mut self) -> bool {
        if !self.status.can_compensate() {
            return false;
        }
        self.status = SagaStatus::Compensating;
        true
    }

    /// Abandons a compensation that could not be fully published.
    pub(crate) fn reactivate(&mut self) {
        if self.status == SagaStatus::Compensating {
            self.status = SagaStatus::Active;
        }
    }

    pub fn mark_failed(&mut self) {
        self.status = SagaStatus::Failed;
    }

    pub fn view(&self) -> SagaView {
        SagaView {
            saga_id: self.id.clone(),
            status: self.status,
            steps: self.steps.clone(),
            completed_steps: self.completed_steps().to_vec(),
            remaining_steps: self.remaining_steps().to_vec(),
            data: self.data.clone(),
            started_at: self.started_at,
        }
    }
}

/// Serializable snapshot of a saga for status queries.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaView {
    pub saga_id: SagaId,
    pub status: SagaStatus,
    pub steps: Vec<String>,
    pub completed_steps: Vec<String>,
    pub remaining_steps: Vec<String>,
    pub data: Value,
    pub started_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn saga(steps: &[&str]) -> SagaInstance {
        SagaInstance::new(
            SagaId::new("s1"),
            steps.iter().map(|s| s.to_string()).collect(),
            json!({"order_id": "o-1"}),
        )
    }

    #[test]
    fn test_steps_complete_in_order() {
        let mut saga = saga(&["reserve", "pay", "ship"]);
        assert_eq!(saga.head(), Some("reserve"));

        assert_eq!(saga.complete_step("pay", json!(1)), None);
        assert_eq!(saga.head(), Some("reserve"));

        assert_eq!(
            saga.complete_step("reserve", json!({"reservation_id": "RES-1"})),
            Some(Advance::Next("pay".into()))
        );
        assert_eq!(saga.completed_steps(), ["reserve"]);
        assert_eq!(saga.remaining_steps(), ["pay", "ship"]);
        assert_eq!(saga.data(), &json!({"reservation_id": "RES-1"}));
    }

    #[test]
    fn test_last_step_finishes_saga() {
        let mut saga = saga(&["reserve"]);
        assert_eq!(saga.complete_step("reserve", json!(null)), Some(Advance::Finished));
        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.head(), None);
        assert_eq!(saga.complete_step("reserve", json!(null)), None);
    }

    #[test]
    fn test_compensation_plan_is_reverse_of_prior_steps() {
        let saga = saga(&["a", "b", "c"]);
        assert_eq!(saga.compensation_plan("c"), Some(vec!["b".into(), "a".into()]));
        assert_eq!(saga.compensation_plan("b"), Some(vec!["a".into()]));
        assert_eq!(saga.compensation_plan("a"), Some(vec![]));
        assert_eq!(saga.compensation_plan("z"), None);
    }

    #[test]
    fn test_compensating_saga_does_not_advance() {
        let mut saga = saga(&["a", "b"]);
        assert!(saga.begin_compensation());
        assert!(!saga.begin_compensation());
        assert_eq!(saga.complete_step("a", json!(null)), None);
        assert_eq!(saga.view().status, SagaStatus::Compensating);
    }
}
