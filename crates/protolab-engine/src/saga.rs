//! Protolab Saga
//!
//! Long-running transaction as an ordered list of local steps. Each step is
//! marked completed, failed or compensated by the caller; nothing links a
//! failure to compensation. The compensation plan lists completed steps in
//! reverse order.
//!
//! @version 0.1.0
//! @author AutomataNexus Development Team

use crate::clock::{SharedClock, SystemClock};
use crate::event::{Event, EventLog};
use protolab_common::config::SagaConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// =============================================================================
// Step
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StepStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Compensated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    pub name: String,
    pub status: StepStatus,
}

/// Overall progress, derived from the step statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SagaStatus {
    Running,
    Completed,
    Compensating,
    Compensated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStats {
    pub status: SagaStatus,
    pub steps: Vec<SagaStep>,
    pub completed: usize,
    pub compensated: usize,
}

// =============================================================================
// Saga
// =============================================================================

#[derive(Debug, Clone)]
pub struct Saga {
    config: SagaConfig,
    steps: Vec<SagaStep>,
    events: EventLog,
    clock: SharedClock,
}

impl Saga {
    pub fn new(config: SagaConfig) -> Self {
        Self {
            steps: Self::build_steps(&config),
            config,
            events: EventLog::new(),
            clock: SystemClock::shared(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    fn build_steps(config: &SagaConfig) -> Vec<SagaStep> {
        config
            .steps
            .iter()
            .map(|name| SagaStep {
                name: name.clone(),
                status: StepStatus::Pending,
            })
            .collect()
    }

    fn log(&mut self, kind: &str, description: String, data: Value) {
        let now = self.clock.now_millis();
        self.events.record(now, kind, description, data);
    }

    pub fn steps(&self) -> &[SagaStep] {
        &self.steps
    }

    pub fn events(&self) -> &[Event] {
        self.events.events()
    }

    pub fn status(&self) -> SagaStatus {
        let has = |status| self.steps.iter().any(|s| s.status == status);
        let undoing = has(StepStatus::Failed) || has(StepStatus::Compensated);
        match (undoing, has(StepStatus::Completed)) {
            (true, true) => SagaStatus::Compensating,
            (true, false) => SagaStatus::Compensated,
            (false, _) if self.steps.iter().all(|s| s.status == StepStatus::Completed) => {
                SagaStatus::Completed
            }
            _ => SagaStatus::Running,
        }
    }

    /// First pending step while the saga is running forward.
    pub fn current_step(&self) -> Option<usize> {
        if self.status() != SagaStatus::Running {
            return None;
        }
        self.steps.iter().position(|s| s.status == StepStatus::Pending)
    }

    fn reject(&mut self, kind: &str, index: usize, reason: &str) -> bool {
        self.log(
            kind,
            format!("step {} rejected: {}", index, reason),
            json!({ "step": index, "reason": reason, "status": self.status() }),
        );
        false
    }

    /// Move a step from `from` to `to`, or log `failed_kind` and leave it.
    fn transition(&mut self, index: usize, from: StepStatus, to: StepStatus, failed_kind: &str) -> bool {
        match self.steps.get(index).map(|s| s.status) {
            None => self.reject(failed_kind, index, "no such step"),
            Some(status) if status != from => {
                let reason = format!("step is {:?}, expected {:?}", status, from);
                self.reject(failed_kind, index, &reason)
            }
            Some(_) => {
                self.steps[index].status = to;
                true
            }
        }
    }

    /// Mark any pending step completed. Ordering is up to the caller.
    pub fn complete_step(&mut self, index: usize) -> bool {
        if !self.transition(index, StepStatus::Pending, StepStatus::Completed, "complete_failed") {
            return false;
        }
        let name = self.steps[index].name.clone();
        self.log(
            "step_completed",
            format!("step '{}' completed", name),
            json!({ "step": index, "name": name }),
        );
        if self.status() == SagaStatus::Completed {
            tracing::info!(steps = self.steps.len(), "saga completed");
        }
        true
    }

    /// Mark a pending step failed. Compensation is not triggered.
    pub fn fail_step(&mut self, index: usize) -> bool {
        if !self.transition(index, StepStatus::Pending, StepStatus::Failed, "fail_failed") {
            return false;
        }
        let name = self.steps[index].name.clone();
        tracing::warn!(step = %name, "saga step failed");
        self.log(
            "step_failed",
            format!("step '{}' failed", name),
            json!({ "step": index, "name": name, "plan": self.compensation_plan() }),
        );
        true
    }

    /// Completed steps, most recent first: the order in which to undo them.
    pub fn compensation_plan(&self) -> Vec<usize> {
        (0..self.steps.len())
            .rev()
            .filter(|&i| self.steps[i].status == StepStatus::Completed)
            .collect()
    }

    /// Compensate any completed step.
    pub fn compensate_step(&mut self, index: usize) -> bool {
        if !self.transition(index, StepStatus::Completed, StepStatus::Compensated, "compensate_failed") {
            return false;
        }
        let name = self.steps[index].name.clone();
        self.log(
            "step_compensated",
            format!("step '{}' compensated", name),
            json!({ "step": index, "name": name }),
        );
        if self.status() == SagaStatus::Compensated {
            tracing::info!("saga fully compensated");
        }
        true
    }

    pub fn stats(&self) -> SagaStats {
        let count = |status| self.steps.iter().filter(|s| s.status == status).count();
        SagaStats {
            status: self.status(),
            steps: self.steps.clone(),
            completed: count(StepStatus::Completed),
            compensated: count(StepStatus::Compensated),
        }
    }

    pub fn reset(&mut self) {
        self.steps = Self::build_steps(&self.config);
        self.events.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn saga() -> Saga {
        Saga::new(SagaConfig::default())
    }

    #[test]
    fn test_happy_path() {
        let mut saga = saga();
        assert_eq!(saga.status(), SagaStatus::Running);
        for i in 0..3 {
            assert!(saga.complete_step(i));
        }
        assert_eq!(saga.status(), SagaStatus::Completed);
        assert_eq!(saga.compensation_plan(), vec![2, 1, 0]);
        assert_eq!(saga.current_step(), None);
    }

    #[test]
    fn test_steps_are_independently_markable() {
        let mut saga = saga();
        assert!(saga.complete_step(1));
        assert_eq!(saga.current_step(), Some(0));
        assert!(saga.compensate_step(1));
        assert_eq!(saga.steps()[1].status, StepStatus::Compensated);
        assert_eq!(saga.status(), SagaStatus::Compensated);

        assert!(saga.complete_step(2));
        assert_eq!(saga.status(), SagaStatus::Compensating);
        assert_eq!(saga.compensation_plan(), vec![2]);
    }

    #[test]
    fn test_invalid_transitions_are_rejected() {
        let mut saga = saga();
        assert!(!saga.compensate_step(0));
        assert!(saga.complete_step(0));
        assert!(!saga.complete_step(0));
        assert!(!saga.fail_step(0));
        assert!(!saga.complete_step(7));
        assert_eq!(saga.events().iter().filter(|e| e.kind.ends_with("_failed")).count(), 4);
        assert_eq!(saga.steps()[0].status, StepStatus::Completed);
    }

    #[test]
    fn test_failure_does_not_trigger_compensation() {
        let mut saga = saga();
        saga.complete_step(0);
        saga.complete_step(1);
        assert!(saga.fail_step(2));
        assert_eq!(saga.status(), SagaStatus::Compensating);
        assert_eq!(saga.stats().completed, 2);
        assert_eq!(saga.compensation_plan(), vec![1, 0]);

        assert!(saga.compensate_step(1));
        assert!(saga.compensate_step(0));
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert_eq!(saga.stats().compensated, 2);
        assert!(!saga.compensate_step(2));
    }

    #[test]
    fn test_first_step_failure_needs_no_compensation() {
        let mut saga = saga();
        saga.fail_step(0);
        assert_eq!(saga.status(), SagaStatus::Compensated);
        assert!(saga.compensation_plan().is_empty());

        saga.reset();
        assert_eq!(saga.status(), SagaStatus::Running);
        assert!(saga.events().is_empty());
    }
}
