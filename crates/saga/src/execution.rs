//! Saga execution records.
//!
//! A [`SagaExecution`] is the mutable aggregate for one saga run. All
//! mutation goes through methods that enforce the state machine and the
//! prefix invariant on `completed_steps`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CorrelationContext, SagaId};
use serde::{Deserialize, Serialize};

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::state::SagaStatus;

/// Outcome of a single step (or compensation) invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
}

/// Result of running one saga step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub executed_at: DateTime<Utc>,
    pub duration: Duration,
    pub attempts: u32,
}

impl SagaStepResult {
    /// A successful step result.
    pub fn completed(
        step_id: impl Into<String>,
        result: serde_json::Value,
        executed_at: DateTime<Utc>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Completed,
            result: Some(result),
            error: None,
            executed_at,
            duration,
            attempts,
        }
    }

    /// A failed step result.
    pub fn failed(
        step_id: impl Into<String>,
        error: impl Into<String>,
        executed_at: DateTime<Utc>,
        duration: Duration,
        attempts: u32,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            result: None,
            error: Some(error.into()),
            executed_at,
            duration,
            attempts,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Completed
    }
}

/// Sub-status of a compensation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompensationStatus {
    Running,
    Completed,
    Failed,
}

/// Progress of undoing a failed saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationExecution {
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Steps undone so far, in reverse original order.
    pub compensated_steps: Vec<String>,
    /// Completed steps that declared no compensation operation.
    pub skipped_steps: Vec<String>,
    pub status: CompensationStatus,
    pub error_message: Option<String>,
}

impl CompensationExecution {
    fn start() -> Self {
        Self {
            started_at: Utc::now(),
            completed_at: None,
            compensated_steps: Vec::new(),
            skipped_steps: Vec::new(),
            status: CompensationStatus::Running,
            error_message: None,
        }
    }
}

/// The mutable record of one saga run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaExecution {
    saga_id: SagaId,
    definition: Arc<SagaDefinition>,
    status: SagaStatus,
    current_step: usize,
    completed_steps: Vec<String>,
    failed_step: Option<SagaStepResult>,
    started_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    compensation: Option<CompensationExecution>,
    correlation: CorrelationContext,
}

impl SagaExecution {
    /// Creates a pending execution for the given definition.
    pub fn new(definition: Arc<SagaDefinition>, correlation: CorrelationContext) -> Self {
        Self {
            saga_id: definition.id,
            definition,
            status: SagaStatus::Pending,
            current_step: 0,
            completed_steps: Vec::new(),
            failed_step: None,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            compensation: None,
            correlation,
        }
    }

    /// Store key under which executions are persisted.
    pub fn storage_key(saga_id: SagaId) -> String {
        format!("saga:{saga_id}")
    }

    /// Moves to `next`, enforcing the state machine.
    pub fn transition_to(&mut self, next: SagaStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(SagaError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Marks the start of the step at `index`.
    pub fn begin_step(&mut self, index: usize) {
        self.current_step = self.current_step.max(index);
    }

    /// Appends a completed step, which must be the next one in definition order.
    pub fn record_step_completed(&mut self, step_id: &str) -> Result<()> {
        let expected = self
            .definition
            .steps
            .get(self.completed_steps.len())
            .map(|s| s.step_id.clone());
        if self.status != SagaStatus::Executing || expected.as_deref() != Some(step_id) {
            return Err(SagaError::OutOfOrderStep {
                step_id: step_id.to_string(),
                expected,
            });
        }
        self.completed_steps.push(step_id.to_string());
        self.current_step = self.current_step.max(self.completed_steps.len());
        Ok(())
    }

    /// Records the failing step and moves to `Failed`.
    pub fn record_failure(&mut self, result: SagaStepResult) -> Result<()> {
        self.transition_to(SagaStatus::Failed)?;
        self.error_message = Some(format!(
            "step '{}' failed: {}",
            result.step_id,
            result.error.as_deref().unwrap_or("unknown error")
        ));
        self.failed_step = Some(result);
        Ok(())
    }

    /// Moves to `Compensating` and opens a running compensation record.
    pub fn begin_compensation(&mut self) -> Result<()> {
        self.transition_to(SagaStatus::Compensating)?;
        self.compensation = Some(CompensationExecution::start());
        Ok(())
    }

    /// Records that `step_id` was undone.
    pub fn record_step_compensated(&mut self, step_id: &str) {
        if let Some(compensation) = self.compensation.as_mut() {
            compensation.compensated_steps.push(step_id.to_string());
        }
    }

    /// Records that `step_id` needed no undo.
    pub fn record_step_skipped(&mut self, step_id: &str) {
        if let Some(compensation) = self.compensation.as_mut() {
            compensation.skipped_steps.push(step_id.to_string());
        }
    }

    /// Halts compensation with an error; the saga stays `Compensating`.
    pub fn fail_compensation(&mut self, error: impl Into<String>) {
        let error = error.into();
        if let Some(compensation) = self.compensation.as_mut() {
            compensation.status = CompensationStatus::Failed;
            compensation.completed_at = Some(Utc::now());
            compensation.error_message = Some(error.clone());
        }
        self.error_message = Some(match self.error_message.take() {
            Some(original) => format!("{original}; compensation failed: {error}"),
            None => format!("compensation failed: {error}"),
        });
    }

    /// Finishes compensation successfully and moves to `Compensated`.
    pub fn complete_compensation(&mut self) -> Result<()> {
        self.transition_to(SagaStatus::Compensated)?;
        if let Some(compensation) = self.compensation.as_mut() {
            compensation.status = CompensationStatus::Completed;
            compensation.completed_at = self.completed_at;
        }
        Ok(())
    }
}

// Query methods
impl SagaExecution {
    pub fn saga_id(&self) -> SagaId {
        self.saga_id
    }

    pub fn definition(&self) -> &Arc<SagaDefinition> {
        &self.definition
    }

    pub fn status(&self) -> SagaStatus {
        self.status
    }

    /// Index of the step most recently started.
    pub fn current_step(&self) -> usize {
        self.current_step
    }

    /// Ids of the steps that completed, in execution order.
    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    pub fn failed_step(&self) -> Option<&SagaStepResult> {
        self.failed_step.as_ref()
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    pub fn compensation(&self) -> Option<&CompensationExecution> {
        self.compensation.as_ref()
    }

    pub fn correlation(&self) -> &CorrelationContext {
        &self.correlation
    }

    /// Returns true once the saga reached `Completed` or `Compensated`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if compensation halted on a failure and needs an operator.
    pub fn requires_intervention(&self) -> bool {
        self.status == SagaStatus::Compensating
            && self
                .compensation
                .as_ref()
                .is_some_and(|c| c.status == CompensationStatus::Failed)
    }
}
