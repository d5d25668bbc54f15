//! Saga status state machine.

use serde::{Deserialize, Serialize};

/// The status of a saga execution in its lifecycle.
///
/// State transitions:
/// ```text
/// Pending ──► Executing ──┬──► Completed
///                         └──► Failed ──► Compensating ──► Compensated
/// ```
///
/// A saga whose compensation fails stays in `Compensating` and needs
/// operator intervention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SagaStatus {
    /// Saga record created, run not started yet.
    #[default]
    Pending,

    /// Saga steps are being executed.
    Executing,

    /// All steps completed successfully (terminal state).
    Completed,

    /// A step failed; compensation has not started yet.
    Failed,

    /// Compensating transactions are in progress, or halted on a failure.
    Compensating,

    /// Compensation finished after a failure (terminal state).
    Compensated,
}

impl SagaStatus {
    /// Returns true if the saga can begin executing steps.
    pub fn can_execute(&self) -> bool {
        matches!(self, SagaStatus::Pending)
    }

    /// Returns true if the saga can begin compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaStatus::Failed)
    }

    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Compensated)
    }

    /// Returns true if the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        matches!(
            (self, next),
            (SagaStatus::Pending, SagaStatus::Executing)
                | (SagaStatus::Executing, SagaStatus::Completed)
                | (SagaStatus::Executing, SagaStatus::Failed)
                | (SagaStatus::Failed, SagaStatus::Compensating)
                | (SagaStatus::Compensating, SagaStatus::Compensated)
        )
    }

    /// Returns the state name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::Pending => "pending",
            SagaStatus::Executing => "executing",
            SagaStatus::Completed => "completed",
            SagaStatus::Failed => "failed",
            SagaStatus::Compensating => "compensating",
            SagaStatus::Compensated => "compensated",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
