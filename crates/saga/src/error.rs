//! Saga error types.

use common::{IdentifierError, SagaId};
use event_bus::EventBusError;
use state_store::StateStoreError;
use thiserror::Error;

use crate::state::SagaStatus;

/// Errors that can occur during saga operations.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The saga definition failed validation.
    #[error("Invalid saga definition: {0}")]
    InvalidDefinition(String),

    /// A service or operation name failed validation.
    #[error("Invalid identifier: {0}")]
    Identifier(#[from] IdentifierError),

    /// Saga is in an invalid state for the requested transition.
    #[error("Invalid saga transition: {from} -> {to}")]
    InvalidTransition { from: SagaStatus, to: SagaStatus },

    /// A step was reported complete out of definition order.
    #[error("Step '{step_id}' completed out of order: expected {expected:?}")]
    OutOfOrderStep {
        step_id: String,
        expected: Option<String>,
    },

    /// An execution already exists for this saga id.
    #[error("Saga already started: {0}")]
    AlreadyStarted(SagaId),

    /// No execution exists for the given saga.
    #[error("Saga not found: {0}")]
    SagaNotFound(SagaId),

    /// The saga's run task ended abnormally.
    #[error("Saga task for {saga_id} failed: {reason}")]
    TaskFailed { saga_id: SagaId, reason: String },

    /// State store error.
    #[error("State store error: {0}")]
    StateStore(#[from] StateStoreError),

    /// Event bus error.
    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
