//! Saga orchestration for multi-service distributed transactions.
//!
//! A saga is an ordered list of steps, each invoking an operation on a
//! remote service over the event bus. Steps run strictly in order with
//! per-step retry and deadlines. When a step fails, every completed step
//! that declares a compensating operation is undone in reverse order.
//!
//! Every status change is persisted to the state store before the run
//! moves on, and mirrored into an in-process [`SagaRegistry`] for fast
//! lookups.

pub mod compensation;
pub mod config;
pub mod definition;
pub mod error;
pub mod events;
pub mod execution;
pub mod executor;
pub mod options;
pub mod orchestrator;
pub mod registry;
pub mod retry;
pub mod state;

pub use compensation::CompensationEngine;
pub use config::EngineConfig;
pub use definition::{DEFAULT_SAGA_TIMEOUT, SagaDefinition, SagaDefinitionBuilder, SagaStep};
pub use error::{Result, SagaError};
pub use events::{SagaCompensatedData, SagaCompletedData, SagaLifecycleEvent};
pub use execution::{
    CompensationExecution, CompensationStatus, SagaExecution, SagaStepResult, StepStatus,
};
pub use executor::{StepContext, StepExecutor};
pub use options::{ConsistencyLevel, TransactionOptions};
pub use orchestrator::{SagaHandle, SagaOrchestrator};
pub use registry::{ExecutionRecorder, SagaRegistry};
pub use retry::RetryPolicy;
pub use state::SagaStatus;
