//! Shared types for the saga orchestration and consistency engine.

pub mod correlation;
pub mod identifier;
pub mod types;

pub use correlation::CorrelationContext;
pub use identifier::{IdentifierError, OperationName, ServiceName};
pub use types::SagaId;
