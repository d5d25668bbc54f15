//! Consistency coordinator error types.

use event_bus::EventBusError;
use state_store::StateStoreError;
use thiserror::Error;

use crate::validation::ValidationReport;
use crate::version::Version;

/// Boxed error returned by caller-supplied update functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can occur during consistency operations.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    /// The entity's version no longer matches what the caller read.
    #[error("Version conflict for {entity}: expected version {expected}, found {actual}")]
    VersionConflict {
        entity: String,
        expected: Version,
        actual: Version,
    },

    /// Another holder owns the entity's advisory lock.
    #[error("Entity {entity} is locked by {holder}")]
    LockHeld { entity: String, holder: String },

    /// Entity type or id was empty.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The caller's update function returned an error.
    #[error("Update of {entity} failed: {source}")]
    UpdateFailed {
        entity: String,
        #[source]
        source: BoxError,
    },

    /// One or more services did not confirm their view of an entity.
    #[error("Consistency validation failed: {report}")]
    ValidationFailed { report: ValidationReport },

    /// State store error.
    #[error("State store error: {0}")]
    Store(#[from] StateStoreError),

    /// Event bus error.
    #[error("Event bus error: {0}")]
    Bus(#[from] EventBusError),
}

impl ConsistencyError {
    /// Returns true for errors a caller can resolve by re-reading and
    /// resubmitting.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ConsistencyError::VersionConflict { .. } | ConsistencyError::LockHeld { .. }
        )
    }
}

/// Result type for consistency operations.
pub type Result<T> = std::result::Result<T, ConsistencyError>;
