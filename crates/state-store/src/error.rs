use thiserror::Error;

use crate::ETag;

/// Errors that can occur when interacting with the state store.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// A write or delete carried an etag that no longer matches the stored entry.
    #[error("Etag mismatch for key {key}: expected {expected}, found {actual:?}")]
    EtagMismatch {
        key: String,
        expected: ETag,
        actual: Option<ETag>,
    },

    /// A first-write-wins save found the key already present.
    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    /// The key was empty.
    #[error("Invalid key: {0:?}")]
    InvalidKey(String),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backing store could not be reached.
    #[error("State store unavailable: {0}")]
    Unavailable(String),
}

impl StateStoreError {
    /// Returns true if the error is an optimistic-concurrency rejection.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            StateStoreError::EtagMismatch { .. } | StateStoreError::AlreadyExists(_)
        )
    }
}

/// Result type for state store operations.
pub type Result<T> = std::result::Result<T, StateStoreError>;
