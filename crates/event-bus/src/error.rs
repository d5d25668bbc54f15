use thiserror::Error;

/// Errors that can occur when publishing to the event bus.
#[derive(Debug, Clone, Error)]
pub enum EventBusError {
    /// The bus did not acknowledge delivery.
    #[error("Delivery to {target} failed: {reason}")]
    DeliveryFailed { target: String, reason: String },

    /// The target rejected the message on receipt.
    #[error("Rejected by {target}: {reason}")]
    Rejected { target: String, reason: String },

    /// The bus could not be reached.
    #[error("Event bus unavailable: {0}")]
    Unavailable(String),

    /// The envelope payload could not be serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for EventBusError {
    fn from(err: serde_json::Error) -> Self {
        EventBusError::Serialization(err.to_string())
    }
}

/// Result type for event bus operations.
pub type Result<T> = std::result::Result<T, EventBusError>;
