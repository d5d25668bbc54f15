use async_trait::async_trait;

use crate::{EventEnvelope, Result};

/// Core trait for event bus implementations.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes an envelope and waits for the bus-level acknowledgment.
    async fn publish(&self, event: EventEnvelope) -> Result<()>;
}
