use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::{EventBus, EventBusError, EventEnvelope, Result};

#[derive(Debug, Clone)]
struct FailureRule {
    service: String,
    operation: String,
    /// None fails forever.
    remaining: Option<u32>,
    reason: String,
}

#[derive(Debug, Default)]
struct InMemoryBusState {
    delivered: Vec<EventEnvelope>,
    attempts: Vec<EventEnvelope>,
    failures: Vec<FailureRule>,
    latencies: HashMap<(String, String), Duration>,
    unavailable: bool,
}

/// In-memory event bus for testing.
///
/// Acknowledges every publish unless a failure rule matches the envelope's
/// target service and operation. Every attempt is recorded, and delivered
/// envelopes are kept in publish order.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventBus {
    state: Arc<Mutex<InMemoryBusState>>,
}

impl InMemoryEventBus {
    /// Creates a new in-memory event bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails every publish to `service`/`operation`.
    pub async fn fail_always(&self, service: &str, operation: &str, reason: &str) {
        self.push_rule(service, operation, None, reason).await;
    }

    /// Fails the next `times` publishes to `service`/`operation`, then acknowledges.
    pub async fn fail_times(&self, service: &str, operation: &str, times: u32, reason: &str) {
        self.push_rule(service, operation, Some(times), reason).await;
    }

    /// Delays the acknowledgment of publishes to `service`/`operation`.
    pub async fn set_latency(&self, service: &str, operation: &str, latency: Duration) {
        self.state
            .lock()
            .await
            .latencies
            .insert((service.to_string(), operation.to_string()), latency);
    }

    /// Makes every publish fail with `Unavailable` while set.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Removes all failure rules and latencies.
    pub async fn reset_faults(&self) {
        let mut state = self.state.lock().await;
        state.failures.clear();
        state.latencies.clear();
        state.unavailable = false;
    }

    /// Returns every acknowledged envelope in publish order.
    pub async fn delivered(&self) -> Vec<EventEnvelope> {
        self.state.lock().await.delivered.clone()
    }

    /// Returns acknowledged envelopes of the given type.
    pub async fn delivered_of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.state
            .lock()
            .await
            .delivered
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    /// Returns the number of publish attempts (acknowledged or not) for
    /// `service`/`operation`.
    pub async fn attempt_count(&self, service: &str, operation: &str) -> usize {
        self.state
            .lock()
            .await
            .attempts
            .iter()
            .filter(|e| e.targets(service, operation))
            .count()
    }

    async fn push_rule(&self, service: &str, operation: &str, remaining: Option<u32>, reason: &str) {
        self.state.lock().await.failures.push(FailureRule {
            service: service.to_string(),
            operation: operation.to_string(),
            remaining,
            reason: reason.to_string(),
        });
    }
}

fn route(event: &EventEnvelope) -> (String, String) {
    (
        event
            .target_service
            .as_ref()
            .map(|s| s.as_str().to_string())
            .unwrap_or_default(),
        event
            .operation
            .as_ref()
            .map(|o| o.as_str().to_string())
            .unwrap_or_default(),
    )
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, event: EventEnvelope) -> Result<()> {
        let (service, operation) = route(&event);

        let latency = {
            let mut state = self.state.lock().await;
            state.attempts.push(event.clone());
            if state.unavailable {
                return Err(EventBusError::Unavailable(
                    "in-memory bus marked unavailable".to_string(),
                ));
            }
            state
                .latencies
                .get(&(service.clone(), operation.clone()))
                .copied()
        };

        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        let rule = state
            .failures
            .iter_mut()
            .find(|r| r.service == service && r.operation == operation && r.remaining != Some(0));
        if let Some(rule) = rule {
            if let Some(remaining) = rule.remaining.as_mut() {
                *remaining -= 1;
            }
            tracing::debug!(%service, %operation, reason = %rule.reason, "publish failed by rule");
            return Err(EventBusError::DeliveryFailed {
                target: format!("{service}/{operation}"),
                reason: rule.reason.clone(),
            });
        }

        state.delivered.push(event);
        Ok(())
    }
}
