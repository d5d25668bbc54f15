//! Events the saga engine puts on the bus.

use chrono::{DateTime, Utc};
use common::{CorrelationContext, OperationName, SagaId, ServiceName};
use event_bus::{EventBus, EventEnvelope};
use serde::{Deserialize, Serialize};

use crate::definition::SagaStep;

/// Entity type stamped on every saga envelope.
pub const SAGA_ENTITY_TYPE: &str = "saga";

/// Invokes a step's forward operation.
pub const STEP_EXECUTE: &str = "saga.step.execute";

/// Invokes a step's compensating operation.
pub const STEP_COMPENSATE: &str = "saga.step.compensate";

pub const SAGA_COMPLETED: &str = "saga.completed";
pub const SAGA_COMPENSATED: &str = "saga.compensated";

/// Lifecycle notifications emitted when a saga reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaLifecycleEvent {
    /// All steps completed.
    Completed(SagaCompletedData),

    /// A step failed and every compensable step was undone.
    Compensated(SagaCompensatedData),
}

/// Data for the saga.completed event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompletedData {
    pub saga_id: SagaId,
    pub saga_name: String,
    pub completed_steps: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

/// Data for the saga.compensated event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompensatedData {
    pub saga_id: SagaId,
    pub saga_name: String,
    pub failed_step: Option<String>,
    pub compensated_steps: Vec<String>,
    pub compensated_at: DateTime<Utc>,
}

impl SagaLifecycleEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            SagaLifecycleEvent::Completed(_) => SAGA_COMPLETED,
            SagaLifecycleEvent::Compensated(_) => SAGA_COMPENSATED,
        }
    }

    fn saga_id(&self) -> SagaId {
        match self {
            SagaLifecycleEvent::Completed(data) => data.saga_id,
            SagaLifecycleEvent::Compensated(data) => data.saga_id,
        }
    }

    /// Wraps the event in a bus envelope.
    pub fn to_envelope(
        &self,
        source: &ServiceName,
        correlation: &CorrelationContext,
    ) -> Result<EventEnvelope, serde_json::Error> {
        Ok(EventEnvelope::builder(self.event_type(), source.clone())
            .entity(SAGA_ENTITY_TYPE, self.saga_id().to_string())
            .payload(self)?
            .correlation(correlation)
            .build())
    }
}

/// Publishes a lifecycle event without letting a failure propagate.
///
/// The saga's status is already persisted when this runs; a lost
/// notification is logged and counted, never reverted.
pub async fn emit_lifecycle<B: EventBus + ?Sized>(
    bus: &B,
    source: &ServiceName,
    event: &SagaLifecycleEvent,
    correlation: &CorrelationContext,
) {
    let envelope = match event.to_envelope(source, correlation) {
        Ok(envelope) => envelope,
        Err(err) => {
            tracing::warn!(event_type = event.event_type(), error = %err, "failed to encode lifecycle event");
            return;
        }
    };
    if let Err(err) = bus.publish(envelope).await {
        metrics::counter!("saga_lifecycle_emit_failures_total").increment(1);
        tracing::warn!(
            event_type = event.event_type(),
            saga_id = %event.saga_id(),
            error = %err,
            "failed to emit lifecycle event"
        );
    }
}

/// Builds the envelope that invokes a step's forward operation.
pub fn step_invocation(
    source: &ServiceName,
    saga_id: SagaId,
    step: &SagaStep,
    attempt: u32,
    correlation: &CorrelationContext,
) -> EventEnvelope {
    invocation(
        STEP_EXECUTE,
        source,
        saga_id,
        step,
        step.operation.clone(),
        step.data.clone(),
        attempt,
        correlation,
    )
}

/// Builds the envelope that invokes `operation` to undo a step.
pub fn compensation_invocation(
    source: &ServiceName,
    saga_id: SagaId,
    step: &SagaStep,
    operation: &OperationName,
    attempt: u32,
    correlation: &CorrelationContext,
) -> EventEnvelope {
    let data = step
        .compensation_data
        .clone()
        .unwrap_or_else(|| serde_json::Value::Object(serde_json::Map::new()));
    invocation(
        STEP_COMPENSATE,
        source,
        saga_id,
        step,
        operation.clone(),
        data,
        attempt,
        correlation,
    )
}

#[allow(clippy::too_many_arguments)]
fn invocation(
    event_type: &str,
    source: &ServiceName,
    saga_id: SagaId,
    step: &SagaStep,
    operation: OperationName,
    data: serde_json::Value,
    attempt: u32,
    correlation: &CorrelationContext,
) -> EventEnvelope {
    EventEnvelope::builder(event_type, source.clone())
        .target(step.target_service.clone())
        .entity(SAGA_ENTITY_TYPE, saga_id.to_string())
        .operation(operation)
        .payload_raw(data)
        .correlation(correlation)
        .metadata("step_id", serde_json::Value::String(step.step_id.clone()))
        .metadata("attempt", serde_json::Value::from(attempt))
        .build()
}
