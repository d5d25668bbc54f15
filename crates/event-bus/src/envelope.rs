use std::collections::HashMap;

use chrono::{DateTime, Utc};
use common::{CorrelationContext, OperationName, ServiceName};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message travelling over the event bus.
///
/// Carries the invocation (target service and operation with its payload)
/// along with the entity it concerns and the correlation ids that tie it to
/// the rest of the saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Unique identifier for this event.
    pub event_id: EventId,

    /// The type of the event (e.g., "saga.step.execute", "saga.completed").
    pub event_type: String,

    /// The service that emitted the event.
    pub source_service: ServiceName,

    /// The service expected to handle the event, if addressed.
    pub target_service: Option<ServiceName>,

    /// The type of entity the event concerns (e.g., "saga", "order").
    pub entity_type: String,

    /// The id of the entity the event concerns.
    pub entity_id: String,

    /// The operation to invoke on the target service.
    pub operation: Option<OperationName>,

    /// The event payload as JSON.
    pub payload: serde_json::Value,

    /// When the event was created.
    pub timestamp: DateTime<Utc>,

    pub correlation_id: String,
    pub trace_id: String,

    /// Additional metadata about the event.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelope {
    /// Creates a new envelope builder for the given event type and source.
    pub fn builder(event_type: impl Into<String>, source_service: ServiceName) -> EventEnvelopeBuilder {
        EventEnvelopeBuilder {
            event_type: event_type.into(),
            source_service,
            target_service: None,
            entity_type: String::new(),
            entity_id: String::new(),
            operation: None,
            payload: serde_json::Value::Object(serde_json::Map::new()),
            timestamp: None,
            correlation: None,
            metadata: HashMap::new(),
        }
    }

    /// Returns true if the envelope invokes `operation` on `service`.
    pub fn targets(&self, service: &str, operation: &str) -> bool {
        self.target_service.as_ref().map(ServiceName::as_str) == Some(service)
            && self.operation.as_ref().map(OperationName::as_str) == Some(operation)
    }
}

/// Builder for constructing event envelopes.
#[derive(Debug)]
pub struct EventEnvelopeBuilder {
    event_type: String,
    source_service: ServiceName,
    target_service: Option<ServiceName>,
    entity_type: String,
    entity_id: String,
    operation: Option<OperationName>,
    payload: serde_json::Value,
    timestamp: Option<DateTime<Utc>>,
    correlation: Option<CorrelationContext>,
    metadata: HashMap<String, serde_json::Value>,
}

impl EventEnvelopeBuilder {
    /// Sets the target service.
    pub fn target(mut self, service: ServiceName) -> Self {
        self.target_service = Some(service);
        self
    }

    /// Sets the entity the event concerns.
    pub fn entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = entity_type.into();
        self.entity_id = entity_id.into();
        self
    }

    /// Sets the operation to invoke.
    pub fn operation(mut self, operation: OperationName) -> Self {
        self.operation = Some(operation);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = serde_json::to_value(payload)?;
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Sets the timestamp. If not set, the current time will be used.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the correlation context. If not set, a fresh one is generated.
    pub fn correlation(mut self, correlation: &CorrelationContext) -> Self {
        self.correlation = Some(correlation.clone());
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds the event envelope.
    pub fn build(self) -> EventEnvelope {
        let correlation = self.correlation.unwrap_or_default();
        EventEnvelope {
            event_id: EventId::new(),
            event_type: self.event_type,
            source_service: self.source_service,
            target_service: self.target_service,
            entity_type: self.entity_type,
            entity_id: self.entity_id,
            operation: self.operation,
            payload: self.payload,
            timestamp: self.timestamp.unwrap_or_else(Utc::now),
            correlation_id: correlation.correlation_id,
            trace_id: correlation.trace_id,
            metadata: self.metadata,
        }
    }
}
