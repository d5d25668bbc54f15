//! Cross-service consistency assertions and their combined report.

use std::time::Duration;

use common::{CorrelationContext, OperationName, ServiceName};
use event_bus::{EventEnvelope, EventId};
use serde::{Deserialize, Serialize};

/// Event type published to each service asked to validate.
pub const VALIDATE_EVENT: &str = "consistency.validate";

/// Operation name carried by validation requests.
pub const VALIDATE_OPERATION: &str = "validate";

const DEFAULT_TOLERANCE: Duration = Duration::from_secs(5);

/// Asserts that a service's view of an entity matches `expected_data`
/// within a time window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistencyValidation {
    pub entity_type: String,
    pub entity_id: String,
    pub service_name: ServiceName,
    pub expected_data: serde_json::Value,
    pub tolerance: Duration,
}

impl ConsistencyValidation {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        service_name: ServiceName,
        expected_data: serde_json::Value,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            service_name,
            expected_data,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Builds the validation request sent to `service_name`.
    pub fn to_envelope(&self, source: &ServiceName, correlation: &CorrelationContext) -> EventEnvelope {
        let builder = EventEnvelope::builder(VALIDATE_EVENT, source.clone())
            .target(self.service_name.clone())
            .entity(self.entity_type.clone(), self.entity_id.clone())
            .payload_raw(serde_json::json!({
                "entity_type": self.entity_type,
                "entity_id": self.entity_id,
                "expected_data": self.expected_data,
                "tolerance_ms": u64::try_from(self.tolerance.as_millis()).unwrap_or(u64::MAX),
            }))
            .correlation(correlation);
        match OperationName::new(VALIDATE_OPERATION) {
            Ok(operation) => builder.operation(operation).build(),
            Err(_) => builder.build(),
        }
    }
}

/// Outcome of one validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub entity_type: String,
    pub entity_id: String,
    pub service_name: ServiceName,
    /// Id of the acknowledged request, when it was accepted.
    pub event_id: Option<EventId>,
    pub error: Option<String>,
}

impl ValidationResult {
    pub(crate) fn consistent(validation: &ConsistencyValidation, event_id: EventId) -> Self {
        Self {
            entity_type: validation.entity_type.clone(),
            entity_id: validation.entity_id.clone(),
            service_name: validation.service_name.clone(),
            event_id: Some(event_id),
            error: None,
        }
    }

    pub(crate) fn mismatch(validation: &ConsistencyValidation, error: impl Into<String>) -> Self {
        Self {
            entity_type: validation.entity_type.clone(),
            entity_id: validation.entity_id.clone(),
            service_name: validation.service_name.clone(),
            event_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_consistent(&self) -> bool {
        self.error.is_none()
    }
}

impl std::fmt::Display for ValidationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} @ {}: ",
            self.entity_type, self.entity_id, self.service_name
        )?;
        match &self.error {
            None => f.write_str("consistent"),
            Some(error) => write!(f, "mismatch ({error})"),
        }
    }
}

/// Every outcome of one validation run, in request order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub results: Vec<ValidationResult>,
}

impl ValidationReport {
    pub fn new(results: Vec<ValidationResult>) -> Self {
        Self { results }
    }

    pub fn is_consistent(&self) -> bool {
        self.results.iter().all(ValidationResult::is_consistent)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ValidationResult> {
        self.results.iter().filter(|r| !r.is_consistent())
    }
}

impl std::fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} of {} entities inconsistent",
            self.failures().count(),
            self.results.len()
        )?;
        for (i, result) in self.results.iter().enumerate() {
            f.write_str(if i == 0 { ": " } else { "; " })?;
            write!(f, "{result}")?;
        }
        Ok(())
    }
}
