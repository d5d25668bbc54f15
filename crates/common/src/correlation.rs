//! Correlation and trace identifiers propagated on every emitted event.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifiers that stitch causally related operations together.
///
/// The correlation id groups every event belonging to one logical
/// operation (one saga run); the trace id is handed to observability
/// tooling unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationContext {
    pub correlation_id: String,
    pub trace_id: String,
}

impl CorrelationContext {
    /// Generates a fresh context with random ids.
    pub fn new() -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            trace_id: Uuid::new_v4().simple().to_string(),
        }
    }

    /// Builds a context from ids supplied by an upstream caller.
    pub fn from_parts(correlation_id: impl Into<String>, trace_id: impl Into<String>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            trace_id: trace_id.into(),
        }
    }
}

impl Default for CorrelationContext {
    fn default() -> Self {
        Self::new()
    }
}
