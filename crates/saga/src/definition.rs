//! Saga definitions: the immutable, ordered description of a saga.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{OperationName, SagaId, ServiceName};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::retry::RetryPolicy;

/// Overall saga timeout used when a definition does not set one.
pub const DEFAULT_SAGA_TIMEOUT: Duration = Duration::from_secs(30);

/// One forward step of a saga and its optional undo operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStep {
    /// Unique within the owning definition.
    pub step_id: String,
    pub name: String,
    pub target_service: ServiceName,
    pub operation: OperationName,
    pub data: serde_json::Value,
    pub compensation_operation: Option<OperationName>,
    pub compensation_data: Option<serde_json::Value>,
    /// Falls back to the transaction timeout when unset.
    pub timeout: Option<Duration>,
    /// Falls back to [`RetryPolicy::default`] when unset.
    pub retry_policy: Option<RetryPolicy>,
}

impl SagaStep {
    /// Creates a step invoking `operation` on `target_service`.
    pub fn new(
        step_id: impl Into<String>,
        target_service: ServiceName,
        operation: OperationName,
    ) -> Self {
        let step_id = step_id.into();
        Self {
            name: step_id.clone(),
            step_id,
            target_service,
            operation,
            data: serde_json::Value::Object(serde_json::Map::new()),
            compensation_operation: None,
            compensation_data: None,
            timeout: None,
            retry_policy: None,
        }
    }

    /// Creates a step from raw service and operation names, validating both.
    pub fn parse(step_id: impl Into<String>, target_service: &str, operation: &str) -> Result<Self> {
        Ok(Self::new(
            step_id,
            ServiceName::new(target_service)?,
            OperationName::new(operation)?,
        ))
    }

    /// Sets a human-readable name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the forward payload.
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Declares the operation that undoes this step.
    pub fn with_compensation(mut self, operation: OperationName, data: serde_json::Value) -> Self {
        self.compensation_operation = Some(operation);
        self.compensation_data = Some(data);
        self
    }

    /// Sets a step-scoped timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets a step-specific retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Returns true if the step declares a compensating operation.
    pub fn is_compensable(&self) -> bool {
        self.compensation_operation.is_some()
    }

    /// The retry policy in force for this step.
    pub fn effective_retry_policy(&self) -> RetryPolicy {
        self.retry_policy.unwrap_or_default()
    }
}

/// Immutable description of an ordered list of saga steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaDefinition {
    pub id: SagaId,
    pub name: String,
    pub steps: Vec<SagaStep>,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl SagaDefinition {
    /// Starts building a definition with a fresh id.
    pub fn builder(name: impl Into<String>) -> SagaDefinitionBuilder {
        SagaDefinitionBuilder {
            id: SagaId::new(),
            name: name.into(),
            steps: Vec::new(),
            timeout: DEFAULT_SAGA_TIMEOUT,
            metadata: HashMap::new(),
        }
    }

    /// Checks the structural rules every submitted definition must satisfy.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SagaError::InvalidDefinition(
                "saga name must not be empty".to_string(),
            ));
        }
        if self.steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "saga '{}' has no steps",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_id.trim().is_empty() {
                return Err(SagaError::InvalidDefinition(format!(
                    "saga '{}' has a step with an empty id",
                    self.name
                )));
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "duplicate step id '{}'",
                    step.step_id
                )));
            }
            if step.timeout.is_some_and(|t| t.is_zero()) {
                return Err(SagaError::InvalidDefinition(format!(
                    "step '{}' has a zero timeout",
                    step.step_id
                )));
            }
        }
        Ok(())
    }

    /// Looks up a step by id.
    pub fn step(&self, step_id: &str) -> Option<&SagaStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// Position of a step in definition order.
    pub fn position(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.step_id == step_id)
    }
}

/// Builder for [`SagaDefinition`].
#[derive(Debug)]
pub struct SagaDefinitionBuilder {
    id: SagaId,
    name: String,
    steps: Vec<SagaStep>,
    timeout: Duration,
    metadata: HashMap<String, serde_json::Value>,
}

impl SagaDefinitionBuilder {
    /// Uses a caller-chosen id instead of a generated one.
    pub fn id(mut self, id: SagaId) -> Self {
        self.id = id;
        self
    }

    /// Appends a step.
    pub fn step(mut self, step: SagaStep) -> Self {
        self.steps.push(step);
        self
    }

    /// Sets the overall nominal timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Adds a metadata entry.
    pub fn metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Builds and validates the definition.
    pub fn build(self) -> Result<SagaDefinition> {
        let definition = SagaDefinition {
            id: self.id,
            name: self.name,
            steps: self.steps,
            timeout: self.timeout,
            created_at: Utc::now(),
            metadata: self.metadata,
        };
        definition.validate()?;
        Ok(definition)
    }
}
