//! Per-transaction options.

use std::time::Duration;

use common::CorrelationContext;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;

/// Consistency the caller expects from the transaction's persisted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyLevel {
    #[default]
    Eventual,
    Strong,
}

/// Options applied to one `execute_distributed_transaction` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionOptions {
    pub consistency_level: ConsistencyLevel,
    /// Nominal saga timeout; also the fallback deadline for steps without one.
    pub timeout: Duration,
    /// Deadline for the whole compensation pass.
    pub compensation_timeout: Duration,
    /// Correlation ids for emitted events; generated when absent.
    pub correlation: Option<CorrelationContext>,
}

impl TransactionOptions {
    /// Options derived from engine configuration.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            consistency_level: ConsistencyLevel::Eventual,
            timeout: config.default_timeout,
            compensation_timeout: config.compensation_timeout,
            correlation: None,
        }
    }

    /// Sets the consistency level.
    pub fn consistency(mut self, level: ConsistencyLevel) -> Self {
        self.consistency_level = level;
        self
    }

    /// Sets the nominal timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the compensation timeout.
    pub fn compensation_timeout(mut self, timeout: Duration) -> Self {
        self.compensation_timeout = timeout;
        self
    }

    /// Propagates an upstream correlation context.
    pub fn correlation(mut self, correlation: CorrelationContext) -> Self {
        self.correlation = Some(correlation);
        self
    }
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}
