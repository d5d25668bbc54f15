//! Coordinator configuration loaded from environment variables.

use std::time::Duration;

use common::ServiceName;

const DEFAULT_LOCK_TTL_MS: u64 = 30_000;
const DEFAULT_SOURCE_SERVICE: &str = "consistency-coordinator";

/// Consistency coordinator configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `CONSISTENCY_LOCK_TTL_MS`: lifetime of an advisory lock if never released (default: `30000`)
/// - `CONSISTENCY_LOCK_OWNER`: identity recorded as `locked_by` (default: `consistency-coordinator-<uuid>`)
/// - `CONSISTENCY_SOURCE_SERVICE`: service name stamped on validation events (default: `"consistency-coordinator"`)
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub lock_ttl: Duration,
    pub lock_owner: String,
    pub source_service: ServiceName,
}

impl CoordinatorConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            lock_ttl: lookup("CONSISTENCY_LOCK_TTL_MS")
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_ttl),
            lock_owner: lookup("CONSISTENCY_LOCK_OWNER")
                .filter(|v| !v.trim().is_empty())
                .unwrap_or(defaults.lock_owner),
            source_service: lookup("CONSISTENCY_SOURCE_SERVICE")
                .and_then(|v| ServiceName::new(v).ok())
                .unwrap_or(defaults.source_service),
        }
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_millis(DEFAULT_LOCK_TTL_MS),
            lock_owner: format!("consistency-coordinator-{}", uuid::Uuid::new_v4()),
            source_service: default_source_service(),
        }
    }
}

fn default_source_service() -> ServiceName {
    match ServiceName::new(DEFAULT_SOURCE_SERVICE) {
        Ok(name) => name,
        Err(err) => unreachable!("default source service is valid: {err}"),
    }
}
