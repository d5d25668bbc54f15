//! Engine configuration loaded from environment variables.

use std::time::Duration;

use common::ServiceName;

const DEFAULT_SOURCE_SERVICE: &str = "saga-orchestrator";
const DEFAULT_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_COMPENSATION_TIMEOUT_MS: u64 = 60_000;

/// Saga engine configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `SAGA_SOURCE_SERVICE` — service name stamped on emitted events (default: `"saga-orchestrator"`)
/// - `SAGA_DEFAULT_TIMEOUT_MS` — transaction/step timeout fallback (default: `30000`)
/// - `SAGA_COMPENSATION_TIMEOUT_MS` — compensation pass deadline (default: `60000`)
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub source_service: ServiceName,
    pub default_timeout: Duration,
    pub compensation_timeout: Duration,
}

impl EngineConfig {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Loads configuration through an arbitrary key lookup.
    ///
    /// Unparseable or invalid values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, fallback: Duration| {
            lookup(key)
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or(fallback)
        };

        Self {
            source_service: lookup("SAGA_SOURCE_SERVICE")
                .and_then(|v| ServiceName::new(v).ok())
                .unwrap_or(defaults.source_service),
            default_timeout: millis("SAGA_DEFAULT_TIMEOUT_MS", defaults.default_timeout),
            compensation_timeout: millis(
                "SAGA_COMPENSATION_TIMEOUT_MS",
                defaults.compensation_timeout,
            ),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            source_service: default_source_service(),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            compensation_timeout: Duration::from_millis(DEFAULT_COMPENSATION_TIMEOUT_MS),
        }
    }
}

fn default_source_service() -> ServiceName {
    match ServiceName::new(DEFAULT_SOURCE_SERVICE) {
        Ok(name) => name,
        Err(err) => unreachable!("default source service is valid: {err}"),
    }
}
