use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Version number of a shared entity, used for optimistic concurrency.
///
/// An entity with no marker in the store is at the initial version (0);
/// every successful update advances it by one.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(u64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    /// Returns the version of an entity that has never been updated.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Version {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Version marker persisted under `version:{entity_type}:{entity_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionMarker {
    pub version: Version,
    pub updated_at: DateTime<Utc>,
    pub updated_by: String,
}
