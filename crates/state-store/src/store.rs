use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{Result, StateStoreError};

/// Opaque concurrency token attached to every stored entry.
///
/// A new etag is issued on every successful write; callers echo the one
/// they read to make the next write conditional.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ETag(String);

impl ETag {
    /// Wraps a raw etag value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw etag value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ETag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Write concurrency mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Concurrency {
    /// Unconditional overwrite unless an etag is supplied.
    #[default]
    LastWrite,
    /// The write only succeeds if the key is absent, or if its etag matches
    /// the supplied one.
    FirstWrite,
}

/// Read/write consistency requested from the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Consistency {
    #[default]
    Eventual,
    Strong,
}

/// Options for saving a value.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    /// Only write if the stored entry still carries this etag.
    pub etag: Option<ETag>,
    pub concurrency: Concurrency,
    pub consistency: Consistency,
    /// The entry is treated as absent once this much time has passed.
    pub ttl: Option<Duration>,
}

impl SaveOptions {
    /// Creates options for an unconditional write.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options for a write conditional on the given etag.
    pub fn with_etag(etag: ETag) -> Self {
        Self {
            etag: Some(etag),
            concurrency: Concurrency::FirstWrite,
            consistency: Consistency::Strong,
            ttl: None,
        }
    }

    /// Creates options for a write that must not overwrite an existing key.
    pub fn first_write() -> Self {
        Self {
            etag: None,
            concurrency: Concurrency::FirstWrite,
            consistency: Consistency::Strong,
            ttl: None,
        }
    }

    /// Requests strong consistency.
    pub fn strong(mut self) -> Self {
        self.consistency = Consistency::Strong;
        self
    }

    /// Sets a time-to-live on the written entry.
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Options for deleting a value.
#[derive(Debug, Clone, Default)]
pub struct DeleteOptions {
    /// Only delete if the stored entry still carries this etag.
    pub etag: Option<ETag>,
    pub consistency: Consistency,
}

impl DeleteOptions {
    /// Creates options for an unconditional delete.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates options for a delete conditional on the given etag.
    pub fn with_etag(etag: ETag) -> Self {
        Self {
            etag: Some(etag),
            consistency: Consistency::Strong,
        }
    }
}

/// A stored value together with its current etag.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntry {
    pub value: serde_json::Value,
    pub etag: ETag,
}

impl StateEntry {
    /// Deserializes the stored value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.value.clone())?)
    }
}

/// Core trait for state store implementations.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Saves a value under `key`, returning the etag of the new entry.
    ///
    /// Fails with `EtagMismatch` if `options.etag` is set and does not match,
    /// and with `AlreadyExists` for a first-write save of an existing key.
    async fn save(&self, key: &str, value: serde_json::Value, options: SaveOptions)
    -> Result<ETag>;

    /// Retrieves the entry stored under `key`.
    ///
    /// Returns None if the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<StateEntry>>;

    /// Deletes the entry stored under `key`. Deleting an absent key is not an error.
    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<()>;
}

/// Extension trait providing typed JSON helpers for state stores.
#[async_trait]
pub trait StateStoreExt: StateStore {
    /// Serializes and saves a value.
    async fn save_json<T>(&self, key: &str, value: &T, options: SaveOptions) -> Result<ETag>
    where
        T: Serialize + Sync,
    {
        let value = serde_json::to_value(value)?;
        self.save(key, value, options).await
    }

    /// Loads and deserializes a value, returning it with its etag.
    async fn get_json<T>(&self, key: &str) -> Result<Option<(T, ETag)>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(entry) => {
                let value = entry.decode()?;
                Ok(Some((value, entry.etag)))
            }
            None => Ok(None),
        }
    }
}

// Blanket implementation for all StateStore implementations
impl<T: StateStore + ?Sized> StateStoreExt for T {}

/// Rejects empty or whitespace-only keys.
pub fn validate_key(key: &str) -> Result<()> {
    if key.trim().is_empty() {
        return Err(StateStoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}
