use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::store::validate_key;
use crate::{
    Concurrency, DeleteOptions, ETag, Result, SaveOptions, StateEntry, StateStore, StateStoreError,
};

#[derive(Debug, Clone)]
struct StoredEntry {
    value: serde_json::Value,
    etag: ETag,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    entries: HashMap<String, StoredEntry>,
    history: HashMap<String, Vec<serde_json::Value>>,
    next_etag: u64,
}

/// In-memory state store implementation for testing.
///
/// Honours etags, first-write-wins saves and TTLs the same way a durable
/// store would, and records every value written per key so tests can
/// inspect the full sequence of persisted transitions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStateStore {
    state: Arc<RwLock<InMemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryStateStore {
    /// Creates a new empty in-memory state store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail with `Unavailable` while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Returns the number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.state
            .read()
            .await
            .entries
            .values()
            .filter(|e| e.is_live(now))
            .count()
    }

    /// Returns true if the store holds no live entries.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Returns every value successfully saved under `key`, oldest first.
    pub async fn history(&self, key: &str) -> Vec<serde_json::Value> {
        self.state
            .read()
            .await
            .history
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// Clears all entries and history.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.entries.clear();
        state.history.clear();
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StateStoreError::Unavailable(
                "in-memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        options: SaveOptions,
    ) -> Result<ETag> {
        validate_key(key)?;
        self.check_available()?;

        let now = Instant::now();
        let mut state = self.state.write().await;

        let current = state
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.etag.clone());

        match (&options.etag, &current) {
            (Some(expected), Some(actual)) if expected != actual => {
                return Err(StateStoreError::EtagMismatch {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual: Some(actual.clone()),
                });
            }
            (Some(expected), None) => {
                return Err(StateStoreError::EtagMismatch {
                    key: key.to_string(),
                    expected: expected.clone(),
                    actual: None,
                });
            }
            (None, Some(_)) if options.concurrency == Concurrency::FirstWrite => {
                return Err(StateStoreError::AlreadyExists(key.to_string()));
            }
            _ => {}
        }

        state.next_etag += 1;
        let etag = ETag::new(state.next_etag.to_string());
        state
            .history
            .entry(key.to_string())
            .or_default()
            .push(value.clone());
        state.entries.insert(
            key.to_string(),
            StoredEntry {
                value,
                etag: etag.clone(),
                expires_at: options.ttl.and_then(|ttl| now.checked_add(ttl)),
            },
        );

        tracing::trace!(key, %etag, "state saved");
        Ok(etag)
    }

    async fn get(&self, key: &str) -> Result<Option<StateEntry>> {
        validate_key(key)?;
        self.check_available()?;

        let now = Instant::now();
        let state = self.state.read().await;
        Ok(state
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| StateEntry {
                value: e.value.clone(),
                etag: e.etag.clone(),
            }))
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<()> {
        validate_key(key)?;
        self.check_available()?;

        let now = Instant::now();
        let mut state = self.state.write().await;

        let current = state
            .entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.etag.clone());

        if let Some(expected) = options.etag {
            if current.as_ref() != Some(&expected) {
                return Err(StateStoreError::EtagMismatch {
                    key: key.to_string(),
                    expected,
                    actual: current,
                });
            }
        }

        state.entries.remove(key);
        tracing::trace!(key, "state deleted");
        Ok(())
    }
}
