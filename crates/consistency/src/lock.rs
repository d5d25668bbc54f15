//! Advisory per-entity lock built on the store's first-write-wins save.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use state_store::{DeleteOptions, ETag, SaveOptions, StateStore, StateStoreExt};

use crate::entity::EntityRef;
use crate::error::{ConsistencyError, Result};

/// Lock record persisted under `lock:{entity_type}:{entity_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// A held advisory lock.
///
/// Call [`AdvisoryLock::release`] on every normal exit. If the guard is
/// dropped while still held (the owning future was cancelled or panicked)
/// the release is spawned onto the current runtime; the store TTL covers
/// a crashed process.
#[derive(Debug)]
pub(crate) struct AdvisoryLock<S: StateStore + Clone + 'static> {
    store: S,
    key: String,
    etag: ETag,
    held: bool,
}

impl<S: StateStore + Clone + 'static> AdvisoryLock<S> {
    /// Acquires the lock for `entity` or reports who holds it.
    pub(crate) async fn acquire(
        store: &S,
        entity: &EntityRef,
        owner: &str,
        ttl: Duration,
    ) -> Result<Self> {
        let key = entity.lock_key();
        let locked_at = Utc::now();
        let expires_at = TimeDelta::from_std(ttl)
            .ok()
            .and_then(|ttl| locked_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let record = LockRecord {
            locked_by: owner.to_string(),
            locked_at,
            expires_at,
        };

        match store
            .save_json(&key, &record, SaveOptions::first_write().ttl(ttl))
            .await
        {
            Ok(etag) => {
                tracing::debug!(%entity, owner, "advisory lock acquired");
                Ok(Self {
                    store: store.clone(),
                    key,
                    etag,
                    held: true,
                })
            }
            Err(err) if err.is_conflict() => {
                let holder = match store.get_json::<LockRecord>(&key).await {
                    Ok(Some((current, _))) => current.locked_by,
                    _ => "unknown".to_string(),
                };
                Err(ConsistencyError::LockHeld {
                    entity: entity.to_string(),
                    holder,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Releases the lock if it still carries the etag we wrote.
    pub(crate) async fn release(mut self) {
        if let Err(err) = self
            .store
            .delete(&self.key, DeleteOptions::with_etag(self.etag.clone()))
            .await
        {
            tracing::warn!(key = %self.key, error = %err, "failed to release advisory lock, leaving it to expire");
        }
        self.held = false;
    }
}

impl<S: StateStore + Clone + 'static> Drop for AdvisoryLock<S> {
    fn drop(&mut self) {
        if !self.held {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(key = %self.key, "advisory lock dropped outside a runtime, leaving it to expire");
            return;
        };
        let store = self.store.clone();
        let key = std::mem::take(&mut self.key);
        let etag = self.etag.clone();
        runtime.spawn(async move {
            if let Err(err) = store.delete(&key, DeleteOptions::with_etag(etag)).await {
                tracing::warn!(%key, error = %err, "deferred advisory lock release failed");
            }
        });
    }
}
