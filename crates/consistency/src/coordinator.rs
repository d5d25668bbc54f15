//! Optimistic single-entity updates and cross-service validation.

use std::future::Future;

use chrono::Utc;
use common::CorrelationContext;
use event_bus::EventBus;
use futures_util::future::join_all;
use state_store::{ETag, SaveOptions, StateStore, StateStoreExt};

use crate::config::CoordinatorConfig;
use crate::entity::EntityRef;
use crate::error::{BoxError, ConsistencyError, Result};
use crate::lock::AdvisoryLock;
use crate::validation::{ConsistencyValidation, ValidationReport, ValidationResult};
use crate::version::{Version, VersionMarker};

/// Coordinates writes to entities shared between services.
///
/// Independent of saga state. Conflicts are surfaced to the caller and
/// never retried here.
#[derive(Debug, Clone)]
pub struct ConsistencyCoordinator<S, B> {
    store: S,
    bus: B,
    config: CoordinatorConfig,
}

impl<S, B> ConsistencyCoordinator<S, B>
where
    S: StateStore + Clone + 'static,
    B: EventBus,
{
    /// Creates a coordinator with default configuration.
    pub fn new(store: S, bus: B) -> Self {
        Self::with_config(store, bus, CoordinatorConfig::default())
    }

    pub fn with_config(store: S, bus: B, config: CoordinatorConfig) -> Self {
        Self { store, bus, config }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Runs `update_fn` if the entity is still at `expected_version`.
    ///
    /// The version is checked, the entity's advisory lock taken, the
    /// version checked again under the lock, and `update_fn` awaited while
    /// the lock is held. On success the version marker is advanced with the
    /// etag read under the lock and the new version is returned. The lock
    /// is released on every exit.
    ///
    /// The lock expires after `lock_ttl` whether or not `update_fn` has
    /// returned, after which another caller may run its own update for the
    /// same version; only one of them can commit. `lock_ttl` must exceed
    /// the longest `update_fn` expected.
    #[tracing::instrument(skip(self, update_fn))]
    pub async fn handle_eventual_consistency<F, Fut, E>(
        &self,
        entity_type: &str,
        entity_id: &str,
        expected_version: Version,
        update_fn: F,
    ) -> Result<Version>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<BoxError>,
    {
        let entity = EntityRef::new(entity_type, entity_id)?;

        let (current, _) = self.read_marker(&entity).await?;
        if current != expected_version {
            return Err(self.conflict(&entity, expected_version, current));
        }

        let lock = match AdvisoryLock::acquire(
            &self.store,
            &entity,
            &self.config.lock_owner,
            self.config.lock_ttl,
        )
        .await
        {
            Ok(lock) => lock,
            Err(err) => {
                if err.is_conflict() {
                    metrics::counter!("consistency_conflicts_total").increment(1);
                    tracing::info!(%entity, error = %err, "advisory lock held elsewhere");
                }
                return Err(err);
            }
        };

        let outcome = self
            .update_under_lock(&entity, expected_version, update_fn)
            .await;
        lock.release().await;
        outcome
    }

    async fn update_under_lock<F, Fut, E>(
        &self,
        entity: &EntityRef,
        expected_version: Version,
        update_fn: F,
    ) -> Result<Version>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<BoxError>,
    {
        let (current, etag) = self.read_marker(entity).await?;
        if current != expected_version {
            return Err(self.conflict(entity, expected_version, current));
        }

        update_fn()
            .await
            .map_err(|source| ConsistencyError::UpdateFailed {
                entity: entity.to_string(),
                source: source.into(),
            })?;

        let next = expected_version.next();
        let marker = VersionMarker {
            version: next,
            updated_at: Utc::now(),
            updated_by: self.config.lock_owner.clone(),
        };
        let options = match etag {
            Some(etag) => SaveOptions::with_etag(etag),
            None => SaveOptions::first_write(),
        };

        match self
            .store
            .save_json(&entity.version_key(), &marker, options)
            .await
        {
            Ok(_) => {
                metrics::counter!("consistency_updates_total").increment(1);
                tracing::info!(%entity, version = %next, "entity version advanced");
                Ok(next)
            }
            Err(err) if err.is_conflict() => {
                let (actual, _) = self.read_marker(entity).await?;
                Err(self.conflict(entity, expected_version, actual))
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Returns the entity's current version; `0` if it was never updated.
    pub async fn current_version(&self, entity_type: &str, entity_id: &str) -> Result<Version> {
        let entity = EntityRef::new(entity_type, entity_id)?;
        Ok(self.read_marker(&entity).await?.0)
    }

    async fn read_marker(&self, entity: &EntityRef) -> Result<(Version, Option<ETag>)> {
        let marker = self
            .store
            .get_json::<VersionMarker>(&entity.version_key())
            .await?;
        Ok(match marker {
            Some((marker, etag)) => (marker.version, Some(etag)),
            None => (Version::initial(), None),
        })
    }

    fn conflict(&self, entity: &EntityRef, expected: Version, actual: Version) -> ConsistencyError {
        metrics::counter!("consistency_conflicts_total").increment(1);
        tracing::info!(%entity, %expected, %actual, "version conflict");
        ConsistencyError::VersionConflict {
            entity: entity.to_string(),
            expected,
            actual,
        }
    }

    /// Asks every named service to confirm its view of an entity.
    ///
    /// Requests are published concurrently and every outcome is collected.
    /// If any request is not accepted, the whole report comes back inside
    /// [`ConsistencyError::ValidationFailed`].
    #[tracing::instrument(skip_all, fields(validations = validations.len()))]
    pub async fn validate_data_consistency(
        &self,
        validations: &[ConsistencyValidation],
        correlation: &CorrelationContext,
    ) -> Result<ValidationReport> {
        let results = join_all(
            validations
                .iter()
                .map(|validation| self.validate_one(validation, correlation)),
        )
        .await;
        let report = ValidationReport::new(results);

        if report.is_consistent() {
            tracing::info!(checked = report.results.len(), "entities consistent");
            Ok(report)
        } else {
            metrics::counter!("consistency_validation_failures_total").increment(1);
            tracing::warn!(%report, "consistency validation failed");
            Err(ConsistencyError::ValidationFailed { report })
        }
    }

    async fn validate_one(
        &self,
        validation: &ConsistencyValidation,
        correlation: &CorrelationContext,
    ) -> ValidationResult {
        let envelope = validation.to_envelope(&self.config.source_service, correlation);
        let event_id = envelope.event_id;
        match self.bus.publish(envelope).await {
            Ok(()) => ValidationResult::consistent(validation, event_id),
            Err(err) => ValidationResult::mismatch(validation, err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use common::ServiceName;
    use event_bus::InMemoryEventBus;
    use serde_json::json;
    use state_store::InMemoryStateStore;

    use super::*;

    type TestCoordinator = ConsistencyCoordinator<InMemoryStateStore, InMemoryEventBus>;

    fn setup() -> (TestCoordinator, InMemoryStateStore, InMemoryEventBus) {
        let store = InMemoryStateStore::new();
        let bus = InMemoryEventBus::new();
        let config = CoordinatorConfig {
            lock_owner: "node-a".to_string(),
            ..CoordinatorConfig::default()
        };
        let coordinator = ConsistencyCoordinator::with_config(store.clone(), bus.clone(), config);
        (coordinator, store, bus)
    }

    async fn noop() -> std::result::Result<(), BoxError> {
        Ok(())
    }

    async fn explode() -> std::result::Result<(), BoxError> {
        panic!("update exploded")
    }

    #[tokio::test]
    async fn test_first_update_from_initial_version() {
        let (coordinator, store, _bus) = setup();
        let calls = AtomicUsize::new(0);

        let version = coordinator
            .handle_eventual_consistency("order", "o-1", Version::initial(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            })
            .await
            .unwrap();

        assert_eq!(version, Version::new(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            coordinator.current_version("order", "o-1").await.unwrap(),
            Version::new(1)
        );
        assert!(store.get("lock:order:o-1").await.unwrap().is_none());

        let (marker, _) = store
            .get_json::<VersionMarker>("version:order:o-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(marker.updated_by, "node-a");
    }

    #[tokio::test]
    async fn test_stale_version_conflicts_without_running_update() {
        let (coordinator, _store, _bus) = setup();
        coordinator
            .handle_eventual_consistency("order", "o-1", Version::initial(), noop)
            .await
            .unwrap();

        let calls = AtomicUsize::new(0);
        let err = coordinator
            .handle_eventual_consistency("order", "o-1", Version::initial(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(())
            })
            .await
            .unwrap_err();

        assert!(err.is_conflict());
        assert!(matches!(
            err,
            ConsistencyError::VersionConflict { expected, actual, .. }
                if expected == Version::new(0) && actual == Version::new(1)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_update_failure_releases_lock_and_keeps_version() {
        let (coordinator, store, _bus) = setup();

        let err = coordinator
            .handle_eventual_consistency("order", "o-1", Version::initial(), || async {
                Err::<(), _>("downstream rejected")
            })
            .await
            .unwrap_err();

        assert!(matches!(err, ConsistencyError::UpdateFailed { .. }));
        assert!(!err.is_conflict());
        assert!(store.get("lock:order:o-1").await.unwrap().is_none());
        assert_eq!(
            coordinator.current_version("order", "o-1").await.unwrap(),
            Version::initial()
        );
    }

    #[tokio::test]
    async fn test_held_lock_is_a_conflict() {
        let (coordinator, store, _bus) = setup();
        store
            .save_json(
                "lock:order:o-1",
                &json!({"locked_by": "node-b", "locked_at": Utc::now(), "expires_at": Utc::now()}),
                SaveOptions::first_write(),
            )
            .await
            .unwrap();

        let err = coordinator
            .handle_eventual_consistency("order", "o-1", Version::initial(), noop)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
        assert!(matches!(err, ConsistencyError::LockHeld { ref holder, .. } if holder == "node-b"));
    }

    #[tokio::test]
    async fn test_unbounded_lock_ttl() {
        let store = InMemoryStateStore::new();
        let config = CoordinatorConfig {
            lock_ttl: Duration::MAX,
            ..CoordinatorConfig::default()
        };
        let coordinator =
            ConsistencyCoordinator::with_config(store.clone(), InMemoryEventBus::new(), config);

        let version = coordinator
            .handle_eventual_consistency("order", "o-1", Version::initial(), noop)
            .await
            .unwrap();

        assert_eq!(version, Version::new(1));
        assert!(store.get("lock:order:o-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_empty_arguments_rejected() {
        let (coordinator, store, _bus) = setup();
        let err = coordinator
            .handle_eventual_consistency("", "o-1", Version::initial(), noop)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsistencyError::InvalidArgument(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_store_outage_surfaces_as_store_error() {
        let (coordinator, store, _bus) = setup();
        store.set_unavailable(true);
        let err = coordinator
            .handle_eventual_consistency("order", "o-1", Version::initial(), noop)
            .await
            .unwrap_err();
        assert!(matches!(err, ConsistencyError::Store(_)));
    }

    #[tokio::test]
    async fn test_panicking_update_still_releases_lock() {
        let (coordinator, store, _bus) = setup();
        let coordinator = Arc::new(coordinator);

        let task = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .handle_eventual_consistency("order", "o-1", Version::initial(), explode)
                    .await
            })
        };
        assert!(task.await.unwrap_err().is_panic());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(store.get("lock:order:o-1").await.unwrap().is_none());
        assert_eq!(
            coordinator.current_version("order", "o-1").await.unwrap(),
            Version::initial()
        );
    }

    #[tokio::test]
    async fn test_validation_all_consistent() {
        let (coordinator, _store, bus) = setup();
        let validations = vec![
            ConsistencyValidation::new(
                "order",
                "o-1",
                ServiceName::new("orders").unwrap(),
                json!({"status": "paid"}),
            ),
            ConsistencyValidation::new(
                "order",
                "o-1",
                ServiceName::new("billing").unwrap(),
                json!({"amount": 4500}),
            ),
        ];

        let report = coordinator
            .validate_data_consistency(&validations, &CorrelationContext::new())
            .await
            .unwrap();
        assert!(report.is_consistent());
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.event_id.is_some()));
        assert_eq!(bus.delivered().await.len(), 2);
    }

    #[tokio::test]
    async fn test_validation_with_no_entries() {
        let (coordinator, _store, bus) = setup();
        let report = coordinator
            .validate_data_consistency(&[], &CorrelationContext::new())
            .await
            .unwrap();
        assert!(report.results.is_empty());
        assert!(bus.delivered().await.is_empty());
    }
}
