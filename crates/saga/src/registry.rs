//! In-process mirror of saga executions and the persist-and-mirror path.

use std::collections::HashMap;
use std::sync::Arc;

use common::SagaId;
use state_store::{SaveOptions, StateStore, StateStoreError, StateStoreExt};
use tokio::sync::RwLock;

use crate::error::{Result, SagaError};
use crate::execution::SagaExecution;
use crate::options::ConsistencyLevel;

/// Fast-lookup mirror of saga executions.
///
/// Owned by whoever constructs the orchestrator and shared by cloning; the
/// state store remains the source of truth across restarts.
#[derive(Debug, Clone, Default)]
pub struct SagaRegistry {
    executions: Arc<RwLock<HashMap<SagaId, SagaExecution>>>,
}

impl SagaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the mirrored execution, if any.
    pub async fn get(&self, saga_id: SagaId) -> Option<SagaExecution> {
        self.executions.read().await.get(&saga_id).cloned()
    }

    /// Replaces the mirrored execution.
    pub async fn upsert(&self, execution: SagaExecution) {
        self.executions
            .write()
            .await
            .insert(execution.saga_id(), execution);
    }

    /// Number of mirrored executions.
    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

/// Persists executions to the store and mirrors them into the registry.
#[derive(Debug, Clone)]
pub struct ExecutionRecorder<S> {
    store: S,
    registry: SagaRegistry,
}

impl<S: StateStore> ExecutionRecorder<S> {
    pub fn new(store: S, registry: SagaRegistry) -> Self {
        Self { store, registry }
    }

    pub fn registry(&self) -> &SagaRegistry {
        &self.registry
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Saves the execution, then mirrors it.
    ///
    /// The mirror is only updated after a successful save.
    pub async fn persist(&self, execution: &SagaExecution, level: ConsistencyLevel) -> Result<()> {
        self.save(execution, with_level(SaveOptions::new(), level))
            .await
    }

    /// Saves a newly submitted execution, first write wins.
    ///
    /// Fails with `AlreadyStarted` if any record exists for the saga id,
    /// including one written concurrently by another submission.
    pub async fn persist_new(
        &self,
        execution: &SagaExecution,
        level: ConsistencyLevel,
    ) -> Result<()> {
        match self
            .save(execution, with_level(SaveOptions::first_write(), level))
            .await
        {
            Err(SagaError::StateStore(StateStoreError::AlreadyExists(_))) => {
                Err(SagaError::AlreadyStarted(execution.saga_id()))
            }
            other => other,
        }
    }

    async fn save(&self, execution: &SagaExecution, options: SaveOptions) -> Result<()> {
        self.store
            .save_json(
                &SagaExecution::storage_key(execution.saga_id()),
                execution,
                options,
            )
            .await?;
        self.registry.upsert(execution.clone()).await;
        Ok(())
    }

    /// Persists a transition after the initial save.
    ///
    /// Store failures are logged rather than returned and the mirror still
    /// advances, so the run can carry on and record its outcome.
    pub async fn persist_transition(&self, execution: &SagaExecution, level: ConsistencyLevel) {
        if let Err(err) = self.persist(execution, level).await {
            tracing::error!(
                saga_id = %execution.saga_id(),
                status = %execution.status(),
                error = %err,
                "failed to persist saga execution"
            );
            metrics::counter!("saga_persist_failures_total").increment(1);
            self.registry.upsert(execution.clone()).await;
        }
    }

    /// Loads an execution: registry first, then the store.
    pub async fn load(&self, saga_id: SagaId) -> Result<Option<SagaExecution>> {
        if let Some(execution) = self.registry.get(saga_id).await {
            return Ok(Some(execution));
        }
        let stored = self
            .store
            .get_json::<SagaExecution>(&SagaExecution::storage_key(saga_id))
            .await?;
        match stored {
            Some((execution, _etag)) => {
                self.registry.upsert(execution.clone()).await;
                Ok(Some(execution))
            }
            None => Ok(None),
        }
    }
}

fn with_level(options: SaveOptions, level: ConsistencyLevel) -> SaveOptions {
    match level {
        ConsistencyLevel::Strong => options.strong(),
        ConsistencyLevel::Eventual => options,
    }
}
