//! Saga orchestrator: the top-level driver of distributed transactions.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{CorrelationContext, SagaId};
use event_bus::EventBus;
use futures_util::FutureExt;
use state_store::StateStore;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::compensation::CompensationEngine;
use crate::config::EngineConfig;
use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};
use crate::events::{self, SagaCompletedData, SagaLifecycleEvent};
use crate::execution::{SagaExecution, SagaStepResult};
use crate::executor::{StepContext, StepExecutor};
use crate::options::TransactionOptions;
use crate::registry::{ExecutionRecorder, SagaRegistry};
use crate::state::SagaStatus;

/// Handle to a saga running on its own task.
///
/// Dropping the handle detaches the run: the saga still executes to
/// completion and its outcome stays observable through
/// [`SagaOrchestrator::get_saga_execution`].
#[derive(Debug)]
pub struct SagaHandle {
    execution: SagaExecution,
    cancel: CancellationToken,
    join: JoinHandle<()>,
    registry: SagaRegistry,
}

impl SagaHandle {
    pub fn saga_id(&self) -> SagaId {
        self.execution.saga_id()
    }

    /// The execution as persisted at submission time (status `pending`).
    pub fn execution(&self) -> &SagaExecution {
        &self.execution
    }

    /// Requests an early abort.
    ///
    /// No further steps start; the in-flight step stops retrying and is
    /// recorded as failed, and completed steps are compensated.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that aborts this saga when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Returns true once the run task has exited.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Waits for the run task to exit and returns the final record.
    pub async fn wait(self) -> Result<SagaExecution> {
        let saga_id = self.saga_id();
        self.join.await.map_err(|err| SagaError::TaskFailed {
            saga_id,
            reason: err.to_string(),
        })?;
        self.registry
            .get(saga_id)
            .await
            .ok_or(SagaError::SagaNotFound(saga_id))
    }
}

/// Orchestrates saga executions.
///
/// Each submitted saga runs on its own tokio task; steps within a saga
/// run strictly in definition order. The registry is injected so
/// independent orchestrators never share state.
#[derive(Debug, Clone)]
pub struct SagaOrchestrator<S, B> {
    config: EngineConfig,
    executor: StepExecutor<B>,
    recorder: ExecutionRecorder<S>,
    compensation: CompensationEngine<S, B>,
}

impl<S, B> SagaOrchestrator<S, B>
where
    S: StateStore + Clone + 'static,
    B: EventBus + Clone + 'static,
{
    /// Creates an orchestrator with default configuration.
    pub fn new(store: S, bus: B, registry: SagaRegistry) -> Self {
        Self::with_config(store, bus, registry, EngineConfig::default())
    }

    /// Creates an orchestrator with explicit configuration.
    pub fn with_config(store: S, bus: B, registry: SagaRegistry, config: EngineConfig) -> Self {
        let executor = StepExecutor::new(bus, config.source_service.clone());
        let recorder = ExecutionRecorder::new(store, registry);
        let compensation = CompensationEngine::new(executor.clone(), recorder.clone());
        Self {
            config,
            executor,
            recorder,
            compensation,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SagaRegistry {
        self.recorder.registry()
    }

    /// Submits a saga for execution.
    ///
    /// Validates the definition, persists a `pending` execution and
    /// launches the run on its own task, returning immediately. Only
    /// validation and the initial save can fail here; every later failure
    /// is recorded on the execution.
    #[tracing::instrument(skip_all, fields(saga_id = tracing::field::Empty, saga_name = tracing::field::Empty))]
    pub async fn execute_distributed_transaction(
        &self,
        definition: impl Into<Arc<SagaDefinition>>,
        options: Option<TransactionOptions>,
    ) -> Result<SagaHandle> {
        let definition = definition.into();
        let span = tracing::Span::current();
        span.record("saga_id", tracing::field::display(definition.id));
        span.record("saga_name", definition.name.as_str());

        definition.validate()?;
        // Fast path; the first-write save below is what rejects concurrent duplicates.
        if self.recorder.load(definition.id).await?.is_some() {
            return Err(SagaError::AlreadyStarted(definition.id));
        }

        let mut options = options.unwrap_or_else(|| TransactionOptions::from_config(&self.config));
        let correlation = options
            .correlation
            .get_or_insert_with(CorrelationContext::new)
            .clone();

        let execution = SagaExecution::new(definition, correlation);
        self.recorder
            .persist_new(&execution, options.consistency_level)
            .await?;
        metrics::counter!("saga_executions_total").increment(1);
        tracing::info!(steps = execution.definition().steps.len(), "saga submitted");

        let cancel = CancellationToken::new();
        let run_span = tracing::info_span!("saga_run", saga_id = %execution.saga_id());
        let join = tokio::spawn(
            self.clone()
                .run_guarded(execution.clone(), options, cancel.clone())
                .instrument(run_span),
        );

        Ok(SagaHandle {
            execution,
            cancel,
            join,
            registry: self.registry().clone(),
        })
    }

    /// Returns the current record of a saga, from the registry or the store.
    pub async fn get_saga_execution(&self, saga_id: SagaId) -> Result<SagaExecution> {
        self.recorder
            .load(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))
    }

    /// Task body: runs the saga and converts a panic into a recorded failure.
    async fn run_guarded(
        self,
        execution: SagaExecution,
        options: TransactionOptions,
        cancel: CancellationToken,
    ) {
        let saga_id = execution.saga_id();
        let outcome = AssertUnwindSafe(self.run(execution, &options, &cancel))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(%saga_id, error = %err, "saga run aborted");
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                tracing::error!(%saga_id, %reason, "saga run panicked");
                metrics::counter!("saga_panics_total").increment(1);
                self.recover_from_panic(saga_id, &options, reason).await;
            }
        }
    }

    async fn run(
        &self,
        mut execution: SagaExecution,
        options: &TransactionOptions,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let started = Instant::now();
        execution.transition_to(SagaStatus::Executing)?;
        self.recorder
            .persist_transition(&execution, options.consistency_level)
            .await;
        tracing::info!("saga executing");

        let definition = execution.definition().clone();
        let correlation = execution.correlation().clone();
        let ctx = StepContext {
            saga_id: execution.saga_id(),
            correlation: &correlation,
            default_timeout: options.timeout,
            cancel,
        };

        for (index, step) in definition.steps.iter().enumerate() {
            execution.begin_step(index);
            tracing::info!(step = %step.step_id, index, "saga step started");

            let result = if cancel.is_cancelled() {
                SagaStepResult::failed(&step.step_id, "saga cancelled", Utc::now(), Duration::ZERO, 0)
            } else {
                self.executor.execute_step(step, &ctx).await
            };

            if result.is_success() {
                execution.record_step_completed(&step.step_id)?;
                self.recorder
                    .persist_transition(&execution, options.consistency_level)
                    .await;
                continue;
            }

            execution.record_failure(result)?;
            self.recorder
                .persist_transition(&execution, options.consistency_level)
                .await;
            metrics::counter!("saga_failed").increment(1);
            tracing::warn!(
                step = %step.step_id,
                error = execution.error_message().unwrap_or_default(),
                "saga failed"
            );

            self.compensation.compensate(&mut execution, options).await?;
            metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
            return Ok(());
        }

        execution.transition_to(SagaStatus::Completed)?;
        self.recorder
            .persist_transition(&execution, options.consistency_level)
            .await;

        let duration = started.elapsed().as_secs_f64();
        metrics::histogram!("saga_duration_seconds").record(duration);
        metrics::counter!("saga_completed").increment(1);
        tracing::info!(duration, "saga completed successfully");

        let event = SagaLifecycleEvent::Completed(SagaCompletedData {
            saga_id: execution.saga_id(),
            saga_name: definition.name.clone(),
            completed_steps: execution.completed_steps().to_vec(),
            completed_at: execution.completed_at().unwrap_or_else(Utc::now),
        });
        events::emit_lifecycle(self.executor.bus(), self.executor.source(), &event, &correlation)
            .await;

        Ok(())
    }

    /// Records a panic on the last mirrored state of the saga.
    ///
    /// A panic during step execution becomes a failed step followed by
    /// normal compensation; a panic during compensation halts it.
    async fn recover_from_panic(&self, saga_id: SagaId, options: &TransactionOptions, reason: String) {
        let mut execution = match self.recorder.load(saga_id).await {
            Ok(Some(execution)) => execution,
            Ok(None) => {
                tracing::error!(%saga_id, "no record to recover after panic");
                return;
            }
            Err(err) => {
                tracing::error!(%saga_id, error = %err, "failed to load record after panic");
                return;
            }
        };
        let error = format!("panic: {reason}");

        match execution.status() {
            SagaStatus::Pending | SagaStatus::Executing => {
                if execution.status() == SagaStatus::Pending {
                    if let Err(err) = execution.transition_to(SagaStatus::Executing) {
                        tracing::error!(%saga_id, error = %err, "cannot recover saga");
                        return;
                    }
                }
                // Completed steps form a prefix; the in-flight step follows it.
                let step_id = execution
                    .definition()
                    .steps
                    .get(execution.completed_steps().len())
                    .map(|s| s.step_id.clone())
                    .unwrap_or_else(|| "unknown".to_string());
                let result = SagaStepResult::failed(step_id, error, Utc::now(), Duration::ZERO, 0);
                if let Err(err) = execution.record_failure(result) {
                    tracing::error!(%saga_id, error = %err, "cannot recover saga");
                    return;
                }
                self.recorder
                    .persist_transition(&execution, options.consistency_level)
                    .await;
                self.compensate_after_panic(execution, options).await;
            }
            SagaStatus::Failed => self.compensate_after_panic(execution, options).await,
            SagaStatus::Compensating => {
                execution.fail_compensation(error);
                self.recorder
                    .persist_transition(&execution, options.consistency_level)
                    .await;
            }
            SagaStatus::Completed | SagaStatus::Compensated => {}
        }
    }

    async fn compensate_after_panic(&self, mut execution: SagaExecution, options: &TransactionOptions) {
        let outcome = AssertUnwindSafe(self.compensation.compensate(&mut execution, options))
            .catch_unwind()
            .await;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(saga_id = %execution.saga_id(), error = %err, "compensation aborted");
            }
            Err(panic) => {
                execution.fail_compensation(format!("panic: {}", panic_message(panic.as_ref())));
                self.recorder
                    .persist_transition(&execution, options.consistency_level)
                    .await;
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
