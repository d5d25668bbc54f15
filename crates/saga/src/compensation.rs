//! Reverse-order compensation of completed saga steps.

use chrono::Utc;
use event_bus::EventBus;
use state_store::StateStore;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::events::{self, SagaCompensatedData, SagaLifecycleEvent};
use crate::execution::SagaExecution;
use crate::executor::{StepExecutor, deadline_after};
use crate::options::TransactionOptions;
use crate::registry::ExecutionRecorder;

/// Undoes the completed steps of a failed saga.
///
/// Compensation is never retried as a whole: the first step whose undo
/// cannot be delivered halts the pass and leaves the saga in
/// `Compensating` for an operator to resolve.
#[derive(Debug, Clone)]
pub struct CompensationEngine<S, B> {
    executor: StepExecutor<B>,
    recorder: ExecutionRecorder<S>,
}

impl<S, B> CompensationEngine<S, B>
where
    S: StateStore,
    B: EventBus,
{
    pub fn new(executor: StepExecutor<B>, recorder: ExecutionRecorder<S>) -> Self {
        Self { executor, recorder }
    }

    /// Runs compensation for a saga in `Failed` status.
    ///
    /// Returns an error only if the saga is not in a state that allows
    /// compensation; every other outcome is recorded on the execution.
    #[tracing::instrument(skip_all, fields(saga_id = %execution.saga_id()))]
    pub async fn compensate(
        &self,
        execution: &mut SagaExecution,
        options: &TransactionOptions,
    ) -> Result<()> {
        execution.begin_compensation()?;
        self.recorder
            .persist_transition(execution, options.consistency_level)
            .await;

        let failed_step = execution.failed_step().map(|r| r.step_id.clone());
        tracing::info!(from_step = ?failed_step, "compensation started");

        let deadline = deadline_after(Instant::now(), options.compensation_timeout);
        // Compensation must run to the end even if the saga was cancelled.
        let never_cancelled = CancellationToken::new();
        let definition = execution.definition().clone();
        let saga_id = execution.saga_id();
        let correlation = execution.correlation().clone();
        let completed: Vec<String> = execution.completed_steps().to_vec();

        for step_id in completed.iter().rev() {
            let Some(step) = definition.step(step_id) else {
                self.halt(execution, options, format!("completed step '{step_id}' is not defined"))
                    .await;
                return Ok(());
            };
            let Some(operation) = step.compensation_operation.as_ref() else {
                tracing::debug!(step_id = %step_id, "step has no compensation, skipping");
                execution.record_step_skipped(step_id);
                continue;
            };

            let outcome = self
                .executor
                .invoke_with_retry(
                    |attempt| {
                        events::compensation_invocation(
                            self.executor.source(),
                            saga_id,
                            step,
                            operation,
                            attempt,
                            &correlation,
                        )
                    },
                    &step.effective_retry_policy(),
                    deadline,
                    &never_cancelled,
                )
                .await;

            match outcome {
                Ok(delivery) => {
                    tracing::info!(step_id = %step_id, attempts = delivery.attempts, "step compensated");
                    execution.record_step_compensated(step_id);
                    self.recorder
                        .persist_transition(execution, options.consistency_level)
                        .await;
                }
                Err(failure) => {
                    self.halt(
                        execution,
                        options,
                        format!("compensation of step '{step_id}' failed: {}", failure.error),
                    )
                    .await;
                    return Ok(());
                }
            }
        }

        execution.complete_compensation()?;
        self.recorder
            .persist_transition(execution, options.consistency_level)
            .await;
        metrics::counter!("saga_compensated").increment(1);
        tracing::info!(
            compensated_steps = ?execution.compensation().map(|c| &c.compensated_steps),
            "saga compensated"
        );

        let event = SagaLifecycleEvent::Compensated(SagaCompensatedData {
            saga_id,
            saga_name: definition.name.clone(),
            failed_step,
            compensated_steps: execution
                .compensation()
                .map(|c| c.compensated_steps.clone())
                .unwrap_or_default(),
            compensated_at: execution.completed_at().unwrap_or_else(Utc::now),
        });
        events::emit_lifecycle(self.executor.bus(), self.executor.source(), &event, &correlation)
            .await;

        Ok(())
    }

    async fn halt(&self, execution: &mut SagaExecution, options: &TransactionOptions, error: String) {
        metrics::counter!("saga_compensation_failed").increment(1);
        tracing::error!(error = %error, "compensation halted, saga requires intervention");
        execution.fail_compensation(error);
        self.recorder
            .persist_transition(execution, options.consistency_level)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use common::{CorrelationContext, OperationName, ServiceName};
    use event_bus::InMemoryEventBus;
    use serde_json::json;
    use state_store::InMemoryStateStore;

    use super::*;
    use crate::definition::{SagaDefinition, SagaStep};
    use crate::execution::{CompensationStatus, SagaStepResult};
    use crate::registry::SagaRegistry;
    use crate::retry::RetryPolicy;
    use crate::state::SagaStatus;

    fn undo(op: &str) -> OperationName {
        OperationName::new(op).unwrap()
    }

    fn definition() -> SagaDefinition {
        SagaDefinition::builder("order")
            .step(
                SagaStep::parse("reserve-inventory", "inventory", "reserve")
                    .unwrap()
                    .with_compensation(undo("release"), json!({"sku": "SKU-001"})),
            )
            .step(SagaStep::parse("send-receipt", "email", "send").unwrap())
            .step(
                SagaStep::parse("charge-payment", "payment", "charge")
                    .unwrap()
                    .with_compensation(undo("refund"), json!({}))
                    .with_retry_policy(RetryPolicy::no_retry()),
            )
            .step(SagaStep::parse("ship-order", "shipping", "ship").unwrap())
            .build()
            .unwrap()
    }

    fn failed_execution(completed: &[&str], failed: &str) -> SagaExecution {
        let mut execution = SagaExecution::new(Arc::new(definition()), CorrelationContext::new());
        execution.transition_to(SagaStatus::Executing).unwrap();
        for id in completed {
            execution.record_step_completed(id).unwrap();
        }
        execution
            .record_failure(SagaStepResult::failed(
                failed,
                "boom",
                Utc::now(),
                Duration::ZERO,
                1,
            ))
            .unwrap();
        execution
    }

    fn engine(
        bus: &InMemoryEventBus,
        store: &InMemoryStateStore,
    ) -> CompensationEngine<InMemoryStateStore, InMemoryEventBus> {
        CompensationEngine::new(
            StepExecutor::new(bus.clone(), ServiceName::new("saga-orchestrator").unwrap()),
            ExecutionRecorder::new(store.clone(), SagaRegistry::new()),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_compensates_in_reverse_skipping_non_compensable() {
        let bus = InMemoryEventBus::new();
        let store = InMemoryStateStore::new();
        let mut execution = failed_execution(
            &["reserve-inventory", "send-receipt", "charge-payment"],
            "ship-order",
        );

        engine(&bus, &store)
            .compensate(&mut execution, &TransactionOptions::default())
            .await
            .unwrap();

        assert_eq!(execution.status(), SagaStatus::Compensated);
        let compensation = execution.compensation().unwrap();
        assert_eq!(compensation.status, CompensationStatus::Completed);
        assert_eq!(
            compensation.compensated_steps,
            vec!["charge-payment", "reserve-inventory"]
        );
        assert_eq!(compensation.skipped_steps, vec!["send-receipt"]);

        let undo_calls: Vec<String> = bus
            .delivered_of_type(events::STEP_COMPENSATE)
            .await
            .iter()
            .map(|e| e.operation.as_ref().unwrap().to_string())
            .collect();
        assert_eq!(undo_calls, vec!["refund", "release"]);
        assert_eq!(bus.delivered_of_type(events::SAGA_COMPENSATED).await.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_halts_on_first_compensation_failure() {
        let bus = InMemoryEventBus::new();
        bus.fail_always("payment", "refund", "ledger locked").await;
        let store = InMemoryStateStore::new();
        let mut execution = failed_execution(
            &["reserve-inventory", "send-receipt", "charge-payment"],
            "ship-order",
        );

        engine(&bus, &store)
            .compensate(&mut execution, &TransactionOptions::default())
            .await
            .unwrap();

        assert_eq!(execution.status(), SagaStatus::Compensating);
        assert!(execution.requires_intervention());
        let compensation = execution.compensation().unwrap();
        assert_eq!(compensation.status, CompensationStatus::Failed);
        assert!(compensation.compensated_steps.is_empty());
        assert!(
            compensation
                .error_message
                .as_deref()
                .unwrap()
                .contains("ledger locked")
        );

        // No-retry policy: exactly one attempt, and earlier steps are left alone.
        assert_eq!(bus.attempt_count("payment", "refund").await, 1);
        assert_eq!(bus.attempt_count("inventory", "release").await, 0);
        assert!(bus.delivered_of_type(events::SAGA_COMPENSATED).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_nothing_to_compensate() {
        let bus = InMemoryEventBus::new();
        let store = InMemoryStateStore::new();
        let mut execution = failed_execution(&[], "reserve-inventory");

        engine(&bus, &store)
            .compensate(&mut execution, &TransactionOptions::default())
            .await
            .unwrap();

        assert_eq!(execution.status(), SagaStatus::Compensated);
        assert!(execution.compensation().unwrap().compensated_steps.is_empty());
        assert!(bus.delivered_of_type(events::STEP_COMPENSATE).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_compensation_timeout_bounds_the_pass() {
        let bus = InMemoryEventBus::new();
        bus.set_latency("inventory", "release", Duration::from_secs(120))
            .await;
        let store = InMemoryStateStore::new();
        let mut execution = failed_execution(&["reserve-inventory"], "send-receipt");
        let options = TransactionOptions::default().compensation_timeout(Duration::from_secs(2));

        engine(&bus, &store)
            .compensate(&mut execution, &options)
            .await
            .unwrap();

        assert!(execution.requires_intervention());
        assert!(
            execution
                .compensation()
                .unwrap()
                .error_message
                .as_deref()
                .unwrap()
                .contains("deadline")
        );
    }

    #[tokio::test]
    async fn test_rejects_saga_that_has_not_failed() {
        let bus = InMemoryEventBus::new();
        let store = InMemoryStateStore::new();
        let mut execution = SagaExecution::new(Arc::new(definition()), CorrelationContext::new());

        let result = engine(&bus, &store)
            .compensate(&mut execution, &TransactionOptions::default())
            .await;
        assert!(result.is_err());
        assert!(bus.delivered().await.is_empty());
    }
}
