//! Integration tests for saga orchestration against the in-memory collaborators.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use common::{CorrelationContext, OperationName};
use event_bus::{EventBus, EventEnvelope, InMemoryEventBus};
use saga::events::{SAGA_COMPENSATED, SAGA_COMPLETED, STEP_COMPENSATE, STEP_EXECUTE};
use saga::{
    CompensationStatus, ConsistencyLevel, RetryPolicy, SagaDefinition, SagaError, SagaExecution,
    SagaOrchestrator, SagaRegistry, SagaStatus, SagaStep, TransactionOptions,
};
use serde_json::json;
use state_store::{
    DeleteOptions, ETag, InMemoryStateStore, SaveOptions, StateEntry, StateStore,
};

struct TestHarness<B = InMemoryEventBus> {
    orchestrator: SagaOrchestrator<InMemoryStateStore, B>,
    store: InMemoryStateStore,
    bus: InMemoryEventBus,
}

impl TestHarness {
    fn new() -> Self {
        let store = InMemoryStateStore::new();
        let bus = InMemoryEventBus::new();
        let orchestrator = SagaOrchestrator::new(store.clone(), bus.clone(), SagaRegistry::new());
        Self {
            orchestrator,
            store,
            bus,
        }
    }
}

fn quick_retry() -> RetryPolicy {
    RetryPolicy::new(2, Duration::from_millis(10), Duration::from_millis(100), 2.0)
}

fn compensable(id: &str, service: &str, operation: &str, undo: &str) -> SagaStep {
    SagaStep::parse(id, service, operation)
        .unwrap()
        .with_data(json!({"step": id}))
        .with_compensation(OperationName::new(undo).unwrap(), json!({"undo": id}))
        .with_retry_policy(quick_retry())
}

fn order_fulfillment() -> SagaDefinition {
    SagaDefinition::builder("order-fulfillment")
        .step(compensable("reserve-inventory", "inventory", "reserve", "release"))
        .step(compensable("charge-payment", "payment", "charge", "refund"))
        .step(
            SagaStep::parse("ship-order", "shipping", "ship")
                .unwrap()
                .with_retry_policy(quick_retry()),
        )
        .build()
        .unwrap()
}

fn n_step_saga(n: usize) -> SagaDefinition {
    (0..n)
        .fold(SagaDefinition::builder(format!("chain-{n}")), |builder, i| {
            builder.step(compensable(
                &format!("step-{i}"),
                &format!("svc-{i}"),
                "apply",
                "revert",
            ))
        })
        .build()
        .unwrap()
}

/// Status sequence recorded in the store, with consecutive repeats collapsed.
async fn status_history(store: &InMemoryStateStore, execution: &SagaExecution) -> Vec<String> {
    let mut statuses: Vec<String> = store
        .history(&SagaExecution::storage_key(execution.saga_id()))
        .await
        .iter()
        .map(|v| v["status"].as_str().unwrap().to_string())
        .collect();
    statuses.dedup();
    statuses
}

#[tokio::test(start_paused = true)]
async fn test_happy_path_completes_all_steps_in_order() {
    let h = TestHarness::new();

    let handle = h
        .orchestrator
        .execute_distributed_transaction(n_step_saga(5), None)
        .await
        .unwrap();
    let execution = handle.wait().await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Completed);
    assert_eq!(
        execution.completed_steps(),
        &["step-0", "step-1", "step-2", "step-3", "step-4"]
    );

    let invoked: Vec<String> = h
        .bus
        .delivered_of_type(STEP_EXECUTE)
        .await
        .iter()
        .map(|e| e.target_service.as_ref().unwrap().to_string())
        .collect();
    assert_eq!(invoked, vec!["svc-0", "svc-1", "svc-2", "svc-3", "svc-4"]);
    assert_eq!(h.bus.delivered_of_type(SAGA_COMPLETED).await.len(), 1);
    assert!(h.bus.delivered_of_type(STEP_COMPENSATE).await.is_empty());

    assert_eq!(
        status_history(&h.store, &execution).await,
        vec!["pending", "executing", "completed"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_failure_at_each_step_compensates_prefix_in_reverse() {
    let n = 4;
    for k in 0..n {
        let h = TestHarness::new();
        h.bus
            .fail_always(&format!("svc-{k}"), "apply", "rejected")
            .await;

        let execution = h
            .orchestrator
            .execute_distributed_transaction(n_step_saga(n), None)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();

        assert_eq!(execution.status(), SagaStatus::Compensated, "failing step {k}");
        assert_eq!(execution.failed_step().unwrap().step_id, format!("step-{k}"));
        assert_eq!(execution.completed_steps().len(), k);

        let expected: Vec<String> = (0..k).rev().map(|i| format!("step-{i}")).collect();
        assert_eq!(execution.compensation().unwrap().compensated_steps, expected);

        let reverted: Vec<String> = h
            .bus
            .delivered_of_type(STEP_COMPENSATE)
            .await
            .iter()
            .map(|e| e.target_service.as_ref().unwrap().to_string())
            .collect();
        let expected_services: Vec<String> = (0..k).rev().map(|i| format!("svc-{i}")).collect();
        assert_eq!(reverted, expected_services);

        // Steps after the failure are never invoked.
        for later in k + 1..n {
            assert_eq!(h.bus.attempt_count(&format!("svc-{later}"), "apply").await, 0);
        }
    }
}

#[tokio::test(start_paused = true)]
async fn test_order_fulfillment_shipping_failure_status_sequence() {
    let h = TestHarness::new();
    h.bus.fail_always("shipping", "ship", "no carrier").await;

    let execution = h
        .orchestrator
        .execute_distributed_transaction(order_fulfillment(), None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    assert_eq!(
        status_history(&h.store, &execution).await,
        vec!["pending", "executing", "failed", "compensating", "compensated"]
    );
    assert_eq!(h.bus.attempt_count("shipping", "ship").await, 3);
    assert_eq!(h.bus.attempt_count("payment", "refund").await, 1);
    assert_eq!(h.bus.attempt_count("inventory", "release").await, 1);

    let compensated = h.bus.delivered_of_type(SAGA_COMPENSATED).await;
    assert_eq!(compensated.len(), 1);
    assert_eq!(compensated[0].payload["data"]["failed_step"], "ship-order");
}

#[tokio::test(start_paused = true)]
async fn test_transient_failure_is_retried_to_completion() {
    let h = TestHarness::new();
    h.bus.fail_times("payment", "charge", 2, "broker busy").await;

    let execution = h
        .orchestrator
        .execute_distributed_transaction(order_fulfillment(), None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status(), SagaStatus::Completed);
    assert_eq!(h.bus.attempt_count("payment", "charge").await, 3);
}

#[tokio::test(start_paused = true)]
async fn test_terminal_saga_reads_are_stable() {
    let h = TestHarness::new();
    let handle = h
        .orchestrator
        .execute_distributed_transaction(order_fulfillment(), None)
        .await
        .unwrap();
    let saga_id = handle.saga_id();
    handle.wait().await.unwrap();

    let first = h.orchestrator.get_saga_execution(saga_id).await.unwrap();
    let second = h.orchestrator.get_saga_execution(saga_id).await.unwrap();
    assert!(first.is_terminal());
    assert_eq!(first, second);

    // A fresh orchestrator over the same store recovers the record.
    let restarted =
        SagaOrchestrator::new(h.store.clone(), h.bus.clone(), SagaRegistry::new());
    assert_eq!(restarted.get_saga_execution(saga_id).await.unwrap(), first);
}

#[tokio::test(start_paused = true)]
async fn test_compensation_failure_requires_intervention() {
    let h = TestHarness::new();
    h.bus.fail_always("shipping", "ship", "no carrier").await;
    h.bus.fail_always("payment", "refund", "ledger locked").await;

    let execution = h
        .orchestrator
        .execute_distributed_transaction(order_fulfillment(), None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensating);
    assert!(execution.requires_intervention());
    let compensation = execution.compensation().unwrap();
    assert_eq!(compensation.status, CompensationStatus::Failed);
    assert!(compensation.compensated_steps.is_empty());
    // Halted at the refund; the reservation is left for an operator.
    assert_eq!(h.bus.attempt_count("inventory", "release").await, 0);
    assert!(h.bus.delivered_of_type(SAGA_COMPENSATED).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_stops_before_next_step() {
    let h = TestHarness::new();
    h.bus
        .set_latency("payment", "charge", Duration::from_secs(2))
        .await;

    let handle = h
        .orchestrator
        .execute_distributed_transaction(order_fulfillment(), None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.cancel();
    let execution = handle.wait().await.unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    assert_eq!(execution.completed_steps(), &["reserve-inventory"]);
    let failed = execution.failed_step().unwrap();
    assert_eq!(failed.step_id, "charge-payment");
    assert_eq!(failed.error.as_deref(), Some("saga cancelled"));
    assert_eq!(h.bus.attempt_count("shipping", "ship").await, 0);
    assert_eq!(h.bus.attempt_count("inventory", "release").await, 1);
}

#[tokio::test(start_paused = true)]
async fn test_step_deadline_uses_transaction_timeout() {
    let h = TestHarness::new();
    h.bus
        .set_latency("inventory", "reserve", Duration::from_secs(60))
        .await;

    let execution = h
        .orchestrator
        .execute_distributed_transaction(
            order_fulfillment(),
            Some(TransactionOptions::default().timeout(Duration::from_secs(5))),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    assert!(execution.completed_steps().is_empty());
    assert!(
        execution
            .error_message()
            .unwrap()
            .contains("deadline exceeded")
    );
}

#[tokio::test]
async fn test_store_unavailable_rejects_submission() {
    let h = TestHarness::new();
    h.store.set_unavailable(true);

    let result = h
        .orchestrator
        .execute_distributed_transaction(order_fulfillment(), None)
        .await;

    assert!(matches!(result, Err(SagaError::StateStore(_))));
    assert!(h.bus.delivered().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_correlation_ids_on_every_envelope() {
    let h = TestHarness::new();
    h.bus.fail_always("shipping", "ship", "no carrier").await;
    let ctx = CorrelationContext::from_parts("order-42", "trace-42");

    let execution = h
        .orchestrator
        .execute_distributed_transaction(
            order_fulfillment(),
            Some(
                TransactionOptions::default()
                    .consistency(ConsistencyLevel::Strong)
                    .correlation(ctx),
            ),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.correlation().correlation_id, "order-42");
    let delivered = h.bus.delivered().await;
    assert!(delivered.len() >= 5);
    for envelope in delivered {
        assert_eq!(envelope.correlation_id, "order-42");
        assert_eq!(envelope.trace_id, "trace-42");
        assert_eq!(envelope.entity_id, execution.saga_id().to_string());
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_sagas_are_isolated() {
    let h = TestHarness::new();
    h.bus.fail_always("svc-1", "apply", "rejected").await;

    let mut handles = Vec::new();
    for n in 1..=6 {
        handles.push(
            h.orchestrator
                .execute_distributed_transaction(n_step_saga(n), None)
                .await
                .unwrap(),
        );
    }

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.wait().await.unwrap());
    }

    // Only the one-step saga avoids svc-1.
    assert_eq!(outcomes[0].status(), SagaStatus::Completed);
    for execution in &outcomes[1..] {
        assert_eq!(execution.status(), SagaStatus::Compensated);
        assert_eq!(execution.completed_steps(), &["step-0"]);
    }
    assert_eq!(h.orchestrator.registry().len().await, 6);

    // A separate orchestrator with its own registry sees none of them.
    let other = SagaOrchestrator::new(
        InMemoryStateStore::new(),
        InMemoryEventBus::new(),
        SagaRegistry::new(),
    );
    assert!(other.registry().is_empty().await);
    assert!(matches!(
        other.get_saga_execution(outcomes[0].saga_id()).await,
        Err(SagaError::SagaNotFound(_))
    ));
}

/// Bus whose handler for one service panics.
#[derive(Clone)]
struct PanickingBus {
    inner: InMemoryEventBus,
    service: &'static str,
}

#[async_trait]
impl EventBus for PanickingBus {
    async fn publish(&self, event: EventEnvelope) -> event_bus::Result<()> {
        if event
            .target_service
            .as_ref()
            .is_some_and(|s| s.as_str() == self.service)
        {
            panic!("handler for {} exploded", self.service);
        }
        self.inner.publish(event).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_panic_during_step_is_recorded_and_compensated() {
    let store = InMemoryStateStore::new();
    let inner = InMemoryEventBus::new();
    let bus = PanickingBus {
        inner: inner.clone(),
        service: "payment",
    };
    let h = TestHarness {
        orchestrator: SagaOrchestrator::new(store.clone(), bus, SagaRegistry::new()),
        store,
        bus: inner,
    };

    let execution = h
        .orchestrator
        .execute_distributed_transaction(Arc::new(order_fulfillment()), None)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    let failed = execution.failed_step().unwrap();
    assert_eq!(failed.step_id, "charge-payment");
    assert!(failed.error.as_deref().unwrap().contains("exploded"));
    assert_eq!(
        execution.compensation().unwrap().compensated_steps,
        vec!["reserve-inventory"]
    );
    assert_eq!(h.bus.attempt_count("inventory", "release").await, 1);
    assert_eq!(
        status_history(&h.store, &execution).await,
        vec!["pending", "executing", "failed", "compensating", "compensated"]
    );
}

/// Store whose reads take a while, widening the window between a lookup and a save.
#[derive(Clone)]
struct SlowReadStore {
    inner: InMemoryStateStore,
    delay: Duration,
}

#[async_trait]
impl StateStore for SlowReadStore {
    async fn save(
        &self,
        key: &str,
        value: serde_json::Value,
        options: SaveOptions,
    ) -> state_store::Result<ETag> {
        self.inner.save(key, value, options).await
    }

    async fn get(&self, key: &str) -> state_store::Result<Option<StateEntry>> {
        let entry = self.inner.get(key).await;
        tokio::time::sleep(self.delay).await;
        entry
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> state_store::Result<()> {
        self.inner.delete(key, options).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_duplicate_submission_runs_once() {
    let inner = InMemoryStateStore::new();
    let bus = InMemoryEventBus::new();
    let store = SlowReadStore {
        inner: inner.clone(),
        delay: Duration::from_millis(10),
    };
    let orchestrator = SagaOrchestrator::new(store, bus.clone(), SagaRegistry::new());
    let definition = Arc::new(
        SagaDefinition::builder("single")
            .step(compensable("reserve", "inventory", "reserve", "release"))
            .build()
            .unwrap(),
    );

    let (first, second) = tokio::join!(
        orchestrator.execute_distributed_transaction(definition.clone(), None),
        orchestrator.execute_distributed_transaction(definition.clone(), None),
    );

    let (accepted, rejected) = match (first, second) {
        (Ok(handle), Err(err)) | (Err(err), Ok(handle)) => (handle, err),
        (first, second) => panic!(
            "expected exactly one submission to be accepted, got {:?} and {:?}",
            first.map(|h| h.saga_id()),
            second.map(|h| h.saga_id())
        ),
    };
    assert!(matches!(rejected, SagaError::AlreadyStarted(id) if id == definition.id));

    let execution = accepted.wait().await.unwrap();
    assert_eq!(execution.status(), SagaStatus::Completed);
    assert_eq!(bus.attempt_count("inventory", "reserve").await, 1);
    assert_eq!(
        status_history(&inner, &execution).await,
        vec!["pending", "executing", "completed"]
    );
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_timeouts_do_not_fail_the_saga() {
    let h = TestHarness::new();
    let definition = SagaDefinition::builder("unbounded")
        .step(compensable("a", "inventory", "reserve", "release").with_timeout(Duration::MAX))
        .step(compensable("b", "payment", "charge", "refund"))
        .build()
        .unwrap();

    let execution = h
        .orchestrator
        .execute_distributed_transaction(
            definition,
            Some(
                TransactionOptions::default()
                    .timeout(Duration::MAX)
                    .compensation_timeout(Duration::MAX),
            ),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status(), SagaStatus::Completed);
    assert_eq!(execution.error_message(), None);
}

#[tokio::test(start_paused = true)]
async fn test_unbounded_compensation_timeout_still_compensates() {
    let h = TestHarness::new();
    h.bus.fail_always("shipping", "ship", "no carrier").await;

    let execution = h
        .orchestrator
        .execute_distributed_transaction(
            order_fulfillment(),
            Some(TransactionOptions::default().compensation_timeout(Duration::MAX)),
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(execution.status(), SagaStatus::Compensated);
    assert!(!execution.error_message().unwrap().contains("panic"));
    assert_eq!(
        execution.compensation().unwrap().compensated_steps,
        vec!["charge-payment", "reserve-inventory"]
    );
}
