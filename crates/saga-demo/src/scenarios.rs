//! Demonstration scenarios run against the in-memory collaborators.

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use common::{CorrelationContext, OperationName, ServiceName};
use consistency::{BoxError, ConsistencyCoordinator, ConsistencyValidation, CoordinatorConfig};
use event_bus::InMemoryEventBus;
use saga::{
    EngineConfig, RetryPolicy, SagaDefinition, SagaExecution, SagaOrchestrator, SagaRegistry,
    SagaStep, TransactionOptions,
};
use serde_json::json;
use state_store::InMemoryStateStore;

pub type DemoResult<T> = Result<T, Box<dyn Error + Send + Sync>>;

/// The three-step order fulfilment saga.
pub fn order_fulfillment(order_id: &str) -> DemoResult<SagaDefinition> {
    let retry = RetryPolicy::new(2, Duration::from_millis(50), Duration::from_millis(500), 2.0);
    Ok(SagaDefinition::builder("order-fulfillment")
        .metadata("order_id", json!(order_id))
        .step(
            SagaStep::parse("reserve-inventory", "inventory", "reserve")?
                .with_name("Reserve inventory")
                .with_data(json!({"order_id": order_id, "sku": "SKU-001", "quantity": 2}))
                .with_compensation(
                    OperationName::new("release")?,
                    json!({"order_id": order_id, "sku": "SKU-001"}),
                )
                .with_retry_policy(retry),
        )
        .step(
            SagaStep::parse("charge-payment", "payment", "charge")?
                .with_name("Charge payment")
                .with_data(json!({"order_id": order_id, "amount_cents": 4500}))
                .with_compensation(OperationName::new("refund")?, json!({"order_id": order_id}))
                .with_retry_policy(retry),
        )
        .step(
            SagaStep::parse("ship-order", "shipping", "ship")?
                .with_name("Ship order")
                .with_data(json!({"order_id": order_id}))
                .with_timeout(Duration::from_secs(2))
                .with_retry_policy(retry),
        )
        .build()?)
}

fn summarize(execution: &SagaExecution) {
    tracing::info!(
        saga_id = %execution.saga_id(),
        status = %execution.status(),
        completed = ?execution.completed_steps(),
        compensated = ?execution.compensation().map(|c| &c.compensated_steps),
        error = execution.error_message().unwrap_or("-"),
        "saga finished"
    );
}

/// Runs one saga to completion and one that fails at shipping.
pub async fn run_sagas(config: EngineConfig) -> DemoResult<()> {
    let store = InMemoryStateStore::new();
    let bus = InMemoryEventBus::new();
    let orchestrator =
        SagaOrchestrator::with_config(store, bus.clone(), SagaRegistry::new(), config);

    let handle = orchestrator
        .execute_distributed_transaction(order_fulfillment("ORD-1001")?, None)
        .await?;
    summarize(&handle.wait().await?);

    bus.fail_always("shipping", "ship", "carrier unavailable").await;
    let definition = Arc::new(order_fulfillment("ORD-1002")?);
    let handle = orchestrator
        .execute_distributed_transaction(
            definition,
            Some(TransactionOptions::default().correlation(CorrelationContext::new())),
        )
        .await?;
    let saga_id = handle.saga_id();
    handle.wait().await?;
    summarize(&orchestrator.get_saga_execution(saga_id).await?);

    Ok(())
}

/// Runs an optimistic update, a stale resubmission and a validation pass.
pub async fn run_consistency(config: CoordinatorConfig) -> DemoResult<()> {
    let store = InMemoryStateStore::new();
    let bus = InMemoryEventBus::new();
    let coordinator = ConsistencyCoordinator::with_config(store, bus.clone(), config);

    let seen = coordinator.current_version("inventory", "SKU-001").await?;
    let version = coordinator
        .handle_eventual_consistency("inventory", "SKU-001", seen, || async {
            tracing::info!("adjusting stock level");
            Ok::<_, BoxError>(())
        })
        .await?;
    tracing::info!(%version, "stock level updated");

    if let Err(err) = coordinator
        .handle_eventual_consistency("inventory", "SKU-001", seen, || async {
            Ok::<_, BoxError>(())
        })
        .await
    {
        tracing::info!(conflict = err.is_conflict(), error = %err, "stale update rejected");
    }

    bus.fail_always("billing", "validate", "ledger lagging").await;
    let validations = [
        ConsistencyValidation::new(
            "inventory",
            "SKU-001",
            ServiceName::new("inventory")?,
            json!({"version": version.as_u64()}),
        ),
        ConsistencyValidation::new(
            "order",
            "ORD-1001",
            ServiceName::new("billing")?,
            json!({"amount_cents": 4500}),
        ),
    ];
    match coordinator
        .validate_data_consistency(&validations, &CorrelationContext::new())
        .await
    {
        Ok(report) => tracing::info!(%report, "all services consistent"),
        Err(err) => tracing::warn!(error = %err, "services disagree"),
    }

    Ok(())
}
