//! Step execution with bounded deadlines and retry/backoff.

use std::time::Duration;

use chrono::Utc;
use common::{CorrelationContext, SagaId, ServiceName};
use event_bus::{EventBus, EventEnvelope, EventId};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::definition::SagaStep;
use crate::events;
use crate::execution::SagaStepResult;
use crate::retry::RetryPolicy;

/// Per-run context handed to the executor for every step.
#[derive(Debug, Clone, Copy)]
pub struct StepContext<'a> {
    pub saga_id: SagaId,
    pub correlation: &'a CorrelationContext,
    /// Deadline used for steps that do not set their own timeout.
    pub default_timeout: Duration,
    pub cancel: &'a CancellationToken,
}

/// An acknowledged invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub event_id: EventId,
    pub attempts: u32,
}

/// An invocation that was never acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryFailure {
    pub error: String,
    pub attempts: u32,
    pub cancelled: bool,
}

/// Runs saga steps against the event bus.
#[derive(Debug, Clone)]
pub struct StepExecutor<B> {
    bus: B,
    source: ServiceName,
}

impl<B: EventBus> StepExecutor<B> {
    /// Creates an executor publishing as `source`.
    pub fn new(bus: B, source: ServiceName) -> Self {
        Self { bus, source }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn source(&self) -> &ServiceName {
        &self.source
    }

    /// Runs one step to completion or exhaustion of its retry policy.
    ///
    /// Never panics on transport errors; a failed step is reported through
    /// the returned result.
    #[tracing::instrument(skip(self, step, ctx), fields(saga_id = %ctx.saga_id, step_id = %step.step_id))]
    pub async fn execute_step(&self, step: &SagaStep, ctx: &StepContext<'_>) -> SagaStepResult {
        let executed_at = Utc::now();
        let start = Instant::now();
        let deadline = deadline_after(start, step.timeout.unwrap_or(ctx.default_timeout));
        let policy = step.effective_retry_policy();

        let outcome = self
            .invoke_with_retry(
                |attempt| {
                    events::step_invocation(&self.source, ctx.saga_id, step, attempt, ctx.correlation)
                },
                &policy,
                deadline,
                ctx.cancel,
            )
            .await;

        let duration = start.elapsed();
        match outcome {
            Ok(delivery) => {
                tracing::info!(attempts = delivery.attempts, ?duration, "saga step acknowledged");
                SagaStepResult::completed(
                    step.step_id.clone(),
                    serde_json::json!({
                        "attempts": delivery.attempts,
                        "event_id": delivery.event_id.to_string(),
                    }),
                    executed_at,
                    duration,
                    delivery.attempts,
                )
            }
            Err(failure) => {
                tracing::warn!(
                    attempts = failure.attempts,
                    error = %failure.error,
                    cancelled = failure.cancelled,
                    "saga step failed"
                );
                SagaStepResult::failed(
                    step.step_id.clone(),
                    failure.error,
                    executed_at,
                    duration,
                    failure.attempts,
                )
            }
        }
    }

    /// Publishes the envelope produced by `build` until acknowledged.
    ///
    /// `build` receives the 1-indexed attempt number. Gives up when the
    /// policy is exhausted, the deadline passes, or `cancel` fires.
    pub async fn invoke_with_retry<F>(
        &self,
        build: F,
        policy: &RetryPolicy,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Delivery, DeliveryFailure>
    where
        F: Fn(u32) -> EventEnvelope,
    {
        let max_attempts = policy.max_attempts();
        let mut last_error = String::from("no attempt made");
        let mut attempts = 0;

        for attempt in 1..=max_attempts {
            attempts = attempt;
            let envelope = build(attempt);
            let event_id = envelope.event_id;
            metrics::counter!("saga_step_attempts_total").increment(1);

            let published = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled(attempts)),
                published = tokio::time::timeout_at(deadline, self.bus.publish(envelope)) => published,
            };

            match published {
                Ok(Ok(())) => return Ok(Delivery { event_id, attempts }),
                Ok(Err(err)) => last_error = err.to_string(),
                Err(_elapsed) => {
                    last_error = "deadline exceeded awaiting acknowledgment".to_string();
                    break;
                }
            }

            if attempt == max_attempts {
                break;
            }
            if Instant::now() >= deadline {
                last_error = format!("{last_error} (deadline exceeded, retry skipped)");
                break;
            }

            let delay = policy.delay_for_attempt(attempt);
            tracing::debug!(attempt, ?delay, error = %last_error, "retrying invocation");
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(cancelled(attempts)),
                () = tokio::time::sleep(delay) => {}
            }

            if Instant::now() >= deadline {
                last_error = format!("{last_error} (deadline exceeded, retry skipped)");
                break;
            }
        }

        Err(DeliveryFailure {
            error: last_error,
            attempts,
            cancelled: false,
        })
    }
}

fn cancelled(attempts: u32) -> DeliveryFailure {
    DeliveryFailure {
        error: "saga cancelled".to_string(),
        attempts,
        cancelled: true,
    }
}

/// Horizon used when a timeout is too large to represent as an instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `start + timeout`, saturating to a far-future instant instead of overflowing.
pub(crate) fn deadline_after(start: Instant, timeout: Duration) -> Instant {
    start
        .checked_add(timeout)
        .unwrap_or_else(|| start + FAR_FUTURE)
}
