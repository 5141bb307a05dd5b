//! # Pipeline Runner
//!
//! `run_pipeline(execution_id)` is the one function that invokes handlers. Every
//! backend calls it the same way: the local backend inline, queue workers after
//! dequeuing. It contains no backend-specific logic.
//!
//! ## Flow
//!
//! 1. `queued -> running` (a delivery for an execution that is not queued is skipped)
//! 2. Registry lookup and context construction
//! 3. Handler invocation under `catch_unwind`
//! 4. Success to `completed`; failures classified once and mapped to retry,
//!    dead letter, cancel or terminal failure

use dashmap::DashMap;
use futures::FutureExt;
use serde_json::json;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::context::ExecutionContext;
use super::error_classifier::{error_from_output, error_from_panic, ErrorClassifier, FailureDisposition};
use super::retry_policy::RetryPolicy;
use crate::error::{ErrorClass, HandlerError, PipelineResult};
use crate::ledger::ExecutionLedger;
use crate::logging::log_execution_operation;
use crate::models::{DeadLetterReason, Execution};
use crate::registry::Registry;
use crate::state_machine::ExecutionStatus;

/// Result of one `run_pipeline` call, as seen by the backend that made it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// Terminal failure after cancel was requested
    Failed,
    /// Back in `queued`; the backend redelivers after `delay`
    RetryScheduled { delay: Duration },
    DeadLettered,
    Cancelled,
    /// The execution was not `queued`, so nothing ran
    Skipped,
}

impl RunOutcome {
    pub fn is_final(&self) -> bool {
        !matches!(self, Self::RetryScheduled { .. })
    }
}

pub struct PipelineRunner {
    registry: Arc<Registry>,
    ledger: ExecutionLedger,
    classifier: ErrorClassifier,
    cancellations: DashMap<Uuid, CancellationToken>,
}

impl PipelineRunner {
    pub fn new(registry: Arc<Registry>, ledger: ExecutionLedger, retry_policy: RetryPolicy) -> Self {
        Self {
            registry,
            ledger,
            classifier: ErrorClassifier::new(retry_policy),
            cancellations: DashMap::new(),
        }
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        self.classifier.policy()
    }

    /// Signal an in-flight execution in this process. Returns `false` when it is not
    /// running here.
    pub fn signal_cancel(&self, execution_id: Uuid) -> bool {
        match self.cancellations.get(&execution_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.cancellations.len()
    }

    #[instrument(skip(self), fields(pipeline = tracing::field::Empty))]
    pub async fn run_pipeline(&self, execution_id: Uuid) -> PipelineResult<RunOutcome> {
        let Some(execution) = self.ledger.start(execution_id).await? else {
            return Ok(RunOutcome::Skipped);
        };
        tracing::Span::current().record("pipeline", execution.pipeline.as_str());

        let handler = match self.registry.get(&execution.pipeline) {
            Ok(handler) => handler,
            Err(e) => {
                error!(execution_id = %execution_id, error = %e, "No handler for queued execution");
                self.ledger
                    .fail_and_dead_letter(
                        execution_id,
                        &e.to_string(),
                        ErrorClass::Fatal,
                        DeadLetterReason::FatalError,
                        false,
                    )
                    .await?;
                return Ok(RunOutcome::DeadLettered);
            }
        };

        let token = CancellationToken::new();
        self.cancellations.insert(execution_id, token.clone());
        let ctx = ExecutionContext::new(&execution, self.ledger.clone(), token);

        log_execution_operation(
            "run",
            execution_id,
            &execution.pipeline,
            "started",
            Some(&format!("attempt {}", execution.retry_count + 1)),
        );
        let started = Instant::now();
        let result = AssertUnwindSafe(handler.run(&execution.params, &ctx))
            .catch_unwind()
            .await;
        self.cancellations.remove(&execution_id);
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let error = match result {
            Ok(Ok(output)) if output.is_completed() => {
                let mut metrics = output.metrics;
                metrics.insert("rejects".to_string(), json!(ctx.rejects().total().await?));
                metrics.insert("attempt_rejects".to_string(), json!(ctx.rejects().count()));
                metrics.insert("duration_ms".to_string(), json!(elapsed_ms));
                self.ledger.complete(execution_id, metrics).await?;
                log_execution_operation("run", execution_id, &execution.pipeline, "completed", None);
                return Ok(RunOutcome::Completed);
            }
            Ok(Ok(output)) => error_from_output(&output),
            Ok(Err(e)) => e,
            Err(panic) => error_from_panic(panic),
        };

        self.handle_failure(&execution, error).await
    }

    async fn handle_failure(
        &self,
        execution: &Execution,
        error: HandlerError,
    ) -> PipelineResult<RunOutcome> {
        let execution_id = execution.execution_id;
        let class = self.classifier.classify(&error);
        let status = self.ledger.status(execution_id).await?;
        let message = error.to_string();
        debug!(
            execution_id = %execution_id,
            class = %class,
            status = %status,
            error = %message,
            "Classifying handler failure"
        );

        match self
            .classifier
            .disposition(class, status, execution.retry_count)
        {
            FailureDisposition::Retry { delay } => {
                let requeued = self
                    .ledger
                    .fail_and_requeue(execution_id, &message, delay)
                    .await?;
                if requeued.status == ExecutionStatus::Queued {
                    Ok(RunOutcome::RetryScheduled { delay })
                } else {
                    Ok(RunOutcome::Failed)
                }
            }
            FailureDisposition::DeadLetter {
                reason,
                charge_retry,
            } => {
                self.ledger
                    .fail_and_dead_letter(execution_id, &message, class, reason, charge_retry)
                    .await?;
                Ok(RunOutcome::DeadLettered)
            }
            FailureDisposition::Cancel => {
                if status == ExecutionStatus::Running {
                    self.ledger.request_cancel(execution_id).await?;
                }
                self.ledger
                    .cancel(execution_id, Some("observed at checkpoint"))
                    .await?;
                info!(execution_id = %execution_id, pipeline = %execution.pipeline, "Cancellation honored");
                Ok(RunOutcome::Cancelled)
            }
            FailureDisposition::Fail => {
                warn!(
                    execution_id = %execution_id,
                    error = %message,
                    "Handler failed after cancel was requested"
                );
                self.ledger.fail(execution_id, &message, class).await?;
                Ok(RunOutcome::Failed)
            }
        }
    }
}

impl std::fmt::Debug for PipelineRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineRunner")
            .field("registry", &self.registry)
            .field("retry_policy", self.classifier.policy())
            .field("in_flight", &self.cancellations.len())
            .finish()
    }
}
