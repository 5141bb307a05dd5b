//! # Dispatcher
//!
//! The only way work enters the system. `submit` validates, creates the execution
//! under the logical-key guard, and hands it to the configured backend.
//!
//! Only malformed submissions raise: `PipelineNotFound`, `ParamValidation` and
//! `ConcurrencyConflict`. Pipeline-level failures are recorded in the ledger and the
//! returned execution shows where it ended up.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::dead_letter_queue::DeadLetterQueue;
use crate::backend::Backend;
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::ledger::ExecutionLedger;
use crate::logging::log_execution_operation;
use crate::models::{DeadLetterReason, Execution, NewExecution, Resolution};
use crate::registry::Registry;
use crate::state_machine::ExecutionStatus;
use crate::types::TriggerSource;

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    ledger: ExecutionLedger,
    backend: Arc<dyn Backend>,
    dead_letters: DeadLetterQueue,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, ledger: ExecutionLedger, backend: Arc<dyn Backend>) -> Self {
        let dead_letters = DeadLetterQueue::new(ledger.pool().clone());
        Self {
            registry,
            ledger,
            backend,
            dead_letters,
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn ledger(&self) -> &ExecutionLedger {
        &self.ledger
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Submit a pipeline run.
    ///
    /// With the local backend this returns after the run finishes; with the queue
    /// backend it returns once the execution is enqueued.
    #[instrument(skip(self, request), fields(pipeline = %request.pipeline, lane = %request.lane))]
    pub async fn submit(&self, mut request: NewExecution) -> PipelineResult<Execution> {
        request.params = self
            .registry
            .validate_params(&request.pipeline, &request.params)?;
        let execution = self.ledger.create(request).await?;
        self.hand_off(execution).await
    }

    /// Cancel an execution.
    ///
    /// Before it starts this is immediate. Once running, the execution moves to
    /// `cancelling` and stops at its next checkpoint.
    pub async fn cancel(&self, execution_id: Uuid) -> PipelineResult<Execution> {
        let execution = self.ledger.get(execution_id).await?;
        match execution.status {
            ExecutionStatus::Pending | ExecutionStatus::Queued => {
                match self
                    .ledger
                    .cancel(execution_id, Some("cancelled before start"))
                    .await
                {
                    Ok(cancelled) => {
                        if let Err(e) = self.backend.cancel(execution_id).await {
                            warn!(execution_id = %execution_id, error = %e, "Could not withdraw cancelled execution from backend");
                        }
                        Ok(cancelled)
                    }
                    // A worker started it in between.
                    Err(PipelineError::InvalidTransition { .. }) => {
                        self.cancel_running(execution_id).await
                    }
                    Err(e) => Err(e),
                }
            }
            ExecutionStatus::Running => self.cancel_running(execution_id).await,
            ExecutionStatus::Cancelling => Ok(execution),
            status => Err(PipelineError::InvalidTransition {
                execution_id,
                from: status.to_string(),
                to: ExecutionStatus::Cancelled.to_string(),
            }),
        }
    }

    async fn cancel_running(&self, execution_id: Uuid) -> PipelineResult<Execution> {
        self.ledger.request_cancel(execution_id).await?;
        let signalled = self.backend.cancel(execution_id).await?;
        info!(execution_id = %execution_id, signalled, "Cancel requested for running execution");
        self.ledger.get(execution_id).await
    }

    /// Retry a dead letter by spawning a new execution with the same pipeline,
    /// params and lane, linked through `parent_execution_id`. The original
    /// execution is never resumed.
    ///
    /// Creating the new execution and resolving the entry commit together, so an
    /// entry is retried at most once.
    pub async fn retry_dead_letter(
        &self,
        dead_letter_id: Uuid,
        resolved_by: &str,
    ) -> PipelineResult<Execution> {
        let entry = self.dead_letters.get(dead_letter_id).await?;
        if !entry.is_pending() {
            return Err(PipelineError::DeadLetterAlreadyResolved(dead_letter_id));
        }
        let original = self.ledger.get(entry.execution_id).await?;
        self.registry.get(&original.pipeline)?;

        let request = NewExecution::new(original.pipeline.clone(), original.params.clone())
            .with_lane(original.lane.clone())
            .with_trigger_source(TriggerSource::Retry)
            .with_logical_key(original.logical_key.clone())
            .with_parent(original.execution_id);

        let mut tx = self.ledger.pool().begin().await?;
        let execution = self.ledger.create_in(&mut *tx, &request).await?;
        let resolved = sqlx::query(
            "UPDATE dead_letters \
             SET resolved_at = ?1, resolved_by = ?2, resolution = ?3, retry_execution_id = ?4 \
             WHERE dead_letter_id = ?5 AND resolved_at IS NULL",
        )
        .bind(Utc::now())
        .bind(resolved_by)
        .bind(Resolution::Retried.as_str())
        .bind(execution.execution_id)
        .bind(dead_letter_id)
        .execute(&mut *tx)
        .await?;
        if resolved.rows_affected() == 0 {
            return Err(PipelineError::DeadLetterAlreadyResolved(dead_letter_id));
        }
        tx.commit().await?;

        info!(
            dead_letter_id = %dead_letter_id,
            parent_execution_id = %original.execution_id,
            execution_id = %execution.execution_id,
            resolved_by,
            "Dead letter retried as new execution"
        );
        self.hand_off(execution).await
    }

    /// `pending -> queued`, then the backend. A backend that refuses the execution
    /// dead-letters it without charging a retry.
    async fn hand_off(&self, execution: Execution) -> PipelineResult<Execution> {
        let execution_id = execution.execution_id;
        let queued = self
            .ledger
            .mark_queued(execution_id, self.backend.name())
            .await?;
        log_execution_operation(
            "submit",
            execution_id,
            &queued.pipeline,
            "queued",
            Some(self.backend.name()),
        );

        match self.backend.submit(execution_id, &queued.lane).await {
            Ok(backend_run_id) => {
                self.ledger
                    .set_backend_run_id(execution_id, &backend_run_id)
                    .await?;
            }
            Err(e) => {
                error!(execution_id = %execution_id, backend = self.backend.name(), error = %e, "Backend submit failed");
                // Dead-letter only if no run began; otherwise the ledger shows where it stopped.
                if self.ledger.status(execution_id).await? == ExecutionStatus::Queued {
                    self.ledger
                        .fail_and_dead_letter(
                            execution_id,
                            &format!("backend submit failed: {e}"),
                            ErrorClass::Transient,
                            DeadLetterReason::BackendSubmitFailed,
                            false,
                        )
                        .await?;
                }
            }
        }

        self.ledger.get(execution_id).await
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("registry", &self.registry)
            .field("backend", &self.backend.name())
            .finish()
    }
}
