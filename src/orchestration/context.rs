//! # Execution Context
//!
//! Everything a handler may touch during one attempt: identity and lineage, the
//! reject sink and quality runner bound to this execution, the capture store, the
//! manifest factory, and the cooperative cancellation signal.

use serde_json::json;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use crate::capture::CaptureStore;
use crate::error::{HandlerError, PipelineResult};
use crate::ledger::ExecutionLedger;
use crate::manifest::{IdempotencyGuard, WorkManifest};
use crate::models::{Execution, NewReject};
use crate::quality::{QualityRunner, RejectSink};
use crate::state_machine::{ExecutionEventType, ExecutionStatus};
use crate::types::{Lane, Metrics};

#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub batch_id: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub lane: Lane,
    /// Failures already charged; 0 on the first attempt
    pub retry_count: u32,
    /// Reprocess stages the manifest already records as done
    pub force: bool,
    ledger: ExecutionLedger,
    rejects: RejectSink,
    quality: QualityRunner,
    captures: CaptureStore,
    cancellation: CancellationToken,
}

impl ExecutionContext {
    pub(crate) fn new(
        execution: &Execution,
        ledger: ExecutionLedger,
        cancellation: CancellationToken,
    ) -> Self {
        let pool = ledger.pool().clone();
        let force = execution
            .params
            .get("force")
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false);

        Self {
            execution_id: execution.execution_id,
            pipeline: execution.pipeline.clone(),
            batch_id: execution.batch_id(),
            parent_execution_id: execution.parent_execution_id,
            lane: execution.lane.clone(),
            retry_count: execution.retry_count,
            force,
            rejects: RejectSink::new(pool.clone(), execution.execution_id),
            quality: QualityRunner::new(pool.clone(), execution.execution_id),
            captures: CaptureStore::new(pool),
            ledger,
            cancellation,
        }
    }

    /// The store, for domain tables written outside a stage transaction.
    pub fn pool(&self) -> &SqlitePool {
        self.ledger.pool()
    }

    pub fn rejects(&self) -> &RejectSink {
        &self.rejects
    }

    /// Record one reject and carry on.
    pub async fn reject(&self, reject: NewReject) -> PipelineResult<i64> {
        self.rejects.record(reject).await
    }

    pub fn quality(&self) -> &QualityRunner {
        &self.quality
    }

    pub fn captures(&self) -> &CaptureStore {
        &self.captures
    }

    pub fn manifest<S: Into<String>>(
        &self,
        domain: impl Into<String>,
        stages: impl IntoIterator<Item = S>,
    ) -> PipelineResult<WorkManifest> {
        WorkManifest::new(self.pool().clone(), domain, stages)
    }

    /// Idempotency guard over a manifest, stamping writes with this execution.
    pub fn guard<S: Into<String>>(
        &self,
        domain: impl Into<String>,
        stages: impl IntoIterator<Item = S>,
    ) -> PipelineResult<IdempotencyGuard> {
        Ok(IdempotencyGuard::new(self.manifest(domain, stages)?).with_execution(self.execution_id))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Stage boundary. Returns `HandlerError::Cancelled` when cancellation was
    /// signalled in-process or recorded in the ledger by another process.
    pub async fn checkpoint(&self) -> Result<(), HandlerError> {
        if self.cancellation.is_cancelled() {
            debug!(execution_id = %self.execution_id, "Cancellation observed at checkpoint");
            return Err(HandlerError::Cancelled);
        }
        if self.ledger.status(self.execution_id).await? == ExecutionStatus::Cancelling {
            self.cancellation.cancel();
            debug!(execution_id = %self.execution_id, "Cancel request found in ledger at checkpoint");
            return Err(HandlerError::Cancelled);
        }
        Ok(())
    }

    pub async fn stage_started(&self, stage: &str) -> PipelineResult<bool> {
        self.stage_event(ExecutionEventType::StageStarted, stage, json!({}))
            .await
    }

    pub async fn stage_completed(&self, stage: &str, metrics: &Metrics) -> PipelineResult<bool> {
        self.stage_event(
            ExecutionEventType::StageCompleted,
            stage,
            json!({ "metrics": metrics }),
        )
        .await
    }

    pub async fn stage_failed(&self, stage: &str, error: &str) -> PipelineResult<bool> {
        self.stage_event(
            ExecutionEventType::StageFailed,
            stage,
            json!({ "error": error }),
        )
        .await
    }

    async fn stage_event(
        &self,
        event_type: ExecutionEventType,
        stage: &str,
        payload: serde_json::Value,
    ) -> PipelineResult<bool> {
        self.ledger
            .record_stage_event(self.execution_id, self.retry_count, event_type, stage, payload)
            .await
    }
}
