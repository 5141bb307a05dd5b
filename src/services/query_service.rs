//! # Query Service
//!
//! Everything a CLI or HTTP layer may read. It has no path to `run_pipeline` and no
//! write methods; work enters only through `Dispatcher::submit`.

use sqlx::SqlitePool;
use uuid::Uuid;

use crate::capture::CaptureStore;
use crate::error::PipelineResult;
use crate::ledger::ExecutionLedger;
use crate::models::manifest_entry::ManifestEntryRow;
use crate::models::{
    Capture, DeadLetterEntry, DlqListParams, Execution, ExecutionEvent, ExecutionQuery,
    ManifestEntry, Reject,
};
use crate::orchestration::DeadLetterQueue;
use crate::quality::{Readiness, ReadinessGate, RejectSink};

#[derive(Debug, Clone)]
pub struct QueryService {
    pool: SqlitePool,
    ledger: ExecutionLedger,
    captures: CaptureStore,
    readiness: ReadinessGate,
    dead_letters: DeadLetterQueue,
}

impl QueryService {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            ledger: ExecutionLedger::new(pool.clone()),
            captures: CaptureStore::new(pool.clone()),
            readiness: ReadinessGate::new(pool.clone()),
            dead_letters: DeadLetterQueue::new(pool.clone()),
            pool,
        }
    }

    pub async fn get_execution(&self, execution_id: Uuid) -> PipelineResult<Execution> {
        self.ledger.get(execution_id).await
    }

    pub async fn list_executions(&self, query: &ExecutionQuery) -> PipelineResult<Vec<Execution>> {
        self.ledger.list(query).await
    }

    pub async fn execution_events(&self, execution_id: Uuid) -> PipelineResult<Vec<ExecutionEvent>> {
        self.ledger.events(execution_id).await
    }

    pub async fn execution_rejects(&self, execution_id: Uuid) -> PipelineResult<Vec<Reject>> {
        RejectSink::list_for_execution(&self.pool, execution_id).await
    }

    pub async fn get_readiness(&self, partition_key: &str) -> PipelineResult<Readiness> {
        self.readiness.get_readiness(partition_key).await
    }

    pub async fn list_captures(
        &self,
        business_key: Option<&str>,
        limit: i64,
    ) -> PipelineResult<Vec<Capture>> {
        self.captures.list_captures(business_key, limit).await
    }

    pub async fn list_dead_letters(
        &self,
        params: &DlqListParams,
    ) -> PipelineResult<Vec<DeadLetterEntry>> {
        self.dead_letters.list(params).await
    }

    /// Manifest entries for a domain, most recently updated first.
    pub async fn list_manifest(&self, domain: &str, limit: i64) -> PipelineResult<Vec<ManifestEntry>> {
        let rows = sqlx::query_as::<_, ManifestEntryRow>(
            "SELECT domain, partition_key, partition, stage, stage_rank, metrics, execution_id, updated_at \
             FROM manifest_entries WHERE domain = ?1 ORDER BY updated_at DESC LIMIT ?2",
        )
        .bind(domain)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ManifestEntry::from).collect())
    }
}
