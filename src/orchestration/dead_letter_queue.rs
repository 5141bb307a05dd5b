//! # Dead Letter Queue
//!
//! Read and resolve dead-letter entries. Entries are created by the ledger in the
//! same transaction that dead-letters the execution. A retry never resumes the
//! original execution; it is performed by `Dispatcher::retry_dead_letter`, which
//! spawns a new execution and resolves the entry atomically.

use chrono::Utc;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use tracing::info;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::dead_letter::{DeadLetterRow, DEAD_LETTER_COLUMNS};
use crate::models::{DeadLetterEntry, DlqListParams, Resolution};

#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    pool: SqlitePool,
}

impl DeadLetterQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, dead_letter_id: Uuid) -> PipelineResult<DeadLetterEntry> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE dead_letter_id = ?1");
        sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(dead_letter_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(PipelineError::DeadLetterNotFound(dead_letter_id))
            .and_then(DeadLetterEntry::try_from)
    }

    pub async fn get_by_execution(
        &self,
        execution_id: Uuid,
    ) -> PipelineResult<Option<DeadLetterEntry>> {
        let sql = format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE execution_id = ?1");
        sqlx::query_as::<_, DeadLetterRow>(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?
            .map(DeadLetterEntry::try_from)
            .transpose()
    }

    /// Entries matching `params`, newest first.
    pub async fn list(&self, params: &DlqListParams) -> PipelineResult<Vec<DeadLetterEntry>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {DEAD_LETTER_COLUMNS} FROM dead_letters WHERE 1 = 1"));

        match params.pending {
            Some(true) => {
                builder.push(" AND resolved_at IS NULL");
            }
            Some(false) => {
                builder.push(" AND resolved_at IS NOT NULL");
            }
            None => {}
        }
        if let Some(pipeline) = &params.pipeline {
            builder.push(" AND pipeline = ").push_bind(pipeline.clone());
        }
        if let Some(reason) = params.reason {
            builder.push(" AND reason = ").push_bind(reason.as_str());
        }
        builder
            .push(" ORDER BY created_at DESC, dead_letter_id DESC LIMIT ")
            .push_bind(params.limit)
            .push(" OFFSET ")
            .push_bind(params.offset);

        let rows = builder
            .build_query_as::<DeadLetterRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(DeadLetterEntry::try_from).collect()
    }

    pub async fn pending_count(&self) -> PipelineResult<i64> {
        Ok(
            sqlx::query_scalar("SELECT COUNT(*) FROM dead_letters WHERE resolved_at IS NULL")
                .fetch_one(&self.pool)
                .await?,
        )
    }

    /// Resolve as discarded: the work is not needed.
    pub async fn discard(
        &self,
        dead_letter_id: Uuid,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> PipelineResult<DeadLetterEntry> {
        self.resolve(dead_letter_id, Resolution::Discarded, resolved_by, notes)
            .await
    }

    /// Resolve as fixed out of band, without re-execution.
    pub async fn mark_fixed(
        &self,
        dead_letter_id: Uuid,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> PipelineResult<DeadLetterEntry> {
        self.resolve(dead_letter_id, Resolution::Fixed, resolved_by, notes)
            .await
    }

    async fn resolve(
        &self,
        dead_letter_id: Uuid,
        resolution: Resolution,
        resolved_by: &str,
        notes: Option<&str>,
    ) -> PipelineResult<DeadLetterEntry> {
        let result = sqlx::query(
            "UPDATE dead_letters \
             SET resolved_at = ?1, resolved_by = ?2, resolution = ?3, resolution_notes = ?4 \
             WHERE dead_letter_id = ?5 AND resolved_at IS NULL",
        )
        .bind(Utc::now())
        .bind(resolved_by)
        .bind(resolution.as_str())
        .bind(notes)
        .bind(dead_letter_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            // Distinguish a missing entry from one already resolved.
            self.get(dead_letter_id).await?;
            return Err(PipelineError::DeadLetterAlreadyResolved(dead_letter_id));
        }

        info!(
            dead_letter_id = %dead_letter_id,
            resolution = %resolution,
            resolved_by,
            "Dead letter resolved"
        );
        self.get(dead_letter_id).await
    }
}
