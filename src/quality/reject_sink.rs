use chrono::Utc;
use sqlx::types::Json;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::error::PipelineResult;
use crate::models::{NewReject, Reject};

/// Records rejects for one execution and counts them for the result metrics.
#[derive(Debug, Clone)]
pub struct RejectSink {
    pool: SqlitePool,
    execution_id: Uuid,
    count: Arc<AtomicU64>,
}

impl RejectSink {
    pub fn new(pool: SqlitePool, execution_id: Uuid) -> Self {
        Self {
            pool,
            execution_id,
            count: Arc::new(AtomicU64::new(0)),
        }
    }

    pub async fn record(&self, reject: NewReject) -> PipelineResult<i64> {
        let result = sqlx::query(
            "INSERT INTO rejects \
             (execution_id, partition_key, stage, reason_code, reason_detail, raw_snapshot, \
              source_locator, line_number, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        )
        .bind(self.execution_id)
        .bind(&reject.partition_key)
        .bind(&reject.stage)
        .bind(&reject.reason_code)
        .bind(&reject.reason_detail)
        .bind(reject.raw_snapshot.as_ref().map(Json))
        .bind(&reject.source_locator)
        .bind(reject.line_number)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        self.count.fetch_add(1, Ordering::Relaxed);
        debug!(
            execution_id = %self.execution_id,
            stage = %reject.stage,
            reason_code = %reject.reason_code,
            "Record rejected"
        );
        Ok(result.last_insert_rowid())
    }

    /// Record a batch in one transaction.
    pub async fn record_many(&self, rejects: &[NewReject]) -> PipelineResult<u64> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        for reject in rejects {
            sqlx::query(
                "INSERT INTO rejects \
                 (execution_id, partition_key, stage, reason_code, reason_detail, raw_snapshot, \
                  source_locator, line_number, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            )
            .bind(self.execution_id)
            .bind(&reject.partition_key)
            .bind(&reject.stage)
            .bind(&reject.reason_code)
            .bind(&reject.reason_detail)
            .bind(reject.raw_snapshot.as_ref().map(Json))
            .bind(&reject.source_locator)
            .bind(reject.line_number)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        let n = rejects.len() as u64;
        self.count.fetch_add(n, Ordering::Relaxed);
        Ok(n)
    }

    /// Rejects recorded through this sink.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Rejects stored for the execution across every attempt, including earlier
    /// attempts that ended in a retry.
    pub async fn total(&self) -> PipelineResult<u64> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rejects WHERE execution_id = ?1")
            .bind(self.execution_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(u64::try_from(total).unwrap_or_default())
    }

    pub async fn list(&self) -> PipelineResult<Vec<Reject>> {
        Self::list_for_execution(&self.pool, self.execution_id).await
    }

    pub async fn list_for_execution(
        pool: &SqlitePool,
        execution_id: Uuid,
    ) -> PipelineResult<Vec<Reject>> {
        Ok(sqlx::query_as::<_, Reject>(
            "SELECT reject_id, execution_id, partition_key, stage, reason_code, reason_detail, \
                    raw_snapshot, source_locator, line_number, created_at \
             FROM rejects WHERE execution_id = ?1 ORDER BY reject_id",
        )
        .bind(execution_id)
        .fetch_all(pool)
        .await?)
    }
}
