use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::quality_result::QualityResultRow;
use crate::models::{QualityResult, QualityStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Readiness {
    pub partition_key: String,
    pub ready: bool,
    /// Execution whose results decided readiness
    pub execution_id: Option<Uuid>,
    pub failing_checks: Vec<String>,
    pub warnings: Vec<String>,
    pub checked_at: Option<DateTime<Utc>>,
}

/// Read-side gate over persisted quality results.
///
/// The most recent execution that recorded results for a partition decides. A
/// partition with no results has nothing failing and is ready.
#[derive(Debug, Clone)]
pub struct ReadinessGate {
    pool: SqlitePool,
}

impl ReadinessGate {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_readiness(&self, partition_key: &str) -> PipelineResult<Readiness> {
        let latest: Option<Uuid> = sqlx::query_scalar(
            "SELECT execution_id FROM quality_results WHERE partition_key = ?1 \
             ORDER BY created_at DESC, result_id DESC LIMIT 1",
        )
        .bind(partition_key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(execution_id) = latest else {
            return Ok(Readiness {
                partition_key: partition_key.to_string(),
                ready: true,
                execution_id: None,
                failing_checks: Vec::new(),
                warnings: Vec::new(),
                checked_at: None,
            });
        };

        let rows = sqlx::query_as::<_, QualityResultRow>(
            "SELECT result_id, execution_id, partition_key, check_name, status, message, \
                    actual_value, expected_value, created_at \
             FROM quality_results WHERE partition_key = ?1 AND execution_id = ?2 \
             ORDER BY result_id",
        )
        .bind(partition_key)
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        let results: Vec<QualityResult> = rows
            .into_iter()
            .map(QualityResult::try_from)
            .collect::<PipelineResult<_>>()?;

        let names = |status: QualityStatus| -> Vec<String> {
            results
                .iter()
                .filter(|r| r.status == status)
                .map(|r| r.check_name.clone())
                .collect()
        };
        let failing_checks = names(QualityStatus::Fail);

        Ok(Readiness {
            partition_key: partition_key.to_string(),
            ready: failing_checks.is_empty(),
            execution_id: Some(execution_id),
            warnings: names(QualityStatus::Warn),
            failing_checks,
            checked_at: results.iter().map(|r| r.created_at).max(),
        })
    }

    /// `QualityGateFailure` unless the partition is ready.
    pub async fn require_ready(&self, partition_key: &str) -> PipelineResult<Readiness> {
        let readiness = self.get_readiness(partition_key).await?;
        if readiness.ready {
            Ok(readiness)
        } else {
            Err(PipelineError::QualityGateFailure {
                partition_key: readiness.partition_key,
                failing_checks: readiness.failing_checks,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::{CheckOutcome, QualityRunner};

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_latest_execution_decides(pool: SqlitePool) {
        let gate = ReadinessGate::new(pool.clone());
        assert!(gate.get_readiness("2025-12-26").await.unwrap().ready);

        let first = QualityRunner::new(pool.clone(), Uuid::now_v7());
        first
            .record("2025-12-26", "row_count", CheckOutcome::fail("0 rows"))
            .await
            .unwrap();
        first
            .record("2025-12-26", "freshness", CheckOutcome::warn("late"))
            .await
            .unwrap();

        match gate.require_ready("2025-12-26").await {
            Err(PipelineError::QualityGateFailure { failing_checks, .. }) => {
                assert_eq!(failing_checks, vec!["row_count"]);
            }
            other => panic!("expected gate failure, got {other:?}"),
        }

        let rerun = QualityRunner::new(pool, Uuid::now_v7());
        rerun
            .record("2025-12-26", "row_count", CheckOutcome::pass("1200 rows"))
            .await
            .unwrap();
        let readiness = gate.require_ready("2025-12-26").await.unwrap();
        assert!(readiness.warnings.is_empty());
    }
}
