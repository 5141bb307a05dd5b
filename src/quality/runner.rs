use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::SqlitePool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::PipelineResult;
use crate::models::{QualityResult, QualityStatus};

/// What a single check concluded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub status: QualityStatus,
    pub message: String,
    pub actual: Option<serde_json::Value>,
    pub expected: Option<serde_json::Value>,
}

impl CheckOutcome {
    pub fn pass(message: impl Into<String>) -> Self {
        Self::new(QualityStatus::Pass, message)
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(QualityStatus::Warn, message)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Self::new(QualityStatus::Fail, message)
    }

    fn new(status: QualityStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            actual: None,
            expected: None,
        }
    }

    pub fn with_values(
        mut self,
        actual: impl Into<serde_json::Value>,
        expected: impl Into<serde_json::Value>,
    ) -> Self {
        self.actual = Some(actual.into());
        self.expected = Some(expected.into());
        self
    }
}

/// A named check over some input.
pub trait QualityCheck<T: ?Sized>: Send + Sync {
    fn name(&self) -> &str;

    fn run(&self, input: &T) -> CheckOutcome;
}

/// Closure-backed check.
pub struct FnCheck<F> {
    name: String,
    check: F,
}

impl<F> FnCheck<F> {
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<T: ?Sized, F> QualityCheck<T> for FnCheck<F>
where
    F: Fn(&T) -> CheckOutcome + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, input: &T) -> CheckOutcome {
        (self.check)(input)
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct QualityReport {
    pub results: Vec<QualityResult>,
}

impl QualityReport {
    pub fn has_failures(&self) -> bool {
        self.results.iter().any(|r| r.status.blocks_readiness())
    }

    pub fn failing_checks(&self) -> Vec<String> {
        self.checks_with(QualityStatus::Fail)
    }

    pub fn warnings(&self) -> Vec<String> {
        self.checks_with(QualityStatus::Warn)
    }

    fn checks_with(&self, status: QualityStatus) -> Vec<String> {
        self.results
            .iter()
            .filter(|r| r.status == status)
            .map(|r| r.check_name.clone())
            .collect()
    }
}

/// Runs checks and persists their results against one execution.
#[derive(Debug, Clone)]
pub struct QualityRunner {
    pool: SqlitePool,
    execution_id: Uuid,
}

impl QualityRunner {
    pub fn new(pool: SqlitePool, execution_id: Uuid) -> Self {
        Self { pool, execution_id }
    }

    /// Run every check over `input` and persist the outcomes. A FAIL is reported in
    /// the returned report; it is not an error.
    pub async fn run_checks<T: ?Sized>(
        &self,
        partition_key: &str,
        input: &T,
        checks: &[&dyn QualityCheck<T>],
    ) -> PipelineResult<QualityReport> {
        let mut report = QualityReport::default();
        for check in checks {
            let outcome = check.run(input);
            report
                .results
                .push(self.record(partition_key, check.name(), outcome).await?);
        }

        if report.has_failures() {
            warn!(
                execution_id = %self.execution_id,
                partition_key,
                failing = ?report.failing_checks(),
                "Quality checks failed, downstream readiness blocked"
            );
        } else {
            info!(
                execution_id = %self.execution_id,
                partition_key,
                checks = report.results.len(),
                warnings = report.warnings().len(),
                "Quality checks passed"
            );
        }
        Ok(report)
    }

    pub async fn record(
        &self,
        partition_key: &str,
        check_name: &str,
        outcome: CheckOutcome,
    ) -> PipelineResult<QualityResult> {
        let created_at = Utc::now();
        let result = sqlx::query(
            "INSERT INTO quality_results \
             (execution_id, partition_key, check_name, status, message, actual_value, expected_value, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )
        .bind(self.execution_id)
        .bind(partition_key)
        .bind(check_name)
        .bind(outcome.status.as_str())
        .bind(&outcome.message)
        .bind(outcome.actual.as_ref().map(Json))
        .bind(outcome.expected.as_ref().map(Json))
        .bind(created_at)
        .execute(&self.pool)
        .await?;

        Ok(QualityResult {
            result_id: result.last_insert_rowid(),
            execution_id: self.execution_id,
            partition_key: partition_key.to_string(),
            check_name: check_name.to_string(),
            status: outcome.status,
            message: outcome.message,
            actual_value: outcome.actual,
            expected_value: outcome.expected,
            created_at,
        })
    }
}
