//! # Quality Result Model
//!
//! Persisted outcome of a named quality check, with execution lineage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PipelineError;

/// PASS/WARN/FAIL. WARN never blocks. FAIL blocks downstream readiness but does not
/// fail the execution that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityStatus {
    Pass,
    Warn,
    Fail,
}

impl QualityStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
        }
    }

    #[must_use]
    pub const fn blocks_readiness(self) -> bool {
        matches!(self, Self::Fail)
    }
}

impl fmt::Display for QualityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for QualityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PASS" => Ok(Self::Pass),
            "WARN" => Ok(Self::Warn),
            "FAIL" => Ok(Self::Fail),
            _ => Err(format!("Invalid quality status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityResult {
    pub result_id: i64,
    pub execution_id: Uuid,
    pub partition_key: String,
    pub check_name: String,
    pub status: QualityStatus,
    pub message: String,
    pub actual_value: Option<serde_json::Value>,
    pub expected_value: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct QualityResultRow {
    pub result_id: i64,
    pub execution_id: Uuid,
    pub partition_key: String,
    pub check_name: String,
    pub status: String,
    pub message: String,
    pub actual_value: Option<Json<serde_json::Value>>,
    pub expected_value: Option<Json<serde_json::Value>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<QualityResultRow> for QualityResult {
    type Error = PipelineError;

    fn try_from(row: QualityResultRow) -> Result<Self, Self::Error> {
        Ok(QualityResult {
            result_id: row.result_id,
            execution_id: row.execution_id,
            partition_key: row.partition_key,
            check_name: row.check_name,
            status: row.status.parse().map_err(PipelineError::InvalidState)?,
            message: row.message,
            actual_value: row.actual_value.map(|v| v.0),
            expected_value: row.expected_value.map(|v| v.0),
            created_at: row.created_at,
        })
    }
}
