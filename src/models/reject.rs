//! # Reject Model
//!
//! A per-record validation failure. Rejects are recorded and the run carries on; only
//! systemic failures fail an execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Reject {
    pub reject_id: i64,
    pub execution_id: Uuid,
    pub partition_key: Option<String>,
    pub stage: String,
    pub reason_code: String,
    pub reason_detail: Option<String>,
    pub raw_snapshot: Option<Json<serde_json::Value>>,
    pub source_locator: Option<String>,
    pub line_number: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// A reject as reported by a stage.
#[derive(Debug, Clone, PartialEq)]
pub struct NewReject {
    pub stage: String,
    pub reason_code: String,
    pub reason_detail: Option<String>,
    pub raw_snapshot: Option<serde_json::Value>,
    pub partition_key: Option<String>,
    pub source_locator: Option<String>,
    pub line_number: Option<i64>,
}

impl NewReject {
    pub fn new(stage: impl Into<String>, reason_code: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            reason_code: reason_code.into(),
            reason_detail: None,
            raw_snapshot: None,
            partition_key: None,
            source_locator: None,
            line_number: None,
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.reason_detail = Some(detail.into());
        self
    }

    pub fn snapshot(mut self, raw: serde_json::Value) -> Self {
        self.raw_snapshot = Some(raw);
        self
    }

    pub fn partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }

    /// Where the record came from, e.g. a file path and line.
    pub fn located_at(mut self, locator: impl Into<String>, line_number: Option<i64>) -> Self {
        self.source_locator = Some(locator.into());
        self.line_number = line_number;
        self
    }
}
