//! # Execution Model
//!
//! One row per unit of submitted work. Created by the dispatcher, mutated only by
//! [`ExecutionLedger`](crate::ledger::ExecutionLedger) transition methods, never deleted.
//!
//! Maps to the `executions` table:
//! ```sql
//! CREATE TABLE executions (
//!   execution_id BLOB PRIMARY KEY,
//!   pipeline TEXT NOT NULL,
//!   params TEXT NOT NULL,          -- JSON object
//!   lane TEXT NOT NULL,
//!   trigger_source TEXT NOT NULL,
//!   logical_key TEXT,              -- unique among active statuses
//!   status TEXT NOT NULL,
//!   ...
//! );
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::{ErrorClass, PipelineError};
use crate::state_machine::ExecutionStatus;
use crate::types::{Lane, Metrics, Params, TriggerSource};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub params: Params,
    pub lane: Lane,
    pub trigger_source: TriggerSource,
    pub logical_key: Option<String>,
    pub status: ExecutionStatus,
    pub backend: Option<String>,
    pub backend_run_id: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub retry_count: u32,
    pub error: Option<String>,
    pub error_class: Option<ErrorClass>,
    pub result_metrics: Option<Metrics>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Optional batch identifier carried in params for lineage.
    pub fn batch_id(&self) -> Option<String> {
        self.params
            .get("batch_id")
            .and_then(|v| v.as_str())
            .map(ToString::to_string)
    }
}

/// Values for a new execution row.
#[derive(Debug, Clone)]
pub struct NewExecution {
    pub pipeline: String,
    pub params: Params,
    pub lane: Lane,
    pub trigger_source: TriggerSource,
    pub logical_key: Option<String>,
    pub parent_execution_id: Option<Uuid>,
}

impl NewExecution {
    pub fn new(pipeline: impl Into<String>, params: Params) -> Self {
        Self {
            pipeline: pipeline.into(),
            params,
            lane: Lane::default(),
            trigger_source: TriggerSource::Manual,
            logical_key: None,
            parent_execution_id: None,
        }
    }

    pub fn with_lane(mut self, lane: Lane) -> Self {
        self.lane = lane;
        self
    }

    pub fn with_trigger_source(mut self, trigger_source: TriggerSource) -> Self {
        self.trigger_source = trigger_source;
        self
    }

    pub fn with_logical_key(mut self, logical_key: Option<String>) -> Self {
        self.logical_key = logical_key;
        self
    }

    pub fn with_parent(mut self, parent_execution_id: Uuid) -> Self {
        self.parent_execution_id = Some(parent_execution_id);
        self
    }
}

/// Filters for listing executions. Results are newest first.
#[derive(Debug, Clone)]
pub struct ExecutionQuery {
    pub pipeline: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub logical_key: Option<String>,
    pub lane: Option<Lane>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            pipeline: None,
            status: None,
            logical_key: None,
            lane: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl ExecutionQuery {
    pub fn for_pipeline(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: Some(pipeline.into()),
            ..Self::default()
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_logical_key(mut self, logical_key: impl Into<String>) -> Self {
        self.logical_key = Some(logical_key.into());
        self
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct ExecutionRow {
    pub execution_id: Uuid,
    pub pipeline: String,
    pub params: Json<Params>,
    pub lane: String,
    pub trigger_source: String,
    pub logical_key: Option<String>,
    pub status: String,
    pub backend: Option<String>,
    pub backend_run_id: Option<String>,
    pub parent_execution_id: Option<Uuid>,
    pub retry_count: i64,
    pub error: Option<String>,
    pub error_class: Option<String>,
    pub result_metrics: Option<Json<Metrics>>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<ExecutionRow> for Execution {
    type Error = PipelineError;

    fn try_from(row: ExecutionRow) -> Result<Self, Self::Error> {
        Ok(Execution {
            execution_id: row.execution_id,
            pipeline: row.pipeline,
            params: row.params.0,
            lane: Lane::new(row.lane),
            trigger_source: row.trigger_source.parse().map_err(PipelineError::InvalidState)?,
            logical_key: row.logical_key,
            status: row.status.parse().map_err(PipelineError::InvalidState)?,
            backend: row.backend,
            backend_run_id: row.backend_run_id,
            parent_execution_id: row.parent_execution_id,
            retry_count: u32::try_from(row.retry_count)
                .map_err(|_| PipelineError::InvalidState(format!("retry_count {}", row.retry_count)))?,
            error: row.error,
            error_class: row
                .error_class
                .map(|c| c.parse())
                .transpose()
                .map_err(PipelineError::InvalidState)?,
            result_metrics: row.result_metrics.map(|m| m.0),
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
            updated_at: row.updated_at,
        })
    }
}

pub(crate) const EXECUTION_COLUMNS: &str = "execution_id, pipeline, params, lane, trigger_source, \
    logical_key, status, backend, backend_run_id, parent_execution_id, retry_count, error, \
    error_class, result_metrics, created_at, started_at, completed_at, updated_at";
