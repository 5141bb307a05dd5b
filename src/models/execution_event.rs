//! # Execution Event Model
//!
//! Append-only log of everything that happened to an execution. Rows are immutable
//! once written (the schema rejects updates and deletes) and each carries a unique
//! `idempotency_key` so re-delivered writes collapse into a single fact.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::PipelineError;
use crate::state_machine::{ExecutionEventType, ExecutionStatus};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub event_id: i64,
    pub execution_id: Uuid,
    pub event_type: ExecutionEventType,
    pub stage: Option<String>,
    pub from_status: Option<ExecutionStatus>,
    pub to_status: Option<ExecutionStatus>,
    pub payload: serde_json::Value,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct ExecutionEventRow {
    pub event_id: i64,
    pub execution_id: Uuid,
    pub event_type: String,
    pub stage: Option<String>,
    pub from_status: Option<String>,
    pub to_status: Option<String>,
    pub payload: Json<serde_json::Value>,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<ExecutionEventRow> for ExecutionEvent {
    type Error = PipelineError;

    fn try_from(row: ExecutionEventRow) -> Result<Self, Self::Error> {
        let parse_status = |s: Option<String>| {
            s.map(|v| v.parse::<ExecutionStatus>())
                .transpose()
                .map_err(PipelineError::InvalidState)
        };

        Ok(ExecutionEvent {
            event_id: row.event_id,
            execution_id: row.execution_id,
            event_type: row.event_type.parse().map_err(PipelineError::InvalidState)?,
            stage: row.stage,
            from_status: parse_status(row.from_status)?,
            to_status: parse_status(row.to_status)?,
            payload: row.payload.0,
            idempotency_key: row.idempotency_key,
            created_at: row.created_at,
        })
    }
}
