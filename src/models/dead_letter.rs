// Dead letter domain models.
//
// A dead letter is a terminally failed execution awaiting operator action. Entries are
// never deleted: resolving one records who did what, and a retry links to the fresh
// execution it spawned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PipelineError;

/// Why an execution was dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Transient failures used up the retry budget
    MaxRetriesExceeded,

    /// Handler raised a non-retryable error
    FatalError,

    /// The configured backend refused the submission
    BackendSubmitFailed,
}

impl DeadLetterReason {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::FatalError => "fatal_error",
            Self::BackendSubmitFailed => "backend_submit_failed",
        }
    }

    /// Reasons pointing at infrastructure rather than the handler's input
    #[must_use]
    pub const fn is_systemic(self) -> bool {
        matches!(self, Self::MaxRetriesExceeded | Self::BackendSubmitFailed)
    }
}

impl fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for DeadLetterReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "max_retries_exceeded" => Ok(Self::MaxRetriesExceeded),
            "fatal_error" => Ok(Self::FatalError),
            "backend_submit_failed" => Ok(Self::BackendSubmitFailed),
            _ => Err(format!("Invalid dead letter reason: {s}")),
        }
    }
}

/// Operator resolution of a dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// A new execution was spawned from this entry
    Retried,

    /// Operator decided the work is not needed
    Discarded,

    /// Fixed out of band, no re-execution
    Fixed,
}

impl Resolution {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Retried => "retried",
            Self::Discarded => "discarded",
            Self::Fixed => "fixed",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "retried" => Ok(Self::Retried),
            "discarded" => Ok(Self::Discarded),
            "fixed" => Ok(Self::Fixed),
            _ => Err(format!("Invalid resolution: {s}")),
        }
    }
}

/// Dead letter entry. Maps to the `dead_letters` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub dead_letter_id: Uuid,

    /// Failed execution; unique across the table
    pub execution_id: Uuid,

    pub pipeline: String,

    pub reason: DeadLetterReason,

    /// Last error message recorded on the execution
    pub error: Option<String>,

    /// Failed attempts charged at dead-letter time
    pub retry_count: u32,

    pub created_at: DateTime<Utc>,

    pub resolved_at: Option<DateTime<Utc>>,

    pub resolved_by: Option<String>,

    pub resolution: Option<Resolution>,

    pub resolution_notes: Option<String>,

    /// Execution spawned by a retry resolution
    pub retry_execution_id: Option<Uuid>,
}

impl DeadLetterEntry {
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Dead letter list query parameters
#[derive(Debug, Clone)]
pub struct DlqListParams {
    /// `Some(true)` for unresolved only, `Some(false)` for resolved only
    pub pending: Option<bool>,
    pub pipeline: Option<String>,
    pub reason: Option<DeadLetterReason>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for DlqListParams {
    fn default() -> Self {
        Self {
            pending: None,
            pipeline: None,
            reason: None,
            limit: 50,
            offset: 0,
        }
    }
}

impl DlqListParams {
    pub fn pending() -> Self {
        Self {
            pending: Some(true),
            ..Self::default()
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct DeadLetterRow {
    pub dead_letter_id: Uuid,
    pub execution_id: Uuid,
    pub pipeline: String,
    pub reason: String,
    pub error: Option<String>,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution: Option<String>,
    pub resolution_notes: Option<String>,
    pub retry_execution_id: Option<Uuid>,
}

impl TryFrom<DeadLetterRow> for DeadLetterEntry {
    type Error = PipelineError;

    fn try_from(row: DeadLetterRow) -> Result<Self, Self::Error> {
        Ok(DeadLetterEntry {
            dead_letter_id: row.dead_letter_id,
            execution_id: row.execution_id,
            pipeline: row.pipeline,
            reason: row.reason.parse().map_err(PipelineError::InvalidState)?,
            error: row.error,
            retry_count: u32::try_from(row.retry_count).unwrap_or_default(),
            created_at: row.created_at,
            resolved_at: row.resolved_at,
            resolved_by: row.resolved_by,
            resolution: row
                .resolution
                .map(|r| r.parse())
                .transpose()
                .map_err(PipelineError::InvalidState)?,
            resolution_notes: row.resolution_notes,
            retry_execution_id: row.retry_execution_id,
        })
    }
}

pub(crate) const DEAD_LETTER_COLUMNS: &str = "dead_letter_id, execution_id, pipeline, reason, \
    error, retry_count, created_at, resolved_at, resolved_by, resolution, resolution_notes, \
    retry_execution_id";
