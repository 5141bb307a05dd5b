use serde::{Deserialize, Serialize};
use std::fmt;

/// Event types appended to the execution event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionEventType {
    Created,
    Queued,
    Started,
    Completed,
    Failed,
    RetryScheduled,
    DeadLettered,
    CancelRequested,
    Cancelled,
    StageStarted,
    StageCompleted,
    StageFailed,
}

impl ExecutionEventType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Queued => "queued",
            Self::Started => "started",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::RetryScheduled => "retry_scheduled",
            Self::DeadLettered => "dead_lettered",
            Self::CancelRequested => "cancel_requested",
            Self::Cancelled => "cancelled",
            Self::StageStarted => "stage_started",
            Self::StageCompleted => "stage_completed",
            Self::StageFailed => "stage_failed",
        }
    }

    /// Stage events carry a stage name and never change execution status.
    pub fn is_stage_event(&self) -> bool {
        matches!(
            self,
            Self::StageStarted | Self::StageCompleted | Self::StageFailed
        )
    }
}

impl fmt::Display for ExecutionEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionEventType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Self::Created),
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "retry_scheduled" => Ok(Self::RetryScheduled),
            "dead_lettered" => Ok(Self::DeadLettered),
            "cancel_requested" => Ok(Self::CancelRequested),
            "cancelled" => Ok(Self::Cancelled),
            "stage_started" => Ok(Self::StageStarted),
            "stage_completed" => Ok(Self::StageCompleted),
            "stage_failed" => Ok(Self::StageFailed),
            _ => Err(format!("Invalid execution event type: {s}")),
        }
    }
}
