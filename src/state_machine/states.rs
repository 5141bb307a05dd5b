use serde::{Deserialize, Serialize};
use std::fmt;

/// Execution status as stored on the `executions` row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Row created, not yet handed to a backend
    Pending,
    /// Handed to a backend, waiting for a worker
    Queued,
    /// A worker is running the handler
    Running,
    /// Cancellation requested, waiting for the next checkpoint
    Cancelling,
    /// Handler finished successfully
    Completed,
    /// Handler failed (may be retried or dead-lettered)
    Failed,
    /// Moved to the dead letter queue
    DeadLettered,
    /// Cancelled before or during execution
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 8] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Cancelling,
        Self::Completed,
        Self::Failed,
        Self::DeadLettered,
        Self::Cancelled,
    ];

    /// Active statuses hold the logical-key guard.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Queued | Self::Running | Self::Cancelling
        )
    }

    /// Terminal statuses are final facts.
    ///
    /// `Failed` is terminal only once no retry or dead-letter follows it, which the
    /// ledger guarantees by applying those moves in the same transaction.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::DeadLettered | Self::Cancelled
        )
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::DeadLettered => "dead_lettered",
            Self::Cancelled => "cancelled",
        }
    }
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "cancelling" => Ok(Self::Cancelling),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "dead_lettered" => Ok(Self::DeadLettered),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid execution status: {s}")),
        }
    }
}
