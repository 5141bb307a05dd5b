//! Transition table for [`ExecutionStatus`].
//!
//! ```text
//! pending ──▶ queued ──▶ running ──▶ completed
//!    │          │          │
//!    ├──────────┴──────────┴──▶ failed ──▶ dead_lettered
//!    │          │          │       └────▶ queued (automatic retry)
//!    └──────────┴──▶ cancelled     │
//!                          └──▶ cancelling ──▶ cancelled | completed | failed
//! ```

use super::events::ExecutionEventType;
use super::states::ExecutionStatus;

/// A requested status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

impl ExecutionTransition {
    pub const fn new(from: ExecutionStatus, to: ExecutionStatus) -> Self {
        Self { from, to }
    }

    pub fn is_allowed(&self) -> bool {
        is_allowed(self.from, self.to)
    }
}

/// Whether `from -> to` is a legal edge.
pub fn is_allowed(from: ExecutionStatus, to: ExecutionStatus) -> bool {
    use ExecutionStatus::*;

    matches!(
        (from, to),
        (Pending, Queued)
            | (Queued, Running)
            | (Running, Completed)
            | (Pending | Queued | Running, Failed)
            | (Failed, DeadLettered)
            | (Failed, Queued)
            | (Running, Cancelling)
            | (Cancelling, Cancelled)
            | (Cancelling, Completed)
            | (Cancelling, Failed)
            | (Pending | Queued, Cancelled)
    )
}

/// The event appended when entering `to` from `from`.
pub fn target_event(from: ExecutionStatus, to: ExecutionStatus) -> ExecutionEventType {
    use ExecutionStatus::*;

    match (from, to) {
        (Failed, Queued) => ExecutionEventType::RetryScheduled,
        (_, Pending) => ExecutionEventType::Created,
        (_, Queued) => ExecutionEventType::Queued,
        (_, Running) => ExecutionEventType::Started,
        (_, Cancelling) => ExecutionEventType::CancelRequested,
        (_, Completed) => ExecutionEventType::Completed,
        (_, Failed) => ExecutionEventType::Failed,
        (_, DeadLettered) => ExecutionEventType::DeadLettered,
        (_, Cancelled) => ExecutionEventType::Cancelled,
    }
}

/// Statuses from which `to` may be entered.
pub fn allowed_sources(to: ExecutionStatus) -> Vec<ExecutionStatus> {
    ExecutionStatus::ALL
        .into_iter()
        .filter(|from| is_allowed(*from, to))
        .collect()
}
