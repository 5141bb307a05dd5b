//! Messages carried on lane queues.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request to run one execution. Only the id travels; everything else is read back
/// from the ledger by `run_pipeline`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionMessage {
    pub execution_id: Uuid,
    pub lane: String,
    /// Failed attempts already charged when the message was sent
    pub attempt: u32,
}

impl ExecutionMessage {
    pub fn new(execution_id: Uuid, lane: impl Into<String>) -> Self {
        Self {
            execution_id,
            lane: lane.into(),
            attempt: 0,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// A message leased to one consumer until its visibility timeout elapses.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedMessage {
    pub message_id: i64,
    pub queue_name: String,
    pub message: ExecutionMessage,
    /// Times this message has been received, including this one
    pub read_count: u32,
    pub enqueued_at: DateTime<Utc>,
}
