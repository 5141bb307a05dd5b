//! # Queue Provider Enum
//!
//! Enum dispatch over the lane queue implementations, avoiding trait objects on the
//! worker hot path.

use std::time::Duration;

use sqlx::SqlitePool;
use uuid::Uuid;

use super::database::DatabaseQueue;
use super::in_memory::InMemoryQueue;
use super::message::{ExecutionMessage, QueuedMessage};
use super::MessagingError;
use crate::config::QueueProviderKind;

/// # Variants
///
/// - `InMemory` - single-process queues for tests and embedded use
/// - `Database` - `queue_messages` table shared by out-of-process workers
#[derive(Debug)]
pub enum QueueProvider {
    InMemory(InMemoryQueue),
    Database(DatabaseQueue),
}

impl QueueProvider {
    pub fn from_kind(kind: QueueProviderKind, pool: &SqlitePool) -> Self {
        match kind {
            QueueProviderKind::InMemory => Self::InMemory(InMemoryQueue::new()),
            QueueProviderKind::Database => Self::Database(DatabaseQueue::new(pool.clone())),
        }
    }

    /// Get the provider name for logging
    pub fn provider_name(&self) -> &'static str {
        match self {
            Self::InMemory(_) => "in_memory",
            Self::Database(_) => "database",
        }
    }

    pub async fn send(
        &self,
        queue_name: &str,
        message: &ExecutionMessage,
        delay: Duration,
    ) -> Result<i64, MessagingError> {
        match self {
            Self::InMemory(q) => q.send(queue_name, message, delay).await,
            Self::Database(q) => q.send(queue_name, message, delay).await,
        }
    }

    pub async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueuedMessage>, MessagingError> {
        match self {
            Self::InMemory(q) => q.receive(queue_name, visibility_timeout).await,
            Self::Database(q) => q.receive(queue_name, visibility_timeout).await,
        }
    }

    pub async fn ack(&self, queue_name: &str, message_id: i64) -> Result<(), MessagingError> {
        match self {
            Self::InMemory(q) => q.ack(queue_name, message_id).await,
            Self::Database(q) => q.ack(queue_name, message_id).await,
        }
    }

    pub async fn release(
        &self,
        queue_name: &str,
        message_id: i64,
        delay: Duration,
    ) -> Result<(), MessagingError> {
        match self {
            Self::InMemory(q) => q.release(queue_name, message_id, delay).await,
            Self::Database(q) => q.release(queue_name, message_id, delay).await,
        }
    }

    pub async fn remove_by_execution(&self, execution_id: Uuid) -> Result<u64, MessagingError> {
        match self {
            Self::InMemory(q) => q.remove_by_execution(execution_id).await,
            Self::Database(q) => q.remove_by_execution(execution_id).await,
        }
    }

    pub async fn len(&self, queue_name: &str) -> Result<u64, MessagingError> {
        match self {
            Self::InMemory(q) => q.len(queue_name).await,
            Self::Database(q) => q.len(queue_name).await,
        }
    }
}
