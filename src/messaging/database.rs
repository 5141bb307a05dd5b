//! # Database Queue
//!
//! Lane queues stored in the `queue_messages` table so workers in other processes can
//! share them. A receive is a single `UPDATE ... RETURNING` that leases the oldest
//! visible row, which gives single-consumer delivery without application locks.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use super::message::{ExecutionMessage, QueuedMessage};
use super::MessagingError;

#[derive(Debug, Clone)]
pub struct DatabaseQueue {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct QueueMessageRow {
    message_id: i64,
    queue_name: String,
    payload: String,
    enqueued_at: DateTime<Utc>,
    read_count: i64,
}

fn after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl DatabaseQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn send(
        &self,
        queue_name: &str,
        message: &ExecutionMessage,
        delay: Duration,
    ) -> Result<i64, MessagingError> {
        let payload = serde_json::to_string(message)?;
        let now = Utc::now();
        let visible_at = if delay.is_zero() { now } else { after(delay) };

        let result = sqlx::query(
            "INSERT INTO queue_messages (queue_name, execution_id, payload, enqueued_at, visible_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(queue_name)
        .bind(message.execution_id)
        .bind(payload)
        .bind(now)
        .bind(visible_at)
        .execute(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("send", e))?;

        let id = result.last_insert_rowid();
        debug!(queue_name, message_id = id, execution_id = %message.execution_id, "Message sent");
        Ok(id)
    }

    pub async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueuedMessage>, MessagingError> {
        let now = Utc::now();
        let row = sqlx::query_as::<_, QueueMessageRow>(
            "UPDATE queue_messages \
             SET visible_at = ?1, read_count = read_count + 1 \
             WHERE message_id = ( \
                 SELECT message_id FROM queue_messages \
                 WHERE queue_name = ?2 AND visible_at <= ?3 \
                 ORDER BY visible_at, message_id LIMIT 1 \
             ) AND visible_at <= ?3 \
             RETURNING message_id, queue_name, payload, enqueued_at, read_count",
        )
        .bind(after(visibility_timeout))
        .bind(queue_name)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("receive", e))?;

        row.map(|row| {
            Ok(QueuedMessage {
                message_id: row.message_id,
                queue_name: row.queue_name,
                message: serde_json::from_str(&row.payload)?,
                read_count: u32::try_from(row.read_count).unwrap_or(u32::MAX),
                enqueued_at: row.enqueued_at,
            })
        })
        .transpose()
    }

    pub async fn ack(&self, queue_name: &str, message_id: i64) -> Result<(), MessagingError> {
        let result =
            sqlx::query("DELETE FROM queue_messages WHERE message_id = ?1 AND queue_name = ?2")
                .bind(message_id)
                .bind(queue_name)
                .execute(&self.pool)
                .await
                .map_err(|e| MessagingError::database_query("ack", e))?;

        if result.rows_affected() == 0 {
            return Err(MessagingError::message_not_found(message_id));
        }
        Ok(())
    }

    pub async fn release(
        &self,
        queue_name: &str,
        message_id: i64,
        delay: Duration,
    ) -> Result<(), MessagingError> {
        let result = sqlx::query(
            "UPDATE queue_messages SET visible_at = ?1 WHERE message_id = ?2 AND queue_name = ?3",
        )
        .bind(after(delay))
        .bind(message_id)
        .bind(queue_name)
        .execute(&self.pool)
        .await
        .map_err(|e| MessagingError::database_query("release", e))?;

        if result.rows_affected() == 0 {
            return Err(MessagingError::message_not_found(message_id));
        }
        Ok(())
    }

    pub async fn remove_by_execution(&self, execution_id: Uuid) -> Result<u64, MessagingError> {
        let result = sqlx::query("DELETE FROM queue_messages WHERE execution_id = ?1")
            .bind(execution_id)
            .execute(&self.pool)
            .await
            .map_err(|e| MessagingError::database_query("remove_by_execution", e))?;
        Ok(result.rows_affected())
    }

    pub async fn len(&self, queue_name: &str) -> Result<u64, MessagingError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE queue_name = ?1")
                .bind(queue_name)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| MessagingError::database_query("len", e))?;
        Ok(u64::try_from(count).unwrap_or_default())
    }
}
