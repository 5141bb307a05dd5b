//! # In-Memory Queue
//!
//! Single-process lane queues for tests and embedded deployments.
//!
//! - **Visibility Timeout**: received messages are invisible until the lease expires
//! - **Thread-Safe**: a `parking_lot::Mutex` around the queue map, never held across an await

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::message::{ExecutionMessage, QueuedMessage};
use super::MessagingError;

#[derive(Debug, Clone)]
struct InMemoryQueuedMessage {
    id: i64,
    payload: Vec<u8>,
    execution_id: Uuid,
    enqueued_at: DateTime<Utc>,
    visible_at: DateTime<Utc>,
    read_count: u32,
}

#[derive(Debug)]
pub struct InMemoryQueue {
    queues: Mutex<HashMap<String, VecDeque<InMemoryQueuedMessage>>>,
    next_id: AtomicI64,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    Utc::now() + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365))
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    pub async fn send(
        &self,
        queue_name: &str,
        message: &ExecutionMessage,
        delay: Duration,
    ) -> Result<i64, MessagingError> {
        let payload = message.to_bytes()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Utc::now();

        let mut queues = self.queues.lock();
        queues
            .entry(queue_name.to_string())
            .or_default()
            .push_back(InMemoryQueuedMessage {
                id,
                payload,
                execution_id: message.execution_id,
                enqueued_at: now,
                visible_at: if delay.is_zero() { now } else { after(delay) },
                read_count: 0,
            });

        Ok(id)
    }

    /// Lease the oldest visible message, if any.
    pub async fn receive(
        &self,
        queue_name: &str,
        visibility_timeout: Duration,
    ) -> Result<Option<QueuedMessage>, MessagingError> {
        let mut queues = self.queues.lock();
        let Some(queue) = queues.get_mut(queue_name) else {
            return Ok(None);
        };

        let now = Utc::now();
        let Some(msg) = queue.iter_mut().find(|m| m.visible_at <= now) else {
            return Ok(None);
        };

        let message = ExecutionMessage::from_bytes(&msg.payload)?;
        msg.visible_at = after(visibility_timeout);
        msg.read_count += 1;

        Ok(Some(QueuedMessage {
            message_id: msg.id,
            queue_name: queue_name.to_string(),
            message,
            read_count: msg.read_count,
            enqueued_at: msg.enqueued_at,
        }))
    }

    pub async fn ack(&self, queue_name: &str, message_id: i64) -> Result<(), MessagingError> {
        let mut queues = self.queues.lock();
        let queue = queues.get_mut(queue_name).ok_or_else(|| {
            MessagingError::queue_operation(queue_name, "ack", "queue does not exist")
        })?;

        match queue.iter().position(|m| m.id == message_id) {
            Some(pos) => {
                queue.remove(pos);
                Ok(())
            }
            None => Err(MessagingError::message_not_found(message_id)),
        }
    }

    /// Make a leased message visible again after `delay`.
    pub async fn release(
        &self,
        queue_name: &str,
        message_id: i64,
        delay: Duration,
    ) -> Result<(), MessagingError> {
        let mut queues = self.queues.lock();
        let msg = queues
            .get_mut(queue_name)
            .and_then(|q| q.iter_mut().find(|m| m.id == message_id))
            .ok_or_else(|| MessagingError::message_not_found(message_id))?;
        msg.visible_at = after(delay);
        Ok(())
    }

    /// Drop every message for an execution across all queues.
    pub async fn remove_by_execution(&self, execution_id: Uuid) -> Result<u64, MessagingError> {
        let mut queues = self.queues.lock();
        let mut removed = 0u64;
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|m| m.execution_id != execution_id);
            removed += (before - queue.len()) as u64;
        }
        Ok(removed)
    }

    pub async fn len(&self, queue_name: &str) -> Result<u64, MessagingError> {
        let queues = self.queues.lock();
        Ok(queues.get(queue_name).map(|q| q.len() as u64).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_receive_leases_message_to_one_consumer() {
        let queue = InMemoryQueue::new();
        let msg = ExecutionMessage::new(Uuid::now_v7(), "normal");
        queue.send("q_normal", &msg, Duration::ZERO).await.unwrap();

        let first = queue
            .receive("q_normal", Duration::from_secs(30))
            .await
            .unwrap()
            .expect("message should be visible");
        assert_eq!(first.message, msg);
        assert_eq!(first.read_count, 1);

        let second = queue.receive("q_normal", Duration::from_secs(30)).await.unwrap();
        assert!(second.is_none(), "leased message must not be redelivered");

        queue.ack("q_normal", first.message_id).await.unwrap();
        assert_eq!(queue.len("q_normal").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delayed_and_released_messages_are_invisible() {
        let queue = InMemoryQueue::new();
        let msg = ExecutionMessage::new(Uuid::now_v7(), "normal");
        queue.send("q", &msg, Duration::from_secs(60)).await.unwrap();
        assert!(queue.receive("q", Duration::from_secs(1)).await.unwrap().is_none());

        let id = queue.send("q", &msg, Duration::ZERO).await.unwrap();
        let leased = queue.receive("q", Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(leased.message_id, id);
        queue.release("q", id, Duration::ZERO).await.unwrap();
        let again = queue.receive("q", Duration::from_secs(1)).await.unwrap().unwrap();
        assert_eq!(again.read_count, 2);
    }

    #[tokio::test]
    async fn test_remove_by_execution() {
        let queue = InMemoryQueue::new();
        let target = Uuid::now_v7();
        queue
            .send("a", &ExecutionMessage::new(target, "a"), Duration::ZERO)
            .await
            .unwrap();
        queue
            .send("b", &ExecutionMessage::new(Uuid::now_v7(), "b"), Duration::ZERO)
            .await
            .unwrap();

        assert_eq!(queue.remove_by_execution(target).await.unwrap(), 1);
        assert_eq!(queue.len("a").await.unwrap(), 0);
        assert_eq!(queue.len("b").await.unwrap(), 1);
    }
}
