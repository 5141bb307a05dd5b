use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

use super::Backend;
use crate::error::PipelineResult;
use crate::messaging::{ExecutionMessage, QueueProvider};
use crate::orchestration::PipelineRunner;
use crate::types::Lane;

/// Distributed backend. `submit` enqueues onto `<prefix>_<lane>` and returns at once.
#[derive(Debug, Clone)]
pub struct QueueBackend {
    queue: Arc<QueueProvider>,
    prefix: String,
    /// Present when workers share this process, so cancel can reach them directly
    local_runner: Option<Arc<PipelineRunner>>,
}

impl QueueBackend {
    pub fn new(
        queue: Arc<QueueProvider>,
        prefix: impl Into<String>,
        local_runner: Option<Arc<PipelineRunner>>,
    ) -> Self {
        Self {
            queue,
            prefix: prefix.into(),
            local_runner,
        }
    }

    pub fn queue(&self) -> &Arc<QueueProvider> {
        &self.queue
    }

    pub fn queue_name(&self, lane: &Lane) -> String {
        lane.queue_name(&self.prefix)
    }
}

#[async_trait]
impl Backend for QueueBackend {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn submit(&self, execution_id: Uuid, lane: &Lane) -> PipelineResult<String> {
        let queue_name = self.queue_name(lane);
        let message = ExecutionMessage::new(execution_id, lane.as_str());
        let message_id = self.queue.send(&queue_name, &message, Duration::ZERO).await?;
        info!(
            execution_id = %execution_id,
            queue = %queue_name,
            message_id,
            provider = self.queue.provider_name(),
            "Execution enqueued"
        );
        Ok(format!("{queue_name}:{message_id}"))
    }

    /// Withdraws any queued message and signals a run in this process. A run in
    /// another process sees the ledger's `cancelling` status at its next checkpoint.
    async fn cancel(&self, execution_id: Uuid) -> PipelineResult<bool> {
        let removed = self.queue.remove_by_execution(execution_id).await?;
        let signalled = self
            .local_runner
            .as_ref()
            .is_some_and(|runner| runner.signal_cancel(execution_id));
        Ok(removed > 0 || signalled)
    }
}
