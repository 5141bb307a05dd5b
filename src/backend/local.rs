use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use super::Backend;
use crate::error::PipelineResult;
use crate::orchestration::{PipelineRunner, RunOutcome};
use crate::types::Lane;

/// In-process backend. `submit` runs the pipeline on the caller's task and returns
/// once it reaches a final outcome, sleeping out retry delays in between.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    runner: Arc<PipelineRunner>,
}

impl LocalBackend {
    pub fn new(runner: Arc<PipelineRunner>) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn submit(&self, execution_id: Uuid, _lane: &Lane) -> PipelineResult<String> {
        let mut attempts = 0_u32;
        loop {
            attempts += 1;
            match self.runner.run_pipeline(execution_id).await? {
                RunOutcome::RetryScheduled { delay } => {
                    debug!(execution_id = %execution_id, ?delay, "Local retry, sleeping");
                    tokio::time::sleep(delay).await;
                }
                outcome => {
                    info!(execution_id = %execution_id, ?outcome, attempts, "Local run finished");
                    break;
                }
            }
        }
        Ok(format!("local:{execution_id}"))
    }

    async fn cancel(&self, execution_id: Uuid) -> PipelineResult<bool> {
        Ok(self.runner.signal_cancel(execution_id))
    }
}
