//! # Worker Pool
//!
//! `concurrency_per_lane` tokio tasks per lane, each looping
//! receive -> `run_pipeline` -> release (on retry) or ack. A received message is
//! leased to one worker, which is what keeps a given execution on one worker at a
//! time.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineResult;
use crate::messaging::{MessagingError, QueueProvider, QueuedMessage};
use crate::orchestration::{PipelineRunner, RunOutcome};
use crate::types::Lane;

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub lanes: Vec<Lane>,
    pub concurrency_per_lane: usize,
    pub poll_interval: Duration,
    pub visibility_timeout: Duration,
    pub queue_prefix: String,
}

impl WorkerPoolConfig {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            lanes: config.worker.lanes.iter().map(|l| Lane::new(l.as_str())).collect(),
            concurrency_per_lane: config.worker.concurrency_per_lane,
            poll_interval: config.worker.poll_interval(),
            visibility_timeout: config.queue.visibility_timeout(),
            queue_prefix: config.queue.prefix.clone(),
        }
    }
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_config(&PipelineConfig::default())
    }
}

pub struct WorkerPool {
    runner: Arc<PipelineRunner>,
    queue: Arc<QueueProvider>,
    config: WorkerPoolConfig,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(
        runner: Arc<PipelineRunner>,
        queue: Arc<QueueProvider>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            runner,
            queue,
            config,
            shutdown: CancellationToken::new(),
            handles: Vec::new(),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Spawn the workers. Calling twice adds a second set.
    pub fn start(&mut self) {
        for lane in &self.config.lanes {
            let queue_name = lane.queue_name(&self.config.queue_prefix);
            for worker_index in 0..self.config.concurrency_per_lane.max(1) {
                let worker = LaneWorker {
                    runner: Arc::clone(&self.runner),
                    queue: Arc::clone(&self.queue),
                    queue_name: queue_name.clone(),
                    visibility_timeout: self.config.visibility_timeout,
                    poll_interval: self.config.poll_interval,
                    shutdown: self.shutdown.clone(),
                    worker_index,
                };
                self.handles.push(tokio::spawn(worker.run()));
            }
        }
        info!(
            lanes = ?self.config.lanes,
            workers = self.handles.len(),
            provider = self.queue.provider_name(),
            "🚀 Worker pool started"
        );
    }

    /// Receive and run one message from `lane`, without spawning. `None` when the
    /// queue had nothing visible.
    pub async fn process_next(&self, lane: &Lane) -> PipelineResult<Option<RunOutcome>> {
        process_one(
            &self.runner,
            &self.queue,
            &lane.queue_name(&self.config.queue_prefix),
            self.config.visibility_timeout,
        )
        .await
    }

    /// Stop polling and wait for in-flight runs to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        for handle in self.handles.drain(..) {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("🛑 Worker pool stopped");
    }
}

struct LaneWorker {
    runner: Arc<PipelineRunner>,
    queue: Arc<QueueProvider>,
    queue_name: String,
    visibility_timeout: Duration,
    poll_interval: Duration,
    shutdown: CancellationToken,
    worker_index: usize,
}

impl LaneWorker {
    async fn run(self) {
        debug!(queue = %self.queue_name, worker = self.worker_index, "Worker polling");
        while !self.shutdown.is_cancelled() {
            let idle = match process_one(
                &self.runner,
                &self.queue,
                &self.queue_name,
                self.visibility_timeout,
            )
            .await
            {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(queue = %self.queue_name, worker = self.worker_index, error = %e, "Worker iteration failed");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = self.shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }
        debug!(queue = %self.queue_name, worker = self.worker_index, "Worker stopped");
    }
}

async fn process_one(
    runner: &PipelineRunner,
    queue: &QueueProvider,
    queue_name: &str,
    visibility_timeout: Duration,
) -> PipelineResult<Option<RunOutcome>> {
    let Some(delivery) = queue.receive(queue_name, visibility_timeout).await? else {
        return Ok(None);
    };
    let execution_id = delivery.message.execution_id;

    // A failed run leaves the message leased; it reappears after the visibility timeout.
    let outcome = runner.run_pipeline(execution_id).await?;
    match outcome {
        RunOutcome::RetryScheduled { delay } => {
            requeue(queue, queue_name, &delivery, delay).await?;
        }
        RunOutcome::Skipped => {
            let status = runner.ledger().status(execution_id).await?;
            if status.is_active() {
                // Another worker still owns the run; its lease ran out. Keep the message
                // so the owner can ack or release it.
                warn!(
                    execution_id = %execution_id,
                    message_id = delivery.message_id,
                    read_count = delivery.read_count,
                    status = %status,
                    "Redelivered while still active, message kept"
                );
            } else {
                debug!(
                    execution_id = %execution_id,
                    message_id = delivery.message_id,
                    status = %status,
                    "Stale delivery acked"
                );
                ack(queue, queue_name, delivery.message_id).await?;
            }
        }
        _ => ack(queue, queue_name, delivery.message_id).await?,
    }
    Ok(Some(outcome))
}

/// Make the message visible again after `delay`, or send a fresh one when it is gone.
/// The execution is `queued` at this point and must not be left without a message.
async fn requeue(
    queue: &QueueProvider,
    queue_name: &str,
    delivery: &QueuedMessage,
    delay: Duration,
) -> PipelineResult<()> {
    match queue.release(queue_name, delivery.message_id, delay).await {
        Ok(()) => Ok(()),
        Err(MessagingError::MessageNotFound { .. }) => {
            let message_id = queue.send(queue_name, &delivery.message, delay).await?;
            warn!(
                execution_id = %delivery.message.execution_id,
                old_message_id = delivery.message_id,
                message_id,
                "Leased message vanished, retry re-sent"
            );
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// A cancel may withdraw the message while its run is in flight, so a missing message
/// at ack time is not an error.
async fn ack(queue: &QueueProvider, queue_name: &str, message_id: i64) -> PipelineResult<()> {
    match queue.ack(queue_name, message_id).await {
        Ok(()) => Ok(()),
        Err(MessagingError::MessageNotFound { .. }) => {
            debug!(queue = queue_name, message_id, "Message already withdrawn");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
