//! # Execution Backends
//!
//! Where `run_pipeline` gets called. Both implementations produce the same ledger
//! semantics; they differ only in latency and concurrency.
//!
//! - [`LocalBackend`] runs the pipeline inline and blocks the submitter
//! - [`QueueBackend`] enqueues onto the lane queue; a [`WorkerPool`] (in this
//!   process or another) dequeues and runs it
//!
//! The backend is chosen by configuration (`backend.kind`), not by handler code.

pub mod local;
pub mod queue;
pub mod worker_pool;

pub use local::LocalBackend;
pub use queue::QueueBackend;
pub use worker_pool::{WorkerPool, WorkerPoolConfig};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::PipelineResult;
use crate::types::Lane;

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Hand the execution over. Returns the backend's run id.
    async fn submit(&self, execution_id: Uuid, lane: &Lane) -> PipelineResult<String>;

    /// Withdraw or signal the execution. Returns whether anything was reached.
    async fn cancel(&self, execution_id: Uuid) -> PipelineResult<bool>;
}
