//! # Orchestration
//!
//! Submission, execution and failure handling.
//!
//! ```text
//! caller ─▶ Dispatcher::submit ─▶ ExecutionLedger (guard + create)
//!                │
//!                ▼
//!         Backend::submit ─▶ PipelineRunner::run_pipeline ─▶ PipelineHandler::run
//!                                     │
//!                                     ▼
//!                     ErrorClassifier + RetryPolicy ─▶ retry | dead letter
//! ```
//!
//! Presentation layers use the [`Dispatcher`] and
//! [`QueryService`](crate::services::QueryService) only. `run_pipeline` is reached
//! through a backend.

pub mod bootstrap;
pub mod context;
pub mod dead_letter_queue;
pub mod dispatcher;
pub mod error_classifier;
pub mod handler;
pub mod retry_policy;
pub mod runner;

pub use bootstrap::PipelineCore;
pub use context::ExecutionContext;
pub use dead_letter_queue::DeadLetterQueue;
pub use dispatcher::Dispatcher;
pub use error_classifier::{ErrorClassifier, FailureDisposition};
pub use handler::{OutputStatus, PipelineHandler, PipelineOutput};
pub use retry_policy::{BackoffStrategy, RetryPolicy};
pub use runner::{PipelineRunner, RunOutcome};
