#![allow(clippy::doc_markdown)] // Allow technical terms like SQLite, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # Pipeline Core
//!
//! Dispatch-and-ledger core for a tiered data pipeline platform.
//!
//! ## Overview
//!
//! One submission entrypoint, one processing entrypoint, and an append-only record of
//! everything in between. A deployment starts with the in-process backend and moves
//! to a queue of workers without changing handler code or ledger semantics.
//!
//! ## Key Guarantees
//!
//! - **One active execution per logical key**: reserve and insert are one statement
//! - **Atomic lineage**: every status change writes the row and its event together
//! - **Safe re-runs**: stage writes declare an idempotency level and advance the
//!   manifest in the same transaction
//! - **Retries never rewrite history**: dead letters spawn new, linked executions
//! - **Point-in-time data**: captures keep business, source and platform clocks
//!
//! ## Module Organization
//!
//! - [`orchestration`] - Dispatcher, runner, retry policy, dead letters
//! - [`backend`] - Local and queue backends, worker pool
//! - [`ledger`] - Execution table, event log, state transitions
//! - [`registry`] - Pipeline handlers and parameter schemas
//! - [`manifest`] - Stage manifest and idempotency guard
//! - [`capture`] - Three-clock capture store and diffs
//! - [`rolling`] - Rolling windows and trend classification
//! - [`quality`] - Rejects, quality checks, readiness gate
//! - [`services`] - Read-only query facade
//! - [`config`] - Layered configuration
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pipeline_core::config::ConfigManager;
//! use pipeline_core::models::NewExecution;
//! use pipeline_core::orchestration::PipelineCore;
//! use pipeline_core::registry::Registry;
//! use pipeline_core::types::Params;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = Registry::new();
//! // registry.register("finra_weekly_ingest", FinraWeeklyIngest)?;
//!
//! let core = PipelineCore::bootstrap(ConfigManager::load()?, registry).await?;
//! let execution = core
//!     .dispatcher()
//!     .submit(
//!         NewExecution::new("finra_weekly_ingest", Params::new())
//!             .with_logical_key(Some("finra:2025-12-26".to_string())),
//!     )
//!     .await?;
//! println!("{} is {}", execution.execution_id, execution.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit, integration and property tests
//! ```

pub mod backend;
pub mod capture;
pub mod config;
pub mod database;
pub mod error;
pub mod ledger;
pub mod logging;
pub mod manifest;
pub mod messaging;
pub mod models;
pub mod orchestration;
pub mod quality;
pub mod registry;
pub mod rolling;
pub mod services;
pub mod state_machine;
pub mod types;

pub use config::{ConfigManager, PipelineConfig};
pub use error::{ErrorClass, FieldError, HandlerError, PipelineError, PipelineResult};
pub use ledger::ExecutionLedger;
pub use models::{Execution, NewExecution};
pub use orchestration::{
    Dispatcher, ExecutionContext, PipelineCore, PipelineHandler, PipelineOutput, RunOutcome,
};
pub use registry::Registry;
pub use state_machine::ExecutionStatus;
pub use types::{Lane, Metrics, Params, TriggerSource};
