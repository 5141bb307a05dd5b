//! # Rejects and Quality
//!
//! Two failure classes that must stay apart:
//!
//! - **Rejects** are per-record validation failures. They are recorded and the run
//!   continues; an execution with rejects can still complete.
//! - **Quality results** are named checks over a partition. WARN never blocks. FAIL
//!   blocks downstream readiness through [`ReadinessGate`] without failing the
//!   execution that ran the check.

pub mod readiness;
pub mod reject_sink;
pub mod runner;

pub use readiness::{Readiness, ReadinessGate};
pub use reject_sink::RejectSink;
pub use runner::{CheckOutcome, FnCheck, QualityCheck, QualityReport, QualityRunner};
