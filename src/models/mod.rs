//! # Models
//!
//! Row types for every table the core owns. Rows decode through a private `*Row`
//! struct with raw column types and convert into the public model, so status and
//! class strings are validated at the boundary.

pub mod capture;
pub mod dead_letter;
pub mod execution;
pub mod execution_event;
pub mod manifest_entry;
pub mod quality_result;
pub mod reject;

pub use capture::{Capture, NewCapture};
pub use dead_letter::{DeadLetterEntry, DeadLetterReason, DlqListParams, Resolution};
pub use execution::{Execution, ExecutionQuery, NewExecution};
pub use execution_event::ExecutionEvent;
pub use manifest_entry::ManifestEntry;
pub use quality_result::{QualityResult, QualityStatus};
pub use reject::{NewReject, Reject};
