//! # Error Classification
//!
//! Handler failures are classified once, at the `run_pipeline` boundary, and the
//! classification decides what happens next.
//!
//! ```text
//! ┌──────────────┐     ┌─────────────────┐     ┌────────────────────┐
//! │ HandlerError │────▶│ ErrorClassifier │────▶│ FailureDisposition │
//! │ + status     │     │ + RetryPolicy   │     │ retry / DLQ / ...  │
//! └──────────────┘     └─────────────────┘     └────────────────────┘
//! ```

use std::any::Any;
use std::time::Duration;

use super::handler::PipelineOutput;
use super::retry_policy::RetryPolicy;
use crate::error::{ErrorClass, HandlerError};
use crate::models::DeadLetterReason;
use crate::state_machine::ExecutionStatus;

/// What the runner does with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// `failed -> queued` after `delay`
    Retry { delay: Duration },
    /// `failed -> dead_lettered`
    DeadLetter {
        reason: DeadLetterReason,
        charge_retry: bool,
    },
    /// Cancellation observed at a checkpoint
    Cancel,
    /// Terminal `failed`, used once cancel was requested
    Fail,
}

#[derive(Debug, Clone)]
pub struct ErrorClassifier {
    policy: RetryPolicy,
}

impl ErrorClassifier {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn classify(&self, error: &HandlerError) -> ErrorClass {
        match error {
            HandlerError::Transient(_) => ErrorClass::Transient,
            HandlerError::Fatal(_) => ErrorClass::Fatal,
            HandlerError::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// Decide the next move for an attempt that failed with `class` while the
    /// execution was in `status` with `retry_count` failures already charged.
    pub fn disposition(
        &self,
        class: ErrorClass,
        status: ExecutionStatus,
        retry_count: u32,
    ) -> FailureDisposition {
        if class == ErrorClass::Cancelled {
            return FailureDisposition::Cancel;
        }
        if status == ExecutionStatus::Cancelling {
            return FailureDisposition::Fail;
        }
        match class {
            ErrorClass::Transient => {
                let failures = retry_count.saturating_add(1);
                if self.policy.should_retry(failures) {
                    FailureDisposition::Retry {
                        delay: self.policy.get_delay(failures),
                    }
                } else {
                    FailureDisposition::DeadLetter {
                        reason: DeadLetterReason::MaxRetriesExceeded,
                        charge_retry: true,
                    }
                }
            }
            _ => FailureDisposition::DeadLetter {
                reason: DeadLetterReason::FatalError,
                charge_retry: false,
            },
        }
    }
}

/// A handler that returned a `Failed` output is treated as a transient failure.
pub fn error_from_output(output: &PipelineOutput) -> HandlerError {
    HandlerError::Transient(
        output
            .error
            .clone()
            .unwrap_or_else(|| "handler reported failure".to_string()),
    )
}

/// Panics are fatal: the same input will panic again.
pub fn error_from_panic(payload: Box<dyn Any + Send>) -> HandlerError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    HandlerError::Fatal(format!("handler panicked: {message}"))
}
