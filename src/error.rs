//! Error types for the pipeline core.
//!
//! [`PipelineError`] is the taxonomy surfaced to callers of the dispatcher and the
//! read-side services. [`HandlerError`] is what pipeline handlers return; it is
//! classified exactly once, at the `run_pipeline` boundary, into an [`ErrorClass`].

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigurationError;
use crate::messaging::MessagingError;

/// A single field-level parameter violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn join_field_errors(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Submitted parameters violate the pipeline's schema. Never executed.
    #[error("Parameter validation failed for pipeline {pipeline}: {}", join_field_errors(.errors))]
    ParamValidation {
        pipeline: String,
        errors: Vec<FieldError>,
    },

    /// No handler registered under this name.
    #[error("Pipeline not found: {0}")]
    PipelineNotFound(String),

    /// An active execution already holds the logical key.
    #[error("Concurrency conflict: logical key {logical_key} is held by an active execution")]
    ConcurrencyConflict {
        logical_key: String,
        active_execution_id: Option<Uuid>,
    },

    /// Downstream readiness is blocked by failing quality checks.
    #[error("Quality gate failed for {partition_key}: failing checks {failing_checks:?}")]
    QualityGateFailure {
        partition_key: String,
        failing_checks: Vec<String>,
    },

    #[error("Invalid transition for execution {execution_id}: {from} -> {to}")]
    InvalidTransition {
        execution_id: Uuid,
        from: String,
        to: String,
    },

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(Uuid),

    #[error("Dead letter {0} is already resolved")]
    DeadLetterAlreadyResolved(Uuid),

    #[error("Capture conflict: ({business_key}, {capture_id}) already exists with a different payload")]
    CaptureConflict {
        business_key: String,
        capture_id: String,
    },

    #[error("Capture not found: ({business_key}, {capture_id})")]
    CaptureNotFound {
        business_key: String,
        capture_id: String,
    },

    #[error("Unknown stage {stage} for domain {domain}")]
    UnknownStage { domain: String, stage: String },

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Messaging error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Invalid stored value: {0}")]
    InvalidState(String),
}

impl PipelineError {
    /// Errors a caller made in the submission itself, as opposed to infrastructure faults.
    pub fn is_submission_error(&self) -> bool {
        matches!(
            self,
            Self::ParamValidation { .. }
                | Self::PipelineNotFound(_)
                | Self::ConcurrencyConflict { .. }
        )
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Errors raised by pipeline handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Retryable: I/O, timeouts, unavailable upstreams.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Non-retryable: routes straight to the dead letter queue.
    #[error("Fatal error: {0}")]
    Fatal(String),

    /// Cancellation observed at a checkpoint.
    #[error("Execution cancelled")]
    Cancelled,
}

impl HandlerError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient(message.into())
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(message.into())
    }
}

impl From<sqlx::Error> for HandlerError {
    fn from(err: sqlx::Error) -> Self {
        HandlerError::Transient(format!("database: {err}"))
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Transient(format!("{err:#}"))
    }
}

impl From<PipelineError> for HandlerError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Database(e) => HandlerError::from(e),
            PipelineError::Messaging(e) => HandlerError::Transient(e.to_string()),
            other => HandlerError::Fatal(other.to_string()),
        }
    }
}

/// Classification recorded on the execution row and in the failure event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Fatal,
    Cancelled,
}

impl ErrorClass {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::Cancelled => "cancelled",
        }
    }

    pub const fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "fatal" => Ok(Self::Fatal),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid error class: {s}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_validation_message_lists_fields() {
        let err = PipelineError::ParamValidation {
            pipeline: "weekly_ingest".to_string(),
            errors: vec![
                FieldError::new("week_ending", "is required"),
                FieldError::new("tier", "must be one of [NMS, OTC]"),
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("week_ending: is required"));
        assert!(msg.contains("tier: must be one of"));
        assert!(err.is_submission_error());
    }

    #[test]
    fn test_pipeline_not_found_is_distinct_from_param_errors() {
        let err = PipelineError::PipelineNotFound("missing".to_string());
        assert!(matches!(err, PipelineError::PipelineNotFound(_)));
        assert!(!err.to_string().contains("Parameter"));
    }

    #[test]
    fn test_handler_error_conversions() {
        let err: HandlerError = anyhow::anyhow!("upstream timed out").into();
        assert!(matches!(err, HandlerError::Transient(_)));

        let err: HandlerError = PipelineError::UnknownStage {
            domain: "d".into(),
            stage: "s".into(),
        }
        .into();
        assert!(matches!(err, HandlerError::Fatal(_)));
    }

    #[test]
    fn test_error_class_round_trip() {
        for class in [ErrorClass::Transient, ErrorClass::Fatal, ErrorClass::Cancelled] {
            assert_eq!(class.as_str().parse::<ErrorClass>().unwrap(), class);
        }
        assert!(ErrorClass::Transient.is_retryable());
        assert!(!ErrorClass::Fatal.is_retryable());
    }
}
