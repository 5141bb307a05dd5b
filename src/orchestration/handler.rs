//! # Pipeline Handler Contract
//!
//! What domain code implements. Handlers are written once and run unchanged under
//! every backend; they reach storage only through the [`ExecutionContext`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::context::ExecutionContext;
use crate::error::HandlerError;
use crate::manifest::IdempotencyLevel;
use crate::registry::ParamSchema;
use crate::types::{Metrics, Params};

#[async_trait]
pub trait PipelineHandler: Send + Sync {
    /// Declared parameters. Checked at submission, before any execution exists.
    fn param_schema(&self) -> ParamSchema {
        ParamSchema::new()
    }

    /// How the handler's writes behave when run again.
    fn idempotency_level(&self) -> IdempotencyLevel {
        IdempotencyLevel::AppendOnly
    }

    async fn run(
        &self,
        params: &Params,
        ctx: &ExecutionContext,
    ) -> Result<PipelineOutput, HandlerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStatus {
    Completed,
    Failed,
}

/// `{status, metrics, error?}` returned by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutput {
    pub status: OutputStatus,
    pub metrics: Metrics,
    pub error: Option<String>,
}

impl PipelineOutput {
    pub fn completed() -> Self {
        Self {
            status: OutputStatus::Completed,
            metrics: Metrics::new(),
            error: None,
        }
    }

    pub fn with_metrics(metrics: Metrics) -> Self {
        Self {
            metrics,
            ..Self::completed()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: OutputStatus::Failed,
            metrics: Metrics::new(),
            error: Some(error.into()),
        }
    }

    pub fn metric(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metrics.insert(name.into(), value.into());
        self
    }

    pub fn is_completed(&self) -> bool {
        self.status == OutputStatus::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_output_builders() {
        let out = PipelineOutput::completed()
            .metric("rows", 120)
            .metric("source", "finra");
        assert!(out.is_completed());
        assert_eq!(out.metrics["rows"], json!(120));

        let failed = PipelineOutput::failed("no file");
        assert!(!failed.is_completed());
        assert_eq!(failed.error.as_deref(), Some("no file"));
    }
}
