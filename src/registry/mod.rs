//! # Pipeline Registry
//!
//! Maps pipeline names to handlers. Built once at startup and shared by reference
//! with the dispatcher and the runner; there is no process-global registry.
//!
//! ```rust,ignore
//! let mut registry = Registry::new();
//! registry.register("finra_weekly_ingest", FinraWeeklyIngest::default())?;
//! let registry = Arc::new(registry);
//! ```

pub mod param_schema;

pub use param_schema::{ParamKind, ParamSchema, ParamSpec, ParamValidator, RESERVED_PARAMS};

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{PipelineError, PipelineResult};
use crate::orchestration::handler::PipelineHandler;
use crate::types::Params;

#[derive(Default, Clone)]
pub struct Registry {
    handlers: HashMap<String, Arc<dyn PipelineHandler>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`. Names are unique.
    pub fn register<H>(&mut self, name: impl Into<String>, handler: H) -> PipelineResult<()>
    where
        H: PipelineHandler + 'static,
    {
        self.register_arc(name, Arc::new(handler))
    }

    pub fn register_arc(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn PipelineHandler>,
    ) -> PipelineResult<()> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(PipelineError::Registry(
                "pipeline name cannot be empty".to_string(),
            ));
        }
        if self.handlers.contains_key(&name) {
            return Err(PipelineError::Registry(format!(
                "pipeline {name} is already registered"
            )));
        }

        info!(
            pipeline = %name,
            idempotency_level = %handler.idempotency_level(),
            "Registered pipeline handler"
        );
        self.handlers.insert(name, handler);
        Ok(())
    }

    pub fn get(&self, name: &str) -> PipelineResult<Arc<dyn PipelineHandler>> {
        self.handlers
            .get(name)
            .cloned()
            .ok_or_else(|| PipelineError::PipelineNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.handlers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Resolve the handler and validate `params` against its schema.
    ///
    /// An unknown name is `PipelineNotFound` and never a parameter error.
    pub fn validate_params(&self, name: &str, params: &Params) -> PipelineResult<Params> {
        let handler = self.get(name)?;
        handler.param_schema().validate(name, params)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("pipelines", &self.list())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::orchestration::{ExecutionContext, PipelineOutput};
    use async_trait::async_trait;
    use serde_json::json;

    struct Noop;

    #[async_trait]
    impl PipelineHandler for Noop {
        fn param_schema(&self) -> ParamSchema {
            ParamSchema::new().param(ParamSpec::required("date", ParamKind::Date))
        }

        async fn run(
            &self,
            _params: &Params,
            _ctx: &ExecutionContext,
        ) -> Result<PipelineOutput, HandlerError> {
            Ok(PipelineOutput::completed())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        registry.register("b_pipeline", Noop).unwrap();
        registry.register("a_pipeline", Noop).unwrap();

        assert_eq!(registry.list(), vec!["a_pipeline", "b_pipeline"]);
        assert!(registry.contains("a_pipeline"));
        assert!(registry.get("a_pipeline").is_ok());
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let mut registry = Registry::new();
        registry.register("ingest", Noop).unwrap();
        assert!(matches!(
            registry.register("ingest", Noop),
            Err(PipelineError::Registry(_))
        ));
    }

    #[test]
    fn test_unknown_pipeline_is_not_a_param_error() {
        let registry = Registry::new();
        let err = registry
            .validate_params("missing", &Params::new())
            .unwrap_err();
        assert!(matches!(err, PipelineError::PipelineNotFound(name) if name == "missing"));
    }

    #[test]
    fn test_validate_params_uses_handler_schema() {
        let mut registry = Registry::new();
        registry.register("ingest", Noop).unwrap();

        let mut params = Params::new();
        assert!(matches!(
            registry.validate_params("ingest", &params),
            Err(PipelineError::ParamValidation { .. })
        ));

        params.insert("date".to_string(), json!("2025-12-26"));
        assert!(registry.validate_params("ingest", &params).is_ok());
    }
}
