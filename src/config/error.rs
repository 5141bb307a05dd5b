//! Configuration Error Types
//!
//! Errors raised while loading, merging and validating [`PipelineConfig`](super::PipelineConfig).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// A source failed to load or the merged tree failed to deserialize
    #[error("Failed to load configuration: {0}")]
    Load(String),

    /// Missing required configuration field
    #[error("Missing required configuration field '{field}' in {context}")]
    MissingRequiredField { field: String, context: String },

    /// Invalid configuration value
    #[error("Invalid value '{value}' for field '{field}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Several validation failures reported together
    #[error("Configuration validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),
}

impl ConfigurationError {
    pub fn invalid_value(
        field: impl Into<String>,
        value: impl ToString,
        context: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }

    pub fn missing_required_field(field: impl Into<String>, context: impl Into<String>) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::Load(err.to_string())
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
