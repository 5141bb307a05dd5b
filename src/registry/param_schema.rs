//! # Parameter Schemas
//!
//! Typed, per-pipeline parameter declarations checked at submission, before any
//! execution row exists. Validation coerces string inputs for numeric, boolean and
//! date kinds (CLI and query-string callers send strings), applies defaults, and
//! reports every violation at once.

use chrono::NaiveDate;
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use crate::error::{FieldError, PipelineError, PipelineResult};
use crate::types::Params;

/// Params every pipeline accepts without declaring them.
pub const RESERVED_PARAMS: [&str; 2] = ["batch_id", "force"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    String,
    Integer,
    Float,
    Boolean,
    /// `YYYY-MM-DD`
    Date,
    /// Any JSON value, passed through untouched
    Json,
}

impl ParamKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Json => "json",
        }
    }

    fn coerce(self, value: &Value) -> Result<Value, String> {
        let mismatch = || format!("expected {}, got {value}", self.as_str());
        match (self, value) {
            (Self::Json, v) => Ok(v.clone()),
            (Self::String, Value::String(_)) => Ok(value.clone()),
            (Self::Integer, Value::Number(n)) => n.as_i64().map(Value::from).ok_or_else(mismatch),
            (Self::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().map(Value::from).map_err(|_| mismatch())
            }
            (Self::Float, Value::Number(n)) => n.as_f64().map(Value::from).ok_or_else(mismatch),
            (Self::Float, Value::String(s)) => {
                s.trim().parse::<f64>().map(Value::from).map_err(|_| mismatch())
            }
            (Self::Boolean, Value::Bool(_)) => Ok(value.clone()),
            (Self::Boolean, Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(mismatch()),
            },
            (Self::Date, Value::String(s)) => NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
                .map(|d| Value::String(d.format("%Y-%m-%d").to_string()))
                .map_err(|_| format!("expected date (YYYY-MM-DD), got {value}")),
            _ => Err(mismatch()),
        }
    }
}

impl fmt::Display for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra check run on the coerced value. `Err` carries the field message.
pub type ParamValidator = Arc<dyn Fn(&Value) -> Result<(), String> + Send + Sync>;

#[derive(Clone)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub required: bool,
    pub default: Option<Value>,
    /// Empty means any value of the right kind
    pub allowed: Vec<Value>,
    pub validator: Option<ParamValidator>,
    pub description: Option<String>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, kind: ParamKind) -> Self {
        Self::new(name, kind, true)
    }

    pub fn optional(name: impl Into<String>, kind: ParamKind) -> Self {
        Self::new(name, kind, false)
    }

    fn new(name: impl Into<String>, kind: ParamKind, required: bool) -> Self {
        Self {
            name: name.into(),
            kind,
            required,
            default: None,
            allowed: Vec::new(),
            validator: None,
            description: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    pub fn one_of<V: Into<Value>>(mut self, values: impl IntoIterator<Item = V>) -> Self {
        self.allowed = values.into_iter().map(Into::into).collect();
        self
    }

    pub fn validate_with<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn check(&self, value: &Value) -> Result<Value, String> {
        let value = self.kind.coerce(value)?;
        if !self.allowed.is_empty() && !self.allowed.contains(&value) {
            let allowed: Vec<String> = self.allowed.iter().map(display_value).collect();
            return Err(format!("must be one of [{}]", allowed.join(", ")));
        }
        if let Some(validator) = &self.validator {
            validator(&value)?;
        }
        Ok(value)
    }
}

impl fmt::Debug for ParamSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ParamSpec")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("required", &self.required)
            .field("default", &self.default)
            .field("allowed", &self.allowed)
            .field("validator", &self.validator.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParamSchema {
    specs: Vec<ParamSpec>,
}

impl ParamSchema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn specs(&self) -> &[ParamSpec] {
        &self.specs
    }

    /// Check `params` and return the normalized set: defaults applied, strings coerced
    /// to their declared kinds. A `null` value counts as absent.
    pub fn validate(&self, pipeline: &str, params: &Params) -> PipelineResult<Params> {
        let mut errors = Vec::new();
        let mut normalized = Params::new();

        let declared: BTreeSet<&str> = self.specs.iter().map(|s| s.name.as_str()).collect();
        for (name, value) in params {
            if declared.contains(name.as_str()) {
                continue;
            }
            match name.as_str() {
                "batch_id" => match value {
                    Value::String(_) => {
                        normalized.insert(name.clone(), value.clone());
                    }
                    Value::Null => {}
                    other => errors.push(FieldError::new(
                        name.as_str(),
                        format!("expected string, got {other}"),
                    )),
                },
                "force" => match ParamKind::Boolean.coerce(value) {
                    Ok(v) => {
                        normalized.insert(name.clone(), v);
                    }
                    Err(message) => errors.push(FieldError::new(name.as_str(), message)),
                },
                _ => errors.push(FieldError::new(name.as_str(), "unknown parameter")),
            }
        }

        for spec in &self.specs {
            let supplied = params.get(&spec.name).filter(|v| !v.is_null());
            let Some(value) = supplied.or(spec.default.as_ref()) else {
                if spec.required {
                    errors.push(FieldError::new(spec.name.as_str(), "is required"));
                }
                continue;
            };
            match spec.check(value) {
                Ok(v) => {
                    normalized.insert(spec.name.clone(), v);
                }
                Err(message) => errors.push(FieldError::new(spec.name.as_str(), message)),
            }
        }

        if errors.is_empty() {
            Ok(normalized)
        } else {
            Err(PipelineError::ParamValidation {
                pipeline: pipeline.to_string(),
                errors,
            })
        }
    }
}
