//! # Pipeline Configuration
//!
//! Layered configuration for the dispatch core. Sources, lowest precedence first:
//!
//! 1. Built-in defaults ([`PipelineConfig::default`])
//! 2. `config/pipeline.toml`
//! 3. `config/pipeline.<environment>.toml`
//! 4. `PIPELINE__*` environment variables, e.g. `PIPELINE__RETRY__MAX_RETRIES=5`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pipeline_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let retry = &manager.config().retry;
//! println!("max retries: {}", retry.max_retries);
//! # Ok(())
//! # }
//! ```
//!
//! The backend is chosen here (`backend.kind`), never by branching in handler code.

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipelineConfig {
    pub database: DatabaseConfig,
    pub backend: BackendConfig,
    pub retry: RetryConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub logging: LoggingConfig,
}

impl PipelineConfig {
    /// Validate cross-field constraints, reporting every problem at once.
    pub fn validate(&self) -> ConfigResult<()> {
        let mut problems = Vec::new();

        if self.database.url.trim().is_empty() {
            problems.push("database.url must not be empty".to_string());
        }
        if self.database.max_connections == 0 {
            problems.push("database.max_connections must be greater than 0".to_string());
        }
        if let Err(e) = self.backend.kind.parse::<BackendKind>() {
            problems.push(e);
        }
        if self.retry.multiplier < 1.0 {
            problems.push(format!(
                "retry.multiplier must be >= 1.0, got {}",
                self.retry.multiplier
            ));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            problems.push("retry.max_delay_ms must be >= retry.base_delay_ms".to_string());
        }
        if let Err(e) = self.queue.provider.parse::<QueueProviderKind>() {
            problems.push(e);
        }
        if self.queue.prefix.trim().is_empty() {
            problems.push("queue.prefix must not be empty".to_string());
        }
        if self.worker.lanes.is_empty() {
            problems.push("worker.lanes must name at least one lane".to_string());
        }
        if self.worker.concurrency_per_lane == 0 {
            problems.push("worker.concurrency_per_lane must be greater than 0".to_string());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigurationError::Validation(problems))
        }
    }

    pub fn backend_kind(&self) -> ConfigResult<BackendKind> {
        self.backend
            .kind
            .parse()
            .map_err(|e: String| ConfigurationError::invalid_value("backend.kind", &self.backend.kind, e))
    }

    pub fn queue_provider_kind(&self) -> ConfigResult<QueueProviderKind> {
        self.queue
            .provider
            .parse()
            .map_err(|e: String| ConfigurationError::invalid_value("queue.provider", &self.queue.provider, e))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL, e.g. `sqlite://pipeline.db`
    pub url: String,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
    pub create_if_missing: bool,
    /// Apply embedded migrations on connect
    pub run_migrations: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://pipeline.db".to_string(),
            max_connections: 5,
            busy_timeout_ms: 5_000,
            create_if_missing: true,
            run_migrations: true,
        }
    }
}

impl DatabaseConfig {
    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// In-process and blocking
    Local,
    /// Lane queues drained by a worker pool
    Queue,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "queue" => Ok(Self::Queue),
            other => Err(format!("unknown backend kind '{other}', expected local or queue")),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Queue => write!(f, "queue"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: "local".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Failed attempts allowed before dead-lettering
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Use `base_delay_ms` for every attempt instead of exponential growth
    pub fixed: bool,
    pub jitter: bool,
    pub max_jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            fixed: false,
            jitter: false,
            max_jitter: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueProviderKind {
    InMemory,
    Database,
}

impl FromStr for QueueProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "in_memory" | "memory" => Ok(Self::InMemory),
            "database" | "db" => Ok(Self::Database),
            other => Err(format!(
                "unknown queue provider '{other}', expected in_memory or database"
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub provider: String,
    /// Lane queues are named `<prefix>_<lane>`
    pub prefix: String,
    pub visibility_timeout_seconds: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            provider: "database".to_string(),
            prefix: "pipeline_queue".to_string(),
            visibility_timeout_seconds: 300,
        }
    }
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub lanes: Vec<String>,
    pub concurrency_per_lane: usize,
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lanes: vec!["normal".to_string()],
            concurrency_per_lane: 2,
            poll_interval_ms: 250,
        }
    }
}

impl WorkerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct LoggingConfig {
    /// Overrides the environment default when set
    pub level: Option<String>,
    /// Force JSON output even on a TTY
    pub json: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend_kind().unwrap(), BackendKind::Local);
        assert_eq!(config.queue_provider_kind().unwrap(), QueueProviderKind::Database);
    }

    #[test]
    fn test_validation_collects_all_problems() {
        let mut config = PipelineConfig::default();
        config.database.max_connections = 0;
        config.retry.multiplier = 0.5;
        config.worker.lanes.clear();
        config.backend.kind = "lambda".to_string();

        match config.validate() {
            Err(ConfigurationError::Validation(problems)) => {
                assert_eq!(problems.len(), 4, "{problems:?}");
                assert!(problems.iter().any(|p| p.contains("lambda")));
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }
}
