//! # Tracing Module
//!
//! Environment-aware console logging on the tracing ecosystem. Logs go to stdout
//! for containers; ANSI colors only when stdout is a terminal, JSON lines when
//! configured.
//!
//! Level precedence: `RUST_LOG`, then `LOG_LEVEL`, then the environment default
//! (`debug` for development and test, `info` otherwise).

use chrono::Utc;
use std::io::IsTerminal;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

use crate::config::{ConfigManager, LoggingConfig};

static TRACING_INITIALIZED: OnceLock<()> = OnceLock::new();

/// Initialize console tracing once per process. Safe to call again, and tolerant
/// of a subscriber installed by someone else.
pub fn init_tracing(config: &LoggingConfig) {
    TRACING_INITIALIZED.get_or_init(|| {
        let environment = ConfigManager::detect_environment();
        let filter = build_filter(config.level.as_deref(), &environment);
        let use_ansi = std::io::stdout().is_terminal();

        let layer = if config.json {
            fmt::layer()
                .json()
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(filter)
                .boxed()
        } else {
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(use_ansi)
                .with_filter(filter)
                .boxed()
        };

        if tracing_subscriber::registry().with(layer).try_init().is_err() {
            tracing::debug!("Global tracing subscriber already initialized");
            return;
        }

        tracing::info!(
            environment = %environment,
            json = config.json,
            ansi = use_ansi,
            "Console logging initialized"
        );
    });
}

fn build_filter(configured: Option<&str>, environment: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    let level = std::env::var("LOG_LEVEL")
        .ok()
        .or_else(|| configured.map(ToString::to_string))
        .unwrap_or_else(|| default_level(environment).to_string());
    EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new(default_level(environment)))
}

fn default_level(environment: &str) -> &'static str {
    match environment {
        "development" | "test" => "debug",
        _ => "info",
    }
}

/// Structured record of an execution lifecycle step.
pub fn log_execution_operation(
    operation: &str,
    execution_id: Uuid,
    pipeline: &str,
    status: &str,
    details: Option<&str>,
) {
    tracing::info!(
        operation = %operation,
        execution_id = %execution_id,
        pipeline = %pipeline,
        status = %status,
        details = details,
        timestamp = %Utc::now().to_rfc3339(),
        "📋 EXECUTION_OPERATION"
    );
}
