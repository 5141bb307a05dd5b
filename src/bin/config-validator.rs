//! # Pipeline Configuration Validator
//!
//! Loads the layered configuration for an environment, validates it, and prints the
//! effective settings. Exits non-zero when validation fails.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{error, info};

use pipeline_core::config::{loader::CONFIG_FILE_STEM, ConfigManager, PipelineConfig};
use pipeline_core::logging::init_tracing;

#[derive(Parser)]
#[command(name = "config-validator")]
#[command(about = "Validate pipeline configuration files")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Environment to validate (defaults to PIPELINE_ENV, then APP_ENV, then development)
    #[arg(short, long)]
    environment: Option<String>,

    /// Configuration directory path
    #[arg(short, long, default_value = "config")]
    config_dir: PathBuf,

    #[arg(long, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate one environment (the default)
    Validate,

    /// List environments that have an overlay file
    Environments,

    /// Show settings that differ between two environments
    Compare {
        #[arg(short, long, default_value = "development")]
        base: String,

        #[arg(short, long)]
        target: String,
    },
}

fn main() {
    let cli = Cli::parse();
    init_tracing(&PipelineConfig::default().logging);

    if let Err(e) = run(cli) {
        error!(error = %format!("{e:#}"), "Configuration invalid");
        eprintln!("❌ {e:#}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command.unwrap_or(Commands::Validate) {
        Commands::Validate => {
            let environment = cli
                .environment
                .unwrap_or_else(ConfigManager::detect_environment);
            let config = load(&cli.config_dir, &environment)?;
            match cli.format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
                OutputFormat::Table => print_summary(&environment, &config),
            }
            println!("✅ Configuration valid for {environment}");
        }
        Commands::Environments => {
            for environment in overlay_environments(&cli.config_dir)? {
                println!("{environment}");
            }
        }
        Commands::Compare { base, target } => {
            let base_config = serde_json::to_value(load(&cli.config_dir, &base)?)?;
            let target_config = serde_json::to_value(load(&cli.config_dir, &target)?)?;
            let differences = diff_values("", &base_config, &target_config);
            if differences.is_empty() {
                println!("{base} and {target} are identical");
            }
            for (path, left, right) in differences {
                println!("{path}: {left} -> {right}");
            }
        }
    }
    Ok(())
}

fn load(config_dir: &Path, environment: &str) -> Result<PipelineConfig> {
    info!(environment, config_dir = %config_dir.display(), "Validating configuration");
    let manager =
        ConfigManager::load_from_directory_with_env(Some(config_dir.to_path_buf()), environment)
            .with_context(|| format!("failed to load configuration for {environment}"))?;
    let mut config = manager.config().clone();
    config.database.url = ConfigManager::redact_url(&config.database.url);
    Ok(config)
}

fn overlay_environments(config_dir: &Path) -> Result<Vec<String>> {
    let prefix = format!("{CONFIG_FILE_STEM}.");
    let mut environments: Vec<String> = std::fs::read_dir(config_dir)
        .with_context(|| format!("cannot read {}", config_dir.display()))?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().into_string().ok()?;
            let environment = name.strip_prefix(&prefix)?.strip_suffix(".toml")?;
            Some(environment.to_string())
        })
        .collect();
    environments.sort();
    Ok(environments)
}

fn diff_values(path: &str, left: &Value, right: &Value) -> Vec<(String, Value, Value)> {
    match (left, right) {
        (Value::Object(l), Value::Object(r)) => l
            .iter()
            .flat_map(|(key, lv)| {
                let child = if path.is_empty() {
                    key.clone()
                } else {
                    format!("{path}.{key}")
                };
                diff_values(&child, lv, r.get(key).unwrap_or(&Value::Null))
            })
            .collect(),
        _ if left == right => Vec::new(),
        _ => vec![(path.to_string(), left.clone(), right.clone())],
    }
}

fn print_summary(environment: &str, config: &PipelineConfig) {
    println!("environment:     {environment}");
    println!("database:        {}", config.database.url);
    println!("backend:         {}", config.backend.kind);
    println!(
        "retry:           max {} / base {}ms / cap {}ms / x{}{}",
        config.retry.max_retries,
        config.retry.base_delay_ms,
        config.retry.max_delay_ms,
        config.retry.multiplier,
        if config.retry.fixed { " (fixed)" } else { "" }
    );
    println!(
        "queue:           {} {} (visibility {}s)",
        config.queue.provider, config.queue.prefix, config.queue.visibility_timeout_seconds
    );
    println!(
        "workers:         lanes {:?} x {}",
        config.worker.lanes, config.worker.concurrency_per_lane
    );
}
