//! Value types shared across the dispatcher, ledger and backends.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Pipeline parameters. Ordered so serialized params are stable for hashing and audit.
pub type Params = BTreeMap<String, serde_json::Value>;

/// Result metrics reported by handlers and stages.
pub type Metrics = BTreeMap<String, serde_json::Value>;

/// Named execution priority/queue class.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Lane(String);

impl Lane {
    pub const DEFAULT: &'static str = "normal";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Queue this lane is served from, e.g. `pipeline_queue_normal`.
    pub fn queue_name(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.0)
    }
}

impl Default for Lane {
    fn default() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Lane {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// What caused an execution to be submitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerSource {
    Api,
    Cli,
    Schedule,
    Manual,
    Backfill,
    /// Spawned from a dead letter by an operator retry
    Retry,
}

impl TriggerSource {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Api => "api",
            Self::Cli => "cli",
            Self::Schedule => "schedule",
            Self::Manual => "manual",
            Self::Backfill => "backfill",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TriggerSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(Self::Api),
            "cli" => Ok(Self::Cli),
            "schedule" => Ok(Self::Schedule),
            "manual" => Ok(Self::Manual),
            "backfill" => Ok(Self::Backfill),
            "retry" => Ok(Self::Retry),
            _ => Err(format!("Invalid trigger source: {s}")),
        }
    }
}
