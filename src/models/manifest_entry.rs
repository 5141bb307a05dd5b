//! # Manifest Entry Model
//!
//! Furthest completed stage for one domain logical key. Maps to `manifest_entries`,
//! keyed by `(domain, partition_key)` where `partition_key` is the canonical rendering
//! of a [`ManifestKey`](crate::manifest::ManifestKey).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::types::Metrics;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub domain: String,
    pub partition_key: String,
    /// Key parts as supplied by the domain
    pub partition: BTreeMap<String, String>,
    pub stage: String,
    pub stage_rank: i64,
    pub metrics: Metrics,
    /// Execution that last advanced the entry
    pub execution_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
pub(crate) struct ManifestEntryRow {
    pub domain: String,
    pub partition_key: String,
    pub partition: Json<BTreeMap<String, String>>,
    pub stage: String,
    pub stage_rank: i64,
    pub metrics: Json<Metrics>,
    pub execution_id: Option<Uuid>,
    pub updated_at: DateTime<Utc>,
}

impl From<ManifestEntryRow> for ManifestEntry {
    fn from(row: ManifestEntryRow) -> Self {
        ManifestEntry {
            domain: row.domain,
            partition_key: row.partition_key,
            partition: row.partition.0,
            stage: row.stage,
            stage_rank: row.stage_rank,
            metrics: row.metrics.0,
            execution_id: row.execution_id,
            updated_at: row.updated_at,
        }
    }
}
