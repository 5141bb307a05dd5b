//! # Work Manifest
//!
//! Tracks, per domain logical key, the furthest completed stage of a multi-stage
//! pipeline. Stages come from an ordered list fixed when the manifest is built; the
//! stored stage only moves forward unless the caller forces reprocessing.
//!
//! `advance_to` can run inside the same transaction as a stage's data write (see
//! [`IdempotencyGuard`]), so the manifest and the data never diverge on a crash.

pub mod idempotency;

pub use idempotency::{
    canonical_json, content_hash, IdempotencyGuard, IdempotencyLevel, StageRecord,
    StageTransaction, StageWriteResult,
};

use chrono::Utc;
use sqlx::types::Json;
use sqlx::{SqliteConnection, SqlitePool};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::models::manifest_entry::ManifestEntryRow;
use crate::models::ManifestEntry;
use crate::types::Metrics;

/// Composite domain key, e.g. `{week_ending=2025-12-26, tier=NMS}`.
///
/// Parts are kept sorted so the canonical form does not depend on insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ManifestKey {
    parts: BTreeMap<String, String>,
}

impl ManifestKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl ToString) -> Self {
        self.parts.insert(name.into(), value.to_string());
        self
    }

    pub fn parts(&self) -> &BTreeMap<String, String> {
        &self.parts
    }

    /// `k1=v1|k2=v2`, with backslash, `|` and `=` escaped inside names and values
    /// so distinct keys never share a canonical form.
    pub fn canonical(&self) -> String {
        self.parts
            .iter()
            .map(|(k, v)| format!("{}={}", escape_part(k), escape_part(v)))
            .collect::<Vec<_>>()
            .join("|")
    }
}

fn escape_part(part: &str) -> String {
    let mut escaped = String::with_capacity(part.len());
    for c in part.chars() {
        if matches!(c, '\\' | '|' | '=') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for ManifestKey {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            parts: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.to_string()))
                .collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkManifest {
    pool: SqlitePool,
    domain: String,
    stages: Vec<String>,
}

impl WorkManifest {
    /// Build a manifest for `domain` over `stages`, earliest first.
    pub fn new<S: Into<String>>(
        pool: SqlitePool,
        domain: impl Into<String>,
        stages: impl IntoIterator<Item = S>,
    ) -> PipelineResult<Self> {
        let domain = domain.into();
        let stages: Vec<String> = stages.into_iter().map(Into::into).collect();

        if stages.is_empty() {
            return Err(PipelineError::InvalidState(format!(
                "manifest for {domain} needs at least one stage"
            )));
        }
        for (i, stage) in stages.iter().enumerate() {
            if stages[..i].contains(stage) {
                return Err(PipelineError::InvalidState(format!(
                    "duplicate stage {stage} in manifest for {domain}"
                )));
            }
        }

        Ok(Self {
            pool,
            domain,
            stages,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 1-based position of `stage` in the ordered list.
    pub fn stage_rank(&self, stage: &str) -> PipelineResult<i64> {
        self.stages
            .iter()
            .position(|s| s == stage)
            .map(|i| i as i64 + 1)
            .ok_or_else(|| PipelineError::UnknownStage {
                domain: self.domain.clone(),
                stage: stage.to_string(),
            })
    }

    pub async fn get(&self, key: &ManifestKey) -> PipelineResult<Option<ManifestEntry>> {
        let row = sqlx::query_as::<_, ManifestEntryRow>(
            "SELECT domain, partition_key, partition, stage, stage_rank, metrics, execution_id, updated_at \
             FROM manifest_entries WHERE domain = ?1 AND partition_key = ?2",
        )
        .bind(&self.domain)
        .bind(key.canonical())
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ManifestEntry::from))
    }

    pub async fn current_stage(&self, key: &ManifestKey) -> PipelineResult<Option<String>> {
        Ok(self.get(key).await?.map(|e| e.stage))
    }

    /// True once `key` has completed `stage` or any later one.
    pub async fn is_at_least(&self, key: &ManifestKey, stage: &str) -> PipelineResult<bool> {
        let rank = self.stage_rank(stage)?;
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT stage_rank FROM manifest_entries WHERE domain = ?1 AND partition_key = ?2",
        )
        .bind(&self.domain)
        .bind(key.canonical())
        .fetch_optional(&self.pool)
        .await?;
        Ok(current.is_some_and(|c| c >= rank))
    }

    /// Record `stage` as completed for `key`. Moving backwards or re-recording the
    /// current stage changes nothing. Returns whether the entry changed.
    pub async fn advance_to(
        &self,
        key: &ManifestKey,
        stage: &str,
        metrics: Metrics,
    ) -> PipelineResult<bool> {
        let mut conn = self.pool.acquire().await?;
        self.advance_in(&mut conn, key, stage, &metrics, None, false)
            .await
    }

    /// Reset `key` to `stage` even if it is behind the stored stage, for explicit
    /// reprocessing.
    pub async fn force_to(
        &self,
        key: &ManifestKey,
        stage: &str,
        metrics: Metrics,
    ) -> PipelineResult<bool> {
        let mut conn = self.pool.acquire().await?;
        self.advance_in(&mut conn, key, stage, &metrics, None, true)
            .await
    }

    /// Advance on an existing connection or transaction.
    pub async fn advance_in(
        &self,
        conn: &mut SqliteConnection,
        key: &ManifestKey,
        stage: &str,
        metrics: &Metrics,
        execution_id: Option<Uuid>,
        force: bool,
    ) -> PipelineResult<bool> {
        let rank = self.stage_rank(stage)?;
        let result = sqlx::query(
            "INSERT INTO manifest_entries \
             (domain, partition_key, partition, stage, stage_rank, metrics, execution_id, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (domain, partition_key) DO UPDATE SET \
                 stage = excluded.stage, \
                 stage_rank = excluded.stage_rank, \
                 metrics = excluded.metrics, \
                 execution_id = excluded.execution_id, \
                 updated_at = excluded.updated_at \
             WHERE excluded.stage_rank > manifest_entries.stage_rank OR ?9",
        )
        .bind(&self.domain)
        .bind(key.canonical())
        .bind(Json(key.parts()))
        .bind(stage)
        .bind(rank)
        .bind(Json(metrics))
        .bind(execution_id)
        .bind(Utc::now())
        .bind(force)
        .execute(&mut *conn)
        .await?;

        let advanced = result.rows_affected() > 0;
        debug!(
            domain = %self.domain,
            key = %key,
            stage,
            force,
            advanced,
            "Manifest advance"
        );
        Ok(advanced)
    }

    /// Entries for this domain, most recently updated first.
    pub async fn list(&self, limit: i64) -> PipelineResult<Vec<ManifestEntry>> {
        let rows = sqlx::query_as::<_, ManifestEntryRow>(
            "SELECT domain, partition_key, partition, stage, stage_rank, metrics, execution_id, updated_at \
             FROM manifest_entries WHERE domain = ?1 ORDER BY updated_at DESC LIMIT ?2",
        )
        .bind(&self.domain)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ManifestEntry::from).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const STAGES: [&str; 3] = ["ingested", "normalized", "aggregated"];

    fn key() -> ManifestKey {
        ManifestKey::new()
            .with("week_ending", "2025-12-26")
            .with("tier", "NMS")
    }

    #[test]
    fn test_canonical_key_is_order_independent() {
        let a = ManifestKey::new().with("b", 2).with("a", 1);
        let b: ManifestKey = [("a", 1), ("b", 2)].into_iter().collect();
        assert_eq!(a, b);
        assert_eq!(a.canonical(), "a=1|b=2");
    }

    #[test]
    fn test_separators_in_values_do_not_collide() {
        let embedded = ManifestKey::new().with("a", "1|b=2");
        let split = ManifestKey::new().with("a", "1").with("b", "2");
        assert_ne!(embedded.canonical(), split.canonical());
        assert_eq!(embedded.canonical(), r"a=1\|b\=2");

        let slash = ManifestKey::new().with("a", r"x\").with("b", "y");
        let escaped_bar = ManifestKey::new().with("a", r"x\|b=y");
        assert_ne!(slash.canonical(), escaped_bar.canonical());
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_lookalike_keys_keep_separate_state(pool: SqlitePool) {
        let manifest = WorkManifest::new(pool, "finra_weekly", STAGES).unwrap();
        let embedded = ManifestKey::new().with("a", "1|b=2");
        let split = ManifestKey::new().with("a", "1").with("b", "2");

        manifest
            .advance_to(&embedded, "normalized", Metrics::new())
            .await
            .unwrap();
        assert!(manifest.is_at_least(&embedded, "normalized").await.unwrap());
        assert!(!manifest.is_at_least(&split, "ingested").await.unwrap());
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_advance_then_is_at_least(pool: SqlitePool) {
        let manifest = WorkManifest::new(pool, "finra_weekly", STAGES).unwrap();
        assert!(!manifest.is_at_least(&key(), "ingested").await.unwrap());

        assert!(manifest
            .advance_to(&key(), "normalized", Metrics::new())
            .await
            .unwrap());
        assert!(manifest.is_at_least(&key(), "ingested").await.unwrap());
        assert!(manifest.is_at_least(&key(), "normalized").await.unwrap());
        assert!(!manifest.is_at_least(&key(), "aggregated").await.unwrap());
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_stage_never_regresses_without_force(pool: SqlitePool) {
        let manifest = WorkManifest::new(pool, "finra_weekly", STAGES).unwrap();
        manifest
            .advance_to(&key(), "aggregated", Metrics::new())
            .await
            .unwrap();

        let before = manifest.get(&key()).await.unwrap().unwrap();
        assert!(!manifest
            .advance_to(&key(), "ingested", Metrics::new())
            .await
            .unwrap());
        assert!(!manifest
            .advance_to(&key(), "aggregated", Metrics::new())
            .await
            .unwrap());
        assert_eq!(manifest.get(&key()).await.unwrap().unwrap(), before);

        let mut metrics = Metrics::new();
        metrics.insert("reason".into(), json!("reprocess"));
        assert!(manifest.force_to(&key(), "ingested", metrics).await.unwrap());
        assert_eq!(
            manifest.current_stage(&key()).await.unwrap().as_deref(),
            Some("ingested")
        );
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_unknown_stage_rejected(pool: SqlitePool) {
        let manifest = WorkManifest::new(pool, "finra_weekly", STAGES).unwrap();
        assert!(matches!(
            manifest.advance_to(&key(), "published", Metrics::new()).await,
            Err(PipelineError::UnknownStage { .. })
        ));
        assert!(matches!(
            manifest.is_at_least(&key(), "published").await,
            Err(PipelineError::UnknownStage { .. })
        ));
    }

    #[sqlx::test(migrator = "crate::database::MIGRATOR")]
    async fn test_invalid_stage_lists(pool: SqlitePool) {
        assert!(WorkManifest::new(pool.clone(), "d", Vec::<String>::new()).is_err());
        assert!(WorkManifest::new(pool, "d", ["a", "b", "a"]).is_err());
    }
}
