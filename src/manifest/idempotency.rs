//! # Idempotency Guard
//!
//! Three levels describe how a stage behaves when it runs again:
//!
//! | Level | Name             | Re-run behavior                                      |
//! |-------|------------------|------------------------------------------------------|
//! | 1     | append-only      | always inserts; consumers deduplicate                |
//! | 2     | input-idempotent | identical records (by content hash) insert once      |
//! | 3     | state-idempotent | prior output for key+stage is deleted, then reinserted |
//!
//! Stage data and the manifest advance commit in one transaction.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::types::Json;
use sqlx::{FromRow, Sqlite, SqliteConnection, Transaction};
use std::fmt;
use tracing::{debug, info};
use uuid::Uuid;

use super::{ManifestKey, WorkManifest};
use crate::error::{PipelineError, PipelineResult};
use crate::types::Metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyLevel {
    AppendOnly = 1,
    InputIdempotent = 2,
    StateIdempotent = 3,
}

impl IdempotencyLevel {
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AppendOnly => "append_only",
            Self::InputIdempotent => "input_idempotent",
            Self::StateIdempotent => "state_idempotent",
        }
    }

    /// Safe to run twice under at-least-once delivery without external dedup
    pub const fn is_replay_safe(self) -> bool {
        !matches!(self, Self::AppendOnly)
    }
}

impl fmt::Display for IdempotencyLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<i64> for IdempotencyLevel {
    type Error = PipelineError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::AppendOnly),
            2 => Ok(Self::InputIdempotent),
            3 => Ok(Self::StateIdempotent),
            other => Err(PipelineError::InvalidState(format!(
                "idempotency level {other}"
            ))),
        }
    }
}

/// JSON with object keys sorted at every depth.
pub fn canonical_json(value: &serde_json::Value) -> String {
    fn write(value: &serde_json::Value, out: &mut String) {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                out.push('{');
                for (i, (k, v)) in entries.into_iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&serde_json::Value::String(k.clone()).to_string());
                    out.push(':');
                    write(v, out);
                }
                out.push('}');
            }
            serde_json::Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            scalar => out.push_str(&scalar.to_string()),
        }
    }

    let mut out = String::new();
    write(value, &mut out);
    out
}

/// SHA-256 of the canonical JSON form, lowercase hex.
pub fn content_hash(value: &serde_json::Value) -> String {
    let digest = Sha256::digest(canonical_json(value).as_bytes());
    format!("{digest:x}")
}

/// A stored stage output record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct StageRecord {
    pub record_hash: String,
    pub payload: Json<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StageWriteResult {
    pub inserted: u64,
    /// Records skipped because identical content was already stored
    pub duplicates: u64,
    /// Prior records removed by a state-idempotent rewrite
    pub deleted: u64,
    /// Whether the manifest moved
    pub advanced: bool,
}

#[derive(Debug, Clone)]
pub struct IdempotencyGuard {
    manifest: WorkManifest,
    execution_id: Option<Uuid>,
}

impl IdempotencyGuard {
    pub fn new(manifest: WorkManifest) -> Self {
        Self {
            manifest,
            execution_id: None,
        }
    }

    /// Stamp writes with the execution that produced them.
    pub fn with_execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }

    pub fn manifest(&self) -> &WorkManifest {
        &self.manifest
    }

    /// Skip the stage when it is already done and the caller did not force it.
    pub async fn should_skip(
        &self,
        key: &ManifestKey,
        stage: &str,
        force: bool,
    ) -> PipelineResult<bool> {
        if force {
            return Ok(false);
        }
        let skip = self.manifest.is_at_least(key, stage).await?;
        if skip {
            info!(
                domain = %self.manifest.domain(),
                key = %key,
                stage,
                "Stage already complete, skipping"
            );
        }
        Ok(skip)
    }

    /// Write `records` for `key`/`stage` at `level` and advance the manifest, all in
    /// one transaction.
    pub async fn write_stage(
        &self,
        key: &ManifestKey,
        stage: &str,
        level: IdempotencyLevel,
        records: &[serde_json::Value],
        metrics: Metrics,
        force: bool,
    ) -> PipelineResult<StageWriteResult> {
        let mut stage_tx = self.begin_stage(key, stage, level).await?;
        let mut result = StageWriteResult {
            deleted: stage_tx.deleted,
            ..StageWriteResult::default()
        };

        for record in records {
            if stage_tx.insert_record(record).await? {
                result.inserted += 1;
            } else {
                result.duplicates += 1;
            }
        }

        result.advanced = stage_tx.commit(metrics, force).await?;
        debug!(
            domain = %self.manifest.domain(),
            key = %key,
            stage,
            level = %level,
            inserted = result.inserted,
            duplicates = result.duplicates,
            deleted = result.deleted,
            "Stage written"
        );
        Ok(result)
    }

    /// Open a transaction for a stage write. At level 3 the prior stage records for
    /// the key are deleted first; domain tables are the caller's to clear through
    /// [`StageTransaction::conn`].
    pub async fn begin_stage(
        &self,
        key: &ManifestKey,
        stage: &str,
        level: IdempotencyLevel,
    ) -> PipelineResult<StageTransaction<'_>> {
        self.manifest.stage_rank(stage)?;
        let mut tx = self.manifest.pool().begin().await?;

        // Both branches write first so the transaction takes the write lock up front.
        let deleted = if level == IdempotencyLevel::StateIdempotent {
            sqlx::query(
                "DELETE FROM stage_records WHERE domain = ?1 AND partition_key = ?2 AND stage = ?3",
            )
            .bind(self.manifest.domain())
            .bind(key.canonical())
            .bind(stage)
            .execute(&mut *tx)
            .await?
            .rows_affected()
        } else {
            sqlx::query(
                "UPDATE manifest_entries SET updated_at = updated_at \
                 WHERE domain = ?1 AND partition_key = ?2",
            )
            .bind(self.manifest.domain())
            .bind(key.canonical())
            .execute(&mut *tx)
            .await?;
            0
        };

        Ok(StageTransaction {
            tx,
            guard: self,
            key: key.clone(),
            stage: stage.to_string(),
            level,
            deleted,
        })
    }

    /// Stored records for `key`/`stage`, ordered by content hash.
    pub async fn stage_records(
        &self,
        key: &ManifestKey,
        stage: &str,
    ) -> PipelineResult<Vec<StageRecord>> {
        let records = sqlx::query_as::<_, StageRecord>(
            "SELECT record_hash, payload FROM stage_records \
             WHERE domain = ?1 AND partition_key = ?2 AND stage = ?3 \
             ORDER BY record_hash, record_id",
        )
        .bind(self.manifest.domain())
        .bind(key.canonical())
        .bind(stage)
        .fetch_all(self.manifest.pool())
        .await?;
        Ok(records)
    }
}

/// An open stage write. Dropping it without [`commit`](Self::commit) rolls back both
/// the data and the manifest.
pub struct StageTransaction<'g> {
    tx: Transaction<'static, Sqlite>,
    guard: &'g IdempotencyGuard,
    key: ManifestKey,
    stage: String,
    level: IdempotencyLevel,
    deleted: u64,
}

impl StageTransaction<'_> {
    /// The underlying transaction, for domain tables written alongside the stage.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut *self.tx
    }

    pub fn level(&self) -> IdempotencyLevel {
        self.level
    }

    /// Insert one record at the transaction's level. Returns `false` when a level 2
    /// or 3 record with identical content already exists.
    pub async fn insert_record(&mut self, record: &serde_json::Value) -> PipelineResult<bool> {
        let sql = match self.level {
            IdempotencyLevel::AppendOnly => {
                "INSERT INTO stage_records \
                 (domain, partition_key, stage, idempotency_level, record_hash, payload, execution_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            }
            IdempotencyLevel::InputIdempotent | IdempotencyLevel::StateIdempotent => {
                "INSERT OR IGNORE INTO stage_records \
                 (domain, partition_key, stage, idempotency_level, record_hash, payload, execution_id, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"
            }
        };

        let result = sqlx::query(sql)
            .bind(self.guard.manifest.domain())
            .bind(self.key.canonical())
            .bind(&self.stage)
            .bind(self.level.as_i64())
            .bind(content_hash(record))
            .bind(Json(record))
            .bind(self.guard.execution_id)
            .bind(Utc::now())
            .execute(&mut *self.tx)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Advance the manifest and commit. Returns whether the manifest moved.
    pub async fn commit(mut self, metrics: Metrics, force: bool) -> PipelineResult<bool> {
        let advanced = self
            .guard
            .manifest
            .advance_in(
                &mut *self.tx,
                &self.key,
                &self.stage,
                &metrics,
                self.guard.execution_id,
                force,
            )
            .await?;
        self.tx.commit().await?;
        Ok(advanced)
    }
}
