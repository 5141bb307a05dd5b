//! # Capture Store
//!
//! Point-in-time storage under three clocks:
//!
//! - **business time**: the logical period the data describes
//! - **source-system time**: the publisher's own update stamp, when it has one
//! - **platform capture time**: when this system observed the data
//!
//! Each ingestion is a capture identified by `(business_key, capture_id)`. Captures
//! of the same business key coexist, so a correction never overwrites the original.
//! `latest` picks the greatest platform capture time per business key and `as_of(T)`
//! picks the greatest one not after `T`. Ties on the clock go to the later insert.

pub mod diff;

pub use diff::{CaptureDiff, ChangedRecord, FieldChange};

use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::SqlitePool;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::manifest::content_hash;
use crate::models::capture::CAPTURE_COLUMNS;
use crate::models::{Capture, NewCapture};

#[derive(Debug, Clone)]
pub struct CaptureStore {
    pool: SqlitePool,
}

impl CaptureStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a capture.
    ///
    /// Re-ingesting an existing `(business_key, capture_id)` with the same payload
    /// returns the stored row; a different payload is a `CaptureConflict`.
    pub async fn ingest(&self, capture: NewCapture) -> PipelineResult<Capture> {
        let capture_id = capture
            .capture_id
            .unwrap_or_else(|| Uuid::now_v7().to_string());
        let platform_capture_time = capture.platform_capture_time.unwrap_or_else(Utc::now);
        let payload_hash = content_hash(&capture.payload);

        let sql = format!(
            "INSERT INTO captures \
             (business_key, capture_id, business_time, source_system_time, platform_capture_time, \
              payload, payload_hash, execution_id) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT (business_key, capture_id) DO NOTHING \
             RETURNING {CAPTURE_COLUMNS}"
        );
        let inserted = sqlx::query_as::<_, Capture>(&sql)
            .bind(&capture.business_key)
            .bind(&capture_id)
            .bind(capture.business_time)
            .bind(capture.source_system_time)
            .bind(platform_capture_time)
            .bind(Json(&capture.payload))
            .bind(&payload_hash)
            .bind(capture.execution_id)
            .fetch_optional(&self.pool)
            .await?;

        if let Some(row) = inserted {
            info!(
                business_key = %row.business_key,
                capture_id = %row.capture_id,
                business_time = %row.business_time,
                platform_capture_time = %row.platform_capture_time,
                "Capture ingested"
            );
            return Ok(row);
        }

        let existing = self.get(&capture.business_key, &capture_id).await?;
        if existing.payload_hash == payload_hash {
            debug!(
                business_key = %capture.business_key,
                capture_id = %capture_id,
                "Capture already present with identical payload"
            );
            Ok(existing)
        } else {
            Err(PipelineError::CaptureConflict {
                business_key: capture.business_key,
                capture_id,
            })
        }
    }

    pub async fn get(&self, business_key: &str, capture_id: &str) -> PipelineResult<Capture> {
        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM captures WHERE business_key = ?1 AND capture_id = ?2"
        );
        sqlx::query_as::<_, Capture>(&sql)
            .bind(business_key)
            .bind(capture_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| PipelineError::CaptureNotFound {
                business_key: business_key.to_string(),
                capture_id: capture_id.to_string(),
            })
    }

    /// The most recently observed capture of `business_key`.
    pub async fn latest(&self, business_key: &str) -> PipelineResult<Option<Capture>> {
        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM captures WHERE business_key = ?1 \
             ORDER BY platform_capture_time DESC, capture_row_id DESC LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Capture>(&sql)
            .bind(business_key)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// What `latest` would have returned at `as_of`.
    pub async fn as_of(
        &self,
        business_key: &str,
        as_of: DateTime<Utc>,
    ) -> PipelineResult<Option<Capture>> {
        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM captures \
             WHERE business_key = ?1 AND platform_capture_time <= ?2 \
             ORDER BY platform_capture_time DESC, capture_row_id DESC LIMIT 1"
        );
        Ok(sqlx::query_as::<_, Capture>(&sql)
            .bind(business_key)
            .bind(as_of)
            .fetch_optional(&self.pool)
            .await?)
    }

    /// Latest capture of every business key, ordered by business key.
    pub async fn latest_all(&self) -> PipelineResult<Vec<Capture>> {
        self.latest_per_key(None).await
    }

    /// `as_of` for every business key observed by then.
    pub async fn as_of_all(&self, as_of: DateTime<Utc>) -> PipelineResult<Vec<Capture>> {
        self.latest_per_key(Some(as_of)).await
    }

    async fn latest_per_key(&self, as_of: Option<DateTime<Utc>>) -> PipelineResult<Vec<Capture>> {
        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM ( \
                 SELECT *, ROW_NUMBER() OVER ( \
                     PARTITION BY business_key \
                     ORDER BY platform_capture_time DESC, capture_row_id DESC \
                 ) AS rn \
                 FROM captures \
                 WHERE ?1 IS NULL OR platform_capture_time <= ?1 \
             ) WHERE rn = 1 ORDER BY business_key"
        );
        Ok(sqlx::query_as::<_, Capture>(&sql)
            .bind(as_of)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Captures newest first, optionally for one business key.
    pub async fn list_captures(
        &self,
        business_key: Option<&str>,
        limit: i64,
    ) -> PipelineResult<Vec<Capture>> {
        let sql = format!(
            "SELECT {CAPTURE_COLUMNS} FROM captures \
             WHERE ?1 IS NULL OR business_key = ?1 \
             ORDER BY platform_capture_time DESC, capture_row_id DESC LIMIT ?2"
        );
        Ok(sqlx::query_as::<_, Capture>(&sql)
            .bind(business_key)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?)
    }

    /// Compare two captures of the same business key, matching records on
    /// `key_fields`.
    pub async fn diff(
        &self,
        business_key: &str,
        capture_a: &str,
        capture_b: &str,
        key_fields: &[&str],
    ) -> PipelineResult<CaptureDiff> {
        let a = self.get(business_key, capture_a).await?;
        let b = self.get(business_key, capture_b).await?;
        let records = diff::diff_payloads(a.payload(), b.payload(), key_fields);

        Ok(CaptureDiff {
            business_key: business_key.to_string(),
            capture_a: capture_a.to_string(),
            capture_b: capture_b.to_string(),
            added: records.added,
            removed: records.removed,
            changed: records.changed,
            unchanged: records.unchanged,
            duplicate_keys: records.duplicate_keys,
        })
    }
}
