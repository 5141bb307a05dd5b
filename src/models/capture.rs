//! # Capture Model
//!
//! One ingestion event's snapshot of data for a business key, stamped with the three
//! clocks: business time (the period described), source-system time (the publisher's
//! own update stamp, optional) and platform capture time (when we observed it).
//!
//! `(business_key, capture_id)` is the natural key. Corrections are new captures of the
//! same business key and coexist with the originals.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Capture {
    pub capture_row_id: i64,
    pub business_key: String,
    pub capture_id: String,
    pub business_time: NaiveDate,
    pub source_system_time: Option<DateTime<Utc>>,
    pub platform_capture_time: DateTime<Utc>,
    pub payload: Json<serde_json::Value>,
    /// SHA-256 of the canonical payload JSON
    pub payload_hash: String,
    pub execution_id: Option<Uuid>,
}

impl Capture {
    pub fn payload(&self) -> &serde_json::Value {
        &self.payload.0
    }
}

/// A capture to ingest.
#[derive(Debug, Clone)]
pub struct NewCapture {
    pub business_key: String,
    /// Defaults to a fresh UUID v7 when absent
    pub capture_id: Option<String>,
    pub business_time: NaiveDate,
    pub source_system_time: Option<DateTime<Utc>>,
    /// Defaults to now when absent
    pub platform_capture_time: Option<DateTime<Utc>>,
    pub payload: serde_json::Value,
    pub execution_id: Option<Uuid>,
}

impl NewCapture {
    pub fn new(
        business_key: impl Into<String>,
        business_time: NaiveDate,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            business_key: business_key.into(),
            capture_id: None,
            business_time,
            source_system_time: None,
            platform_capture_time: None,
            payload,
            execution_id: None,
        }
    }

    pub fn with_capture_id(mut self, capture_id: impl Into<String>) -> Self {
        self.capture_id = Some(capture_id.into());
        self
    }

    pub fn with_source_system_time(mut self, at: DateTime<Utc>) -> Self {
        self.source_system_time = Some(at);
        self
    }

    pub fn captured_at(mut self, at: DateTime<Utc>) -> Self {
        self.platform_capture_time = Some(at);
        self
    }

    pub fn with_execution(mut self, execution_id: Uuid) -> Self {
        self.execution_id = Some(execution_id);
        self
    }
}

pub(crate) const CAPTURE_COLUMNS: &str = "capture_row_id, business_key, capture_id, \
    business_time, source_system_time, platform_capture_time, payload, payload_hash, execution_id";
