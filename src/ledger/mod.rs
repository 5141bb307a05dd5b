//! # Execution Ledger
//!
//! The `executions` table plus its append-only `execution_events` log. The ledger is
//! the only writer of execution rows: every status change updates the row and appends
//! the matching event inside one transaction, so either both apply or neither does.
//!
//! ## Concurrency guard
//!
//! A partial unique index over `logical_key` among active statuses makes the reserve
//! and the insert a single statement. A second submit for a held key fails on insert
//! and surfaces as [`PipelineError::ConcurrencyConflict`]; there is no read-then-write
//! window.
//!
//! ## Locking
//!
//! Each transition starts with a no-op `UPDATE ... RETURNING` on the target row. That
//! takes SQLite's write lock before the current status is read, which serializes
//! concurrent transitions of the same execution without a separate lock table.

use chrono::Utc;
use serde_json::json;
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::models::dead_letter::{DeadLetterEntry, DeadLetterReason};
use crate::models::execution::{ExecutionRow, EXECUTION_COLUMNS};
use crate::models::execution_event::ExecutionEventRow;
use crate::models::{Execution, ExecutionEvent, ExecutionQuery, NewExecution};
use crate::state_machine::{is_allowed, target_event, ExecutionEventType, ExecutionStatus};
use crate::types::Metrics;

/// Field changes applied alongside a status transition.
#[derive(Debug, Default)]
struct Changes {
    error: Option<String>,
    error_class: Option<ErrorClass>,
    metrics: Option<Metrics>,
    backend: Option<String>,
    charge_retry: bool,
    payload: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct ExecutionLedger {
    pool: SqlitePool,
}

impl ExecutionLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert a `pending` execution and its `created` event in one transaction.
    ///
    /// Fails with `ConcurrencyConflict` when an active execution holds the same
    /// logical key.
    pub async fn create(&self, new: NewExecution) -> PipelineResult<Execution> {
        let mut tx = self.pool.begin().await?;
        let execution = match insert_execution(&mut *tx, &new).await {
            Ok(execution) => execution,
            Err(PipelineError::Database(sqlx::Error::Database(db_err)))
                if db_err.is_unique_violation() =>
            {
                drop(tx);
                return Err(self.conflict_for(new.logical_key).await);
            }
            Err(e) => return Err(e),
        };
        tx.commit().await?;

        info!(
            execution_id = %execution.execution_id,
            pipeline = %execution.pipeline,
            lane = %execution.lane,
            logical_key = ?execution.logical_key,
            "Execution created"
        );
        Ok(execution)
    }

    /// Within an existing transaction. Used by dead-letter retries so that resolving
    /// the entry and creating the new execution commit together.
    pub(crate) async fn create_in(
        &self,
        conn: &mut SqliteConnection,
        new: &NewExecution,
    ) -> PipelineResult<Execution> {
        match insert_execution(conn, new).await {
            Err(PipelineError::Database(sqlx::Error::Database(db_err)))
                if db_err.is_unique_violation() =>
            {
                Err(PipelineError::ConcurrencyConflict {
                    logical_key: new.logical_key.clone().unwrap_or_default(),
                    active_execution_id: None,
                })
            }
            other => other,
        }
    }

    async fn conflict_for(&self, logical_key: Option<String>) -> PipelineError {
        let logical_key = logical_key.unwrap_or_default();
        let active_execution_id = match self.active_for_key(&logical_key).await {
            Ok(active) => active.map(|e| e.execution_id),
            Err(e) => {
                warn!(logical_key = %logical_key, error = %e, "Could not look up key holder");
                None
            }
        };
        warn!(logical_key = %logical_key, active_execution_id = ?active_execution_id, "Logical key conflict");
        PipelineError::ConcurrencyConflict {
            logical_key,
            active_execution_id,
        }
    }

    /// `pending -> queued`, recording which backend accepted the execution.
    pub async fn mark_queued(&self, execution_id: Uuid, backend: &str) -> PipelineResult<Execution> {
        let changes = Changes {
            backend: Some(backend.to_string()),
            payload: json!({ "backend": backend }),
            ..Changes::default()
        };
        self.transition(execution_id, ExecutionStatus::Queued, changes)
            .await
    }

    pub async fn set_backend_run_id(
        &self,
        execution_id: Uuid,
        backend_run_id: &str,
    ) -> PipelineResult<()> {
        let result = sqlx::query(
            "UPDATE executions SET backend_run_id = ?1, updated_at = ?2 WHERE execution_id = ?3",
        )
        .bind(backend_run_id)
        .bind(Utc::now())
        .bind(execution_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PipelineError::ExecutionNotFound(execution_id));
        }
        Ok(())
    }

    /// `queued -> running`. Returns `None`, changing nothing, when the execution is not
    /// `queued`, which is how duplicate deliveries are detected.
    pub async fn start(&self, execution_id: Uuid) -> PipelineResult<Option<Execution>> {
        let mut tx = self.pool.begin().await?;
        let current = lock_execution(&mut *tx, execution_id).await?;
        if current.status != ExecutionStatus::Queued {
            debug!(
                execution_id = %execution_id,
                status = %current.status,
                "Execution not queued, start skipped"
            );
            return Ok(None);
        }

        let payload = json!({ "attempt": current.retry_count + 1 });
        let started = apply(
            &mut *tx,
            current,
            ExecutionStatus::Running,
            Changes {
                payload,
                ..Changes::default()
            },
        )
        .await?;
        tx.commit().await?;
        Ok(Some(started))
    }

    /// `running | cancelling -> completed`.
    pub async fn complete(&self, execution_id: Uuid, metrics: Metrics) -> PipelineResult<Execution> {
        let changes = Changes {
            payload: json!({ "metrics": &metrics }),
            metrics: Some(metrics),
            ..Changes::default()
        };
        let execution = self
            .transition(execution_id, ExecutionStatus::Completed, changes)
            .await?;
        info!(execution_id = %execution_id, pipeline = %execution.pipeline, "Execution completed");
        Ok(execution)
    }

    /// `running -> failed -> queued` atomically, charging one attempt to the retry
    /// budget. The logical key stays held throughout.
    ///
    /// A cancel that landed after the caller read the status wins: a `cancelling`
    /// execution ends `failed` instead, and the returned row is not `queued`.
    pub async fn fail_and_requeue(
        &self,
        execution_id: Uuid,
        error: &str,
        delay: Duration,
    ) -> PipelineResult<Execution> {
        let mut tx = self.pool.begin().await?;
        let current = lock_execution(&mut *tx, execution_id).await?;
        if current.status == ExecutionStatus::Cancelling {
            let failed = apply(
                &mut *tx,
                current,
                ExecutionStatus::Failed,
                failure_changes(error, ErrorClass::Transient, false),
            )
            .await?;
            tx.commit().await?;
            warn!(
                execution_id = %execution_id,
                pipeline = %failed.pipeline,
                error,
                "Retry dropped, cancel was requested"
            );
            return Ok(failed);
        }

        let failed = apply(
            &mut *tx,
            current,
            ExecutionStatus::Failed,
            failure_changes(error, ErrorClass::Transient, true),
        )
        .await?;

        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let requeued = apply(
            &mut *tx,
            failed,
            ExecutionStatus::Queued,
            Changes {
                payload: json!({ "delay_ms": delay_ms }),
                ..Changes::default()
            },
        )
        .await?;
        tx.commit().await?;

        warn!(
            execution_id = %execution_id,
            pipeline = %requeued.pipeline,
            retry_count = requeued.retry_count,
            delay_ms,
            error,
            "Execution failed, retry scheduled"
        );
        Ok(requeued)
    }

    /// `* -> failed -> dead_lettered` plus the dead-letter entry, atomically.
    ///
    /// `charge_retry` counts this failure against the retry budget, which exhausted
    /// transient failures do and fatal errors do not.
    pub async fn fail_and_dead_letter(
        &self,
        execution_id: Uuid,
        error: &str,
        class: ErrorClass,
        reason: DeadLetterReason,
        charge_retry: bool,
    ) -> PipelineResult<(Execution, DeadLetterEntry)> {
        let mut tx = self.pool.begin().await?;
        let current = lock_execution(&mut *tx, execution_id).await?;
        let failed = apply(
            &mut *tx,
            current,
            ExecutionStatus::Failed,
            failure_changes(error, class, charge_retry),
        )
        .await?;

        let entry = DeadLetterEntry {
            dead_letter_id: Uuid::now_v7(),
            execution_id,
            pipeline: failed.pipeline.clone(),
            reason,
            error: Some(error.to_string()),
            retry_count: failed.retry_count,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            resolution_notes: None,
            retry_execution_id: None,
        };

        let dead = apply(
            &mut *tx,
            failed,
            ExecutionStatus::DeadLettered,
            Changes {
                payload: json!({
                    "dead_letter_id": entry.dead_letter_id,
                    "reason": reason.as_str(),
                }),
                ..Changes::default()
            },
        )
        .await?;

        sqlx::query(
            "INSERT INTO dead_letters \
             (dead_letter_id, execution_id, pipeline, reason, error, retry_count, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(entry.dead_letter_id)
        .bind(entry.execution_id)
        .bind(&entry.pipeline)
        .bind(reason.as_str())
        .bind(&entry.error)
        .bind(i64::from(entry.retry_count))
        .bind(entry.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        error!(
            execution_id = %execution_id,
            pipeline = %dead.pipeline,
            reason = %reason,
            retry_count = dead.retry_count,
            error,
            "Execution dead-lettered"
        );
        Ok((dead, entry))
    }

    /// Terminal `failed` with no retry and no dead letter. Only reachable once cancel
    /// was requested and the handler then errored.
    pub async fn fail(
        &self,
        execution_id: Uuid,
        error: &str,
        class: ErrorClass,
    ) -> PipelineResult<Execution> {
        self.transition(
            execution_id,
            ExecutionStatus::Failed,
            failure_changes(error, class, false),
        )
        .await
    }

    /// `running -> cancelling`.
    pub async fn request_cancel(&self, execution_id: Uuid) -> PipelineResult<Execution> {
        self.transition(execution_id, ExecutionStatus::Cancelling, Changes::default())
            .await
    }

    /// `pending | queued | cancelling -> cancelled`.
    pub async fn cancel(&self, execution_id: Uuid, reason: Option<&str>) -> PipelineResult<Execution> {
        let changes = Changes {
            error_class: Some(ErrorClass::Cancelled),
            payload: json!({ "reason": reason }),
            ..Changes::default()
        };
        let execution = self
            .transition(execution_id, ExecutionStatus::Cancelled, changes)
            .await?;
        info!(execution_id = %execution_id, "Execution cancelled");
        Ok(execution)
    }

    /// Append a stage event. Returns `false` when an identical event (same execution,
    /// attempt, type and stage) was already recorded.
    pub async fn record_stage_event(
        &self,
        execution_id: Uuid,
        retry_count: u32,
        event_type: ExecutionEventType,
        stage: &str,
        payload: serde_json::Value,
    ) -> PipelineResult<bool> {
        if !event_type.is_stage_event() {
            return Err(PipelineError::InvalidState(format!(
                "{event_type} is not a stage event"
            )));
        }

        let key = format!("{execution_id}:{event_type}:{stage}:{retry_count}");
        let mut conn = self.pool.acquire().await?;
        insert_event(
            &mut conn,
            execution_id,
            event_type,
            Some(stage),
            None,
            None,
            &payload,
            &key,
        )
        .await
    }

    pub async fn find(&self, execution_id: Uuid) -> PipelineResult<Option<Execution>> {
        let sql = format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1");
        sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(execution_id)
            .fetch_optional(&self.pool)
            .await?
            .map(Execution::try_from)
            .transpose()
    }

    pub async fn get(&self, execution_id: Uuid) -> PipelineResult<Execution> {
        self.find(execution_id)
            .await?
            .ok_or(PipelineError::ExecutionNotFound(execution_id))
    }

    pub async fn status(&self, execution_id: Uuid) -> PipelineResult<ExecutionStatus> {
        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM executions WHERE execution_id = ?1")
                .bind(execution_id)
                .fetch_optional(&self.pool)
                .await?;
        status
            .ok_or(PipelineError::ExecutionNotFound(execution_id))?
            .parse()
            .map_err(PipelineError::InvalidState)
    }

    /// The execution currently holding `logical_key`, if any.
    pub async fn active_for_key(&self, logical_key: &str) -> PipelineResult<Option<Execution>> {
        let sql = format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE logical_key = ?1 AND status IN ('pending', 'queued', 'running', 'cancelling') \
             LIMIT 1"
        );
        sqlx::query_as::<_, ExecutionRow>(&sql)
            .bind(logical_key)
            .fetch_optional(&self.pool)
            .await?
            .map(Execution::try_from)
            .transpose()
    }

    /// Executions matching `query`, newest first.
    pub async fn list(&self, query: &ExecutionQuery) -> PipelineResult<Vec<Execution>> {
        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new(format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE 1 = 1"));

        if let Some(pipeline) = &query.pipeline {
            builder.push(" AND pipeline = ").push_bind(pipeline.clone());
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(logical_key) = &query.logical_key {
            builder.push(" AND logical_key = ").push_bind(logical_key.clone());
        }
        if let Some(lane) = &query.lane {
            builder.push(" AND lane = ").push_bind(lane.as_str().to_string());
        }
        builder
            .push(" ORDER BY created_at DESC, execution_id DESC LIMIT ")
            .push_bind(query.limit)
            .push(" OFFSET ")
            .push_bind(query.offset);

        let rows = builder
            .build_query_as::<ExecutionRow>()
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Execution::try_from).collect()
    }

    /// Events for an execution in append order.
    pub async fn events(&self, execution_id: Uuid) -> PipelineResult<Vec<ExecutionEvent>> {
        let rows = sqlx::query_as::<_, ExecutionEventRow>(
            "SELECT event_id, execution_id, event_type, stage, from_status, to_status, payload, \
                    idempotency_key, created_at \
             FROM execution_events WHERE execution_id = ?1 ORDER BY event_id",
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionEvent::try_from).collect()
    }

    async fn transition(
        &self,
        execution_id: Uuid,
        to: ExecutionStatus,
        changes: Changes,
    ) -> PipelineResult<Execution> {
        let mut tx = self.pool.begin().await?;
        let current = lock_execution(&mut *tx, execution_id).await?;
        let next = apply(&mut *tx, current, to, changes).await?;
        tx.commit().await?;
        Ok(next)
    }
}

fn failure_changes(error: &str, class: ErrorClass, charge_retry: bool) -> Changes {
    Changes {
        error: Some(error.to_string()),
        error_class: Some(class),
        charge_retry,
        payload: json!({ "error": error, "error_class": class.as_str() }),
        ..Changes::default()
    }
}

async fn insert_execution(
    conn: &mut SqliteConnection,
    new: &NewExecution,
) -> PipelineResult<Execution> {
    let now = Utc::now();
    let execution = Execution {
        execution_id: Uuid::now_v7(),
        pipeline: new.pipeline.clone(),
        params: new.params.clone(),
        lane: new.lane.clone(),
        trigger_source: new.trigger_source.clone(),
        logical_key: new.logical_key.clone(),
        status: ExecutionStatus::Pending,
        backend: None,
        backend_run_id: None,
        parent_execution_id: new.parent_execution_id,
        retry_count: 0,
        error: None,
        error_class: None,
        result_metrics: None,
        created_at: now,
        started_at: None,
        completed_at: None,
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO executions \
         (execution_id, pipeline, params, lane, trigger_source, logical_key, status, \
          parent_execution_id, retry_count, created_at, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9)",
    )
    .bind(execution.execution_id)
    .bind(&execution.pipeline)
    .bind(sqlx::types::Json(&execution.params))
    .bind(execution.lane.as_str())
    .bind(execution.trigger_source.as_str())
    .bind(&execution.logical_key)
    .bind(execution.status.as_str())
    .bind(execution.parent_execution_id)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    let payload = json!({
        "pipeline": &execution.pipeline,
        "params": &execution.params,
        "lane": execution.lane.as_str(),
        "trigger_source": execution.trigger_source.as_str(),
        "logical_key": &execution.logical_key,
        "parent_execution_id": execution.parent_execution_id,
    });
    let key = format!("{}:{}:0", execution.execution_id, ExecutionEventType::Created);
    insert_event(
        conn,
        execution.execution_id,
        ExecutionEventType::Created,
        None,
        None,
        Some(ExecutionStatus::Pending),
        &payload,
        &key,
    )
    .await?;

    Ok(execution)
}

/// Take the write lock and read the row in one statement.
async fn lock_execution(conn: &mut SqliteConnection, execution_id: Uuid) -> PipelineResult<Execution> {
    let sql = format!(
        "UPDATE executions SET updated_at = updated_at WHERE execution_id = ?1 \
         RETURNING {EXECUTION_COLUMNS}"
    );
    sqlx::query_as::<_, ExecutionRow>(&sql)
        .bind(execution_id)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or(PipelineError::ExecutionNotFound(execution_id))
        .and_then(Execution::try_from)
}

async fn apply(
    conn: &mut SqliteConnection,
    current: Execution,
    to: ExecutionStatus,
    changes: Changes,
) -> PipelineResult<Execution> {
    let from = current.status;
    if !is_allowed(from, to) {
        return Err(PipelineError::InvalidTransition {
            execution_id: current.execution_id,
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    let now = Utc::now();
    let mut next = current;
    next.status = to;
    next.updated_at = now;
    if changes.charge_retry {
        next.retry_count += 1;
    }
    if changes.error.is_some() {
        next.error = changes.error;
    }
    if changes.error_class.is_some() {
        next.error_class = changes.error_class;
    }
    if changes.metrics.is_some() {
        next.result_metrics = changes.metrics;
    }
    if changes.backend.is_some() {
        next.backend = changes.backend;
    }
    match to {
        ExecutionStatus::Running => next.started_at = Some(now),
        ExecutionStatus::Queued => next.completed_at = None,
        s if s.is_terminal() => next.completed_at = Some(now),
        _ => {}
    }

    sqlx::query(
        "UPDATE executions SET status = ?1, retry_count = ?2, error = ?3, error_class = ?4, \
         result_metrics = ?5, backend = ?6, started_at = ?7, completed_at = ?8, updated_at = ?9 \
         WHERE execution_id = ?10",
    )
    .bind(next.status.as_str())
    .bind(i64::from(next.retry_count))
    .bind(&next.error)
    .bind(next.error_class.map(ErrorClass::as_str))
    .bind(next.result_metrics.as_ref().map(sqlx::types::Json))
    .bind(&next.backend)
    .bind(next.started_at)
    .bind(next.completed_at)
    .bind(next.updated_at)
    .bind(next.execution_id)
    .execute(&mut *conn)
    .await?;

    let event_type = target_event(from, to);
    let mut payload = changes.payload;
    if let Some(obj) = payload.as_object_mut() {
        obj.insert("retry_count".to_string(), json!(next.retry_count));
    } else {
        payload = json!({ "retry_count": next.retry_count });
    }
    // Status events are numbered per execution; the row lock keeps the count stable.
    let seq: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM execution_events WHERE execution_id = ?1 AND stage IS NULL",
    )
    .bind(next.execution_id)
    .fetch_one(&mut *conn)
    .await?;
    let key = format!("{}:{}:{}", next.execution_id, event_type, seq);
    insert_event(
        conn,
        next.execution_id,
        event_type,
        None,
        Some(from),
        Some(to),
        &payload,
        &key,
    )
    .await?;

    debug!(
        execution_id = %next.execution_id,
        from = %from,
        to = %to,
        "Execution transitioned"
    );
    Ok(next)
}

#[allow(clippy::too_many_arguments)]
async fn insert_event(
    conn: &mut SqliteConnection,
    execution_id: Uuid,
    event_type: ExecutionEventType,
    stage: Option<&str>,
    from: Option<ExecutionStatus>,
    to: Option<ExecutionStatus>,
    payload: &serde_json::Value,
    idempotency_key: &str,
) -> PipelineResult<bool> {
    let result = sqlx::query(
        "INSERT INTO execution_events \
         (execution_id, event_type, stage, from_status, to_status, payload, idempotency_key, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
         ON CONFLICT (idempotency_key) DO NOTHING",
    )
    .bind(execution_id)
    .bind(event_type.as_str())
    .bind(stage)
    .bind(from.map(|s| s.as_str()))
    .bind(to.map(|s| s.as_str()))
    .bind(sqlx::types::Json(payload))
    .bind(idempotency_key)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}
