//! Captures, idempotent stages, readiness and rolling windows as handlers use them.

mod common;

use chrono::{Datelike, Duration, NaiveDate, TimeZone, Utc};
use common::*;
use serde_json::json;
use sqlx::SqlitePool;

use pipeline_core::capture::CaptureStore;
use pipeline_core::error::PipelineError;
use pipeline_core::manifest::{IdempotencyGuard, ManifestKey, WorkManifest};
use pipeline_core::models::{NewCapture, NewExecution};
use pipeline_core::quality::ReadinessGate;
use pipeline_core::rolling::{RollingWindowEngine, TrendClassifier, TrendDirection};
use pipeline_core::state_machine::{ExecutionEventType, ExecutionStatus};

fn week(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 12, day).unwrap()
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_captures_keep_history_and_answer_as_of(pool: SqlitePool) {
    let store = CaptureStore::new(pool);
    let t1 = Utc.with_ymd_and_hms(2025, 12, 29, 9, 0, 0).unwrap();
    let t2 = t1 + Duration::hours(6);

    let c1 = store
        .ingest(
            NewCapture::new("2025-12-26", week(26), json!({"volume": 100}))
                .with_capture_id("c1")
                .with_source_system_time(t1 - Duration::hours(1))
                .captured_at(t1),
        )
        .await
        .unwrap();
    store
        .ingest(
            NewCapture::new("2025-12-26", week(26), json!({"volume": 120}))
                .with_capture_id("c2")
                .captured_at(t2),
        )
        .await
        .unwrap();

    let history = store.list_captures(Some("2025-12-26"), 10).await.unwrap();
    assert_eq!(history.len(), 2);

    let latest = store.latest("2025-12-26").await.unwrap().unwrap();
    assert_eq!(latest.capture_id, "c2");
    assert_eq!(latest.payload(), &json!({"volume": 120}));

    let then = store
        .as_of("2025-12-26", c1.platform_capture_time)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(then.capture_id, "c1");
    assert_eq!(then.payload(), &json!({"volume": 100}));
    assert_eq!(then.source_system_time, Some(t1 - Duration::hours(1)));

    assert!(store
        .as_of("2025-12-26", t1 - Duration::seconds(1))
        .await
        .unwrap()
        .is_none());

    let err = store
        .ingest(NewCapture::new("2025-12-26", week(26), json!({"volume": 1})).with_capture_id("c1"))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::CaptureConflict { .. }));
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_capture_diff_between_revisions(pool: SqlitePool) {
    let store = CaptureStore::new(pool);
    store
        .ingest(
            NewCapture::new(
                "2025-12-26",
                week(26),
                json!([{"symbol": "AAPL", "volume": 10}, {"symbol": "MSFT", "volume": 5}]),
            )
            .with_capture_id("c1"),
        )
        .await
        .unwrap();
    store
        .ingest(
            NewCapture::new(
                "2025-12-26",
                week(26),
                json!([{"symbol": "AAPL", "volume": 12}, {"symbol": "NVDA", "volume": 7}]),
            )
            .with_capture_id("c2"),
        )
        .await
        .unwrap();

    let diff = store.diff("2025-12-26", "c1", "c2", &["symbol"]).await.unwrap();
    assert_eq!(diff.added, vec![json!({"symbol": "NVDA", "volume": 7})]);
    assert_eq!(diff.removed, vec![json!({"symbol": "MSFT", "volume": 5})]);
    assert_eq!(diff.changed.len(), 1);
    assert_eq!(diff.changed[0].changes[0].field, "volume");
    assert_eq!(diff.unchanged, 0);
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_rolling_window_over_latest_captures(pool: SqlitePool) {
    let store = CaptureStore::new(pool);
    for (day, volume) in [(5, 100.0), (12, 110.0), (26, 150.0)] {
        let key = week(day).to_string();
        store
            .ingest(NewCapture::new(key, week(day), json!({"volume": volume})))
            .await
            .unwrap();
    }

    let engine = RollingWindowEngine::weekly(4).unwrap();
    let window = engine
        .compute_async(
            &week(26),
            |bucket| {
                let store = store.clone();
                async move {
                    let capture = store.latest(&bucket.to_string()).await?;
                    Ok::<_, PipelineError>(capture.and_then(|c| c.payload()["volume"].as_f64()))
                }
            },
            |present| present.iter().map(|(_, v)| v).sum::<f64>(),
        )
        .await
        .unwrap();

    assert_eq!(window.value, 360.0);
    assert_eq!(window.periods_present, 3);
    assert!(!window.is_complete);
    assert_eq!(window.missing, vec![week(19)]);

    let values: Vec<Option<f64>> = engine
        .series(&week(26), |b| match b.day() {
            5 => Some(100.0),
            12 => Some(110.0),
            26 => Some(150.0),
            _ => None,
        })
        .into_iter()
        .map(|(_, v)| v)
        .collect();
    let trend = TrendClassifier::new(1, 3, 5.0).classify(&values);
    assert_eq!(trend.direction, TrendDirection::Up);
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_state_idempotent_pipeline_rerun_converges(pool: SqlitePool) {
    let core = local_core(pool.clone(), registry_with(vec![]));
    let key = ManifestKey::new().with("week_ending", "2025-12-26");
    let guard = IdempotencyGuard::new(WorkManifest::new(pool, STAGE_DOMAIN, STAGES).unwrap());

    let first = core
        .dispatcher()
        .submit(NewExecution::new("stage_writer", week_params("2025-12-26")))
        .await
        .unwrap();
    assert_eq!(first.status, ExecutionStatus::Completed);
    assert_eq!(first.result_metrics.as_ref().unwrap()["inserted"], json!(3));
    let after_first = guard.stage_records(&key, "normalized").await.unwrap();
    assert_eq!(after_first.len(), 3);

    // Without force the manifest short-circuits the stage.
    let skipped = core
        .dispatcher()
        .submit(NewExecution::new("stage_writer", week_params("2025-12-26")))
        .await
        .unwrap();
    assert_eq!(skipped.result_metrics.unwrap()["skipped"], json!(true));

    let mut forced_params = week_params("2025-12-26");
    forced_params.insert("force".to_string(), json!("true"));
    let forced = core
        .dispatcher()
        .submit(NewExecution::new("stage_writer", forced_params))
        .await
        .unwrap();
    assert_eq!(forced.status, ExecutionStatus::Completed);
    assert_eq!(guard.stage_records(&key, "normalized").await.unwrap(), after_first);

    let entries = core.queries().list_manifest(STAGE_DOMAIN, 10).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].stage, "normalized");
    assert_eq!(entries[0].execution_id, Some(forced.execution_id));

    let stage_events: Vec<_> = core
        .queries()
        .execution_events(forced.execution_id)
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type.is_stage_event())
        .map(|e| (e.event_type, e.stage))
        .collect();
    assert_eq!(
        stage_events,
        vec![
            (ExecutionEventType::StageStarted, Some("normalized".to_string())),
            (ExecutionEventType::StageCompleted, Some("normalized".to_string())),
        ]
    );
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_failing_quality_check_blocks_readiness_until_rerun(pool: SqlitePool) {
    let core = local_core(pool.clone(), registry_with(vec![]));
    let gate = ReadinessGate::new(pool);

    assert!(core.queries().get_readiness("2025-12-19").await.unwrap().ready);

    let mut empty = week_params("2025-12-19");
    empty.insert("rows".to_string(), json!(0));
    let bad = core
        .dispatcher()
        .submit(NewExecution::new("stage_writer", empty))
        .await
        .unwrap();
    // A failing check is data, not an execution failure.
    assert_eq!(bad.status, ExecutionStatus::Completed);

    let readiness = core.queries().get_readiness("2025-12-19").await.unwrap();
    assert!(!readiness.ready);
    assert_eq!(readiness.failing_checks, vec!["row_count".to_string()]);
    assert_eq!(readiness.execution_id, Some(bad.execution_id));
    assert!(matches!(
        gate.require_ready("2025-12-19").await.unwrap_err(),
        PipelineError::QualityGateFailure { .. }
    ));

    let mut fixed = week_params("2025-12-19");
    fixed.insert("force".to_string(), json!(true));
    let good = core
        .dispatcher()
        .submit(NewExecution::new("stage_writer", fixed))
        .await
        .unwrap();

    let readiness = gate.require_ready("2025-12-19").await.unwrap();
    assert!(readiness.ready);
    assert_eq!(readiness.execution_id, Some(good.execution_id));
}
