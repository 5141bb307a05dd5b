//! Queue backend, worker pool, cancellation and backend failure handling.

mod common;

use async_trait::async_trait;
use common::*;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use pipeline_core::backend::Backend;
use pipeline_core::error::{PipelineError, PipelineResult};
use pipeline_core::ledger::ExecutionLedger;
use pipeline_core::models::DeadLetterReason;
use pipeline_core::orchestration::{Dispatcher, RunOutcome};
use pipeline_core::state_machine::{ExecutionEventType, ExecutionStatus};
use pipeline_core::types::Lane;

struct UnreachableBackend;

#[async_trait]
impl Backend for UnreachableBackend {
    fn name(&self) -> &'static str {
        "unreachable"
    }

    async fn submit(&self, _execution_id: Uuid, _lane: &Lane) -> PipelineResult<String> {
        Err(PipelineError::Backend("connection refused".to_string()))
    }

    async fn cancel(&self, _execution_id: Uuid) -> PipelineResult<bool> {
        Ok(false)
    }
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_queue_submit_returns_queued_and_worker_completes(pool: SqlitePool) {
    let core = queue_core(pool, registry_with(vec![]));
    assert_eq!(core.dispatcher().backend_name(), "queue");

    let execution = core.dispatcher().submit(request("succeed")).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::Queued);
    assert!(execution
        .backend_run_id
        .as_deref()
        .is_some_and(|id| id.starts_with("pipeline_queue_normal:")));

    let workers = core.worker_pool().unwrap();
    assert_eq!(
        workers.process_next(&Lane::default()).await.unwrap(),
        Some(RunOutcome::Completed)
    );
    assert_eq!(workers.process_next(&Lane::default()).await.unwrap(), None);

    let done = core.queries().get_execution(execution.execution_id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Completed);
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_lanes_are_separate_queues(pool: SqlitePool) {
    let core = queue_core(pool, registry_with(vec![]));
    let backfill = Lane::from("backfill");

    core.dispatcher()
        .submit(request("succeed").with_lane(backfill.clone()))
        .await
        .unwrap();

    let workers = core.worker_pool().unwrap();
    assert_eq!(workers.process_next(&Lane::default()).await.unwrap(), None);
    assert_eq!(
        workers.process_next(&backfill).await.unwrap(),
        Some(RunOutcome::Completed)
    );
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_queue_retry_is_redelivered_after_delay(pool: SqlitePool) {
    let flaky = FlakyHandler::new(1);
    let core = queue_core(pool, registry_with(vec![("flaky", Arc::new(flaky.clone()))]));
    let execution = core.dispatcher().submit(request("flaky")).await.unwrap();
    let workers = core.worker_pool().unwrap();

    let first = workers.process_next(&Lane::default()).await.unwrap();
    assert!(matches!(first, Some(RunOutcome::RetryScheduled { .. })));

    let requeued = core.queries().get_execution(execution.execution_id).await.unwrap();
    assert_eq!(requeued.status, ExecutionStatus::Queued);
    assert_eq!(requeued.retry_count, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        workers.process_next(&Lane::default()).await.unwrap(),
        Some(RunOutcome::Completed)
    );
    assert_eq!(flaky.calls(), 2);
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_started_pool_drains_every_lane(pool: SqlitePool) {
    let core = queue_core(pool, registry_with(vec![]));
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(core.dispatcher().submit(request("succeed")).await.unwrap().execution_id);
    }

    let mut workers = core.worker_pool().unwrap();
    workers.start();
    assert_eq!(workers.worker_count(), 2);

    for id in ids {
        wait_for_status(&core, id, ExecutionStatus::Completed).await;
    }
    workers.shutdown().await;
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_duplicate_delivery_is_skipped(pool: SqlitePool) {
    let core = queue_core(pool, registry_with(vec![]));
    let execution = core.dispatcher().submit(request("succeed")).await.unwrap();

    let runner = core.runner();
    assert_eq!(
        runner.run_pipeline(execution.execution_id).await.unwrap(),
        RunOutcome::Completed
    );
    assert_eq!(
        runner.run_pipeline(execution.execution_id).await.unwrap(),
        RunOutcome::Skipped
    );

    // The queued message is now stale and is acked without running anything.
    let workers = core.worker_pool().unwrap();
    assert_eq!(
        workers.process_next(&Lane::default()).await.unwrap(),
        Some(RunOutcome::Skipped)
    );
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_redelivery_during_slow_run_keeps_message_for_retry(pool: SqlitePool) {
    let mut config = test_config("queue");
    config.queue.visibility_timeout_seconds = 1;
    let flaky = FlakyHandler::new(1).with_latency(Duration::from_millis(1600));
    let core = core_with(
        pool,
        registry_with(vec![("flaky", Arc::new(flaky.clone()))]),
        config,
    );
    let execution = core
        .dispatcher()
        .submit(request("flaky").with_logical_key(Some("K".to_string())))
        .await
        .unwrap();
    let id = execution.execution_id;

    let owner = core.worker_pool().unwrap();
    let first = tokio::spawn(async move { owner.process_next(&Lane::default()).await });
    wait_for_status(&core, id, ExecutionStatus::Running).await;

    // The lease expires while the first attempt is still running.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    let other = core.worker_pool().unwrap();
    assert_eq!(
        other.process_next(&Lane::default()).await.unwrap(),
        Some(RunOutcome::Skipped)
    );

    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, Some(RunOutcome::RetryScheduled { .. })));
    let requeued = core.queries().get_execution(id).await.unwrap();
    assert_eq!(requeued.status, ExecutionStatus::Queued);
    assert_eq!(requeued.retry_count, 1);

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        other.process_next(&Lane::default()).await.unwrap(),
        Some(RunOutcome::Completed)
    );
    assert_eq!(flaky.calls(), 2);
    assert_eq!(other.process_next(&Lane::default()).await.unwrap(), None);

    core.dispatcher()
        .submit(request("succeed").with_logical_key(Some("K".to_string())))
        .await
        .unwrap();
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_retry_is_resent_when_leased_message_vanished(pool: SqlitePool) {
    let flaky = FlakyHandler::new(1).with_latency(Duration::from_millis(100));
    let core = queue_core(pool, registry_with(vec![("flaky", Arc::new(flaky.clone()))]));
    let execution = core.dispatcher().submit(request("flaky")).await.unwrap();
    let id = execution.execution_id;

    let workers = core.worker_pool().unwrap();
    let run = tokio::spawn(async move { workers.process_next(&Lane::default()).await });
    wait_for_status(&core, id, ExecutionStatus::Running).await;

    // Drop the leased message out from under the run.
    core.queue().unwrap().remove_by_execution(id).await.unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert!(matches!(outcome, Some(RunOutcome::RetryScheduled { .. })));

    tokio::time::sleep(Duration::from_millis(20)).await;
    let workers = core.worker_pool().unwrap();
    assert_eq!(
        workers.process_next(&Lane::default()).await.unwrap(),
        Some(RunOutcome::Completed)
    );
    assert_eq!(flaky.calls(), 2);
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_cancel_before_start_withdraws_message(pool: SqlitePool) {
    let core = queue_core(pool, registry_with(vec![]));
    let execution = core.dispatcher().submit(request("succeed")).await.unwrap();

    let cancelled = core.dispatcher().cancel(execution.execution_id).await.unwrap();
    assert_eq!(cancelled.status, ExecutionStatus::Cancelled);

    let workers = core.worker_pool().unwrap();
    assert_eq!(workers.process_next(&Lane::default()).await.unwrap(), None);

    let err = core.dispatcher().cancel(execution.execution_id).await.unwrap_err();
    assert!(matches!(err, PipelineError::InvalidTransition { .. }));
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_cancel_running_stops_at_next_checkpoint(pool: SqlitePool) {
    let core = queue_core(pool, registry_with(vec![]));
    let execution = core
        .dispatcher()
        .submit(request("checkpointing").with_logical_key(Some("slow".to_string())))
        .await
        .unwrap();
    let id = execution.execution_id;

    let workers = core.worker_pool().unwrap();
    let run = tokio::spawn(async move { workers.process_next(&Lane::default()).await });

    wait_for_status(&core, id, ExecutionStatus::Running).await;
    let cancelling = core.dispatcher().cancel(id).await.unwrap();
    assert_eq!(cancelling.status, ExecutionStatus::Cancelling);

    // Still holds the key until the handler yields.
    let err = core
        .dispatcher()
        .submit(request("succeed").with_logical_key(Some("slow".to_string())))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::ConcurrencyConflict { .. }));

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome, Some(RunOutcome::Cancelled));

    let done = core.queries().get_execution(id).await.unwrap();
    assert_eq!(done.status, ExecutionStatus::Cancelled);
    let events: Vec<_> = core
        .queries()
        .execution_events(id)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&ExecutionEventType::CancelRequested));
    assert_eq!(events.last(), Some(&ExecutionEventType::Cancelled));
    assert_eq!(core.runner().in_flight(), 0);
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_local_cancel_signals_in_process_run(pool: SqlitePool) {
    let core = local_core(pool, registry_with(vec![]));
    let dispatcher = core.dispatcher().clone();
    let submit = tokio::spawn(async move { dispatcher.submit(request("checkpointing")).await });

    let running = loop {
        let active = core
            .queries()
            .list_executions(
                &pipeline_core::models::ExecutionQuery::for_pipeline("checkpointing")
                    .with_status(ExecutionStatus::Running),
            )
            .await
            .unwrap();
        if let Some(execution) = active.into_iter().next() {
            break execution;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    };

    core.dispatcher().cancel(running.execution_id).await.unwrap();
    let finished = submit.await.unwrap().unwrap();
    assert_eq!(finished.execution_id, running.execution_id);
    assert_eq!(finished.status, ExecutionStatus::Cancelled);
}

#[sqlx::test(migrator = "pipeline_core::database::MIGRATOR")]
async fn test_backend_submit_failure_dead_letters_without_charge(pool: SqlitePool) {
    let dispatcher = Dispatcher::new(
        Arc::new(registry_with(vec![])),
        ExecutionLedger::new(pool),
        Arc::new(UnreachableBackend),
    );

    let execution = dispatcher.submit(request("succeed")).await.unwrap();
    assert_eq!(execution.status, ExecutionStatus::DeadLettered);
    assert_eq!(execution.retry_count, 0);
    assert!(execution.error.unwrap().contains("connection refused"));

    let entry = dispatcher
        .dead_letters()
        .get_by_execution(execution.execution_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.reason, DeadLetterReason::BackendSubmitFailed);
}
