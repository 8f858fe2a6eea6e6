
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};

use skeenode::coordination::Coordinator;
use skeenode::models::{Execution, ExecutionStatus};
use skeenode::queue::{Queue, EXECUTOR_GROUP};
use skeenode::store::{ExecutionStore, JobStore};
use test_harness::{
    allow_predictor, assert_eventually, due_job, retrying_job, stack, test_core, test_core_with,
    test_options,
};

#[tokio::test]
async fn test_orphan_of_dead_node_is_reaped() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let job = due_job("orphaned", "sleep 60");
    stack.store.create_job(&job).await.unwrap();

    // A live worker and a dead one, each mid-run.
    stack
        .coordinator
        .register_node("node-alive", Duration::from_secs(60))
        .await
        .unwrap();

    let surviving = Execution::dispatch(&job, job.next_run_at.unwrap());
    stack.store.create_execution(&surviving).await.unwrap();
    stack
        .store
        .update_run_state(surviving.id, "node-alive", Utc::now())
        .await
        .unwrap();

    let orphaned = Execution::dispatch(
        &job,
        job.next_run_at.unwrap() + ChronoDuration::minutes(1),
    );
    stack.store.create_execution(&orphaned).await.unwrap();
    stack
        .store
        .update_run_state(orphaned.id, "node-dead", Utc::now())
        .await
        .unwrap();

    core.reconcile().await.unwrap();

    let reaped = stack.store.get_execution(orphaned.id).await.unwrap();
    assert_eq!(reaped.status, ExecutionStatus::Failed);
    assert_eq!(reaped.exit_code, -1);
    assert!(reaped.completed_at.is_some());

    let untouched = stack.store.get_execution(surviving.id).await.unwrap();
    assert_eq!(untouched.status, ExecutionStatus::Running);
}

#[tokio::test]
async fn test_everything_running_is_reaped_with_zero_live_nodes() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let job = due_job("cluster-down", "true");
    stack.store.create_job(&job).await.unwrap();
    let base = job.next_run_at.unwrap();
    for i in 0..3 {
        let execution = Execution::dispatch(&job, base + ChronoDuration::minutes(i));
        stack.store.create_execution(&execution).await.unwrap();
        stack
            .store
            .update_run_state(execution.id, &format!("node-{i}"), Utc::now())
            .await
            .unwrap();
    }

    core.reconcile().await.unwrap();

    let executions = stack.store.list_executions(job.id, 10).await.unwrap();
    assert!(executions
        .iter()
        .all(|e| e.status == ExecutionStatus::Failed && e.exit_code == -1));
    assert_eq!(stack.metrics.snapshot().orphans_reaped, 3);
}

#[tokio::test]
async fn test_node_ttl_expiry_turns_running_work_into_orphans() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let job = due_job("ttl-orphan", "sleep 60");
    stack.store.create_job(&job).await.unwrap();

    // The node is alive when it claims the execution, then stops beating.
    stack
        .coordinator
        .register_node("node-flaky", Duration::from_millis(100))
        .await
        .unwrap();
    let execution = Execution::dispatch(&job, job.next_run_at.unwrap());
    stack.store.create_execution(&execution).await.unwrap();
    stack
        .store
        .update_run_state(execution.id, "node-flaky", Utc::now())
        .await
        .unwrap();

    // While the presence key lives, the execution survives reconcile.
    core.reconcile().await.unwrap();
    assert_eq!(
        stack.store.get_execution(execution.id).await.unwrap().status,
        ExecutionStatus::Running
    );

    let store = stack.store.clone();
    let core_for_wait = core.clone();
    let execution_id = execution.id;
    assert_eventually(
        move || {
            let store = store.clone();
            let core = core_for_wait.clone();
            async move {
                core.reconcile().await.unwrap();
                store.get_execution(execution_id).await.unwrap().status
                    == ExecutionStatus::Failed
            }
        },
        Duration::from_secs(2),
        "orphan not reaped after node TTL expiry",
    )
    .await;
}

#[tokio::test]
async fn test_stale_pending_row_is_failed_and_then_retried() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let mut options = test_options("sched-1");
    options.stale_pending_after = Duration::from_millis(100);
    let core = test_core_with(&stack, allow_predictor(), options);

    let job = retrying_job("lost-push", "true", 1);
    stack.store.create_job(&job).await.unwrap();

    // A PENDING row whose queue push was lost: no executor will ever see
    // it. Let it sit unclaimed past the stale threshold.
    let lost = Execution::dispatch(&job, job.next_run_at.unwrap());
    stack.store.create_execution(&lost).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    core.reconcile().await.unwrap();

    let failed = stack.store.get_execution(lost.id).await.unwrap();
    assert_eq!(failed.status, ExecutionStatus::Failed);
    assert_eq!(failed.exit_code, -1);

    // The same pass fed it to the retry engine.
    let executions = stack.store.list_executions(job.id, 10).await.unwrap();
    assert!(
        executions.iter().any(|e| e.attempt == 2),
        "stale pending row never produced a retry"
    );
}

#[tokio::test]
async fn test_recent_pending_rows_survive_reconcile() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let job = due_job("in-flight", "true");
    stack.store.create_job(&job).await.unwrap();

    // A fresh dispatch stays PENDING, and so does a catch-up dispatch
    // whose target time is long past: the sweep keys on how long the row
    // has sat unclaimed, not on scheduled_at.
    let fresh = Execution::dispatch(&job, Utc::now());
    stack.store.create_execution(&fresh).await.unwrap();
    let catch_up = Execution::dispatch(&job, Utc::now() - ChronoDuration::hours(3));
    stack.store.create_execution(&catch_up).await.unwrap();

    core.reconcile().await.unwrap();
    assert_eq!(
        stack.store.get_execution(fresh.id).await.unwrap().status,
        ExecutionStatus::Pending
    );
    assert_eq!(
        stack.store.get_execution(catch_up.id).await.unwrap().status,
        ExecutionStatus::Pending
    );
}

#[tokio::test]
async fn test_orphan_reap_feeds_the_retry_engine() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let job = retrying_job("crash-retry", "sleep 60", 2);
    stack.store.create_job(&job).await.unwrap();

    let execution = Execution::dispatch(&job, job.next_run_at.unwrap());
    stack.store.create_execution(&execution).await.unwrap();
    stack
        .store
        .update_run_state(execution.id, "node-crashed", Utc::now())
        .await
        .unwrap();

    // One reconcile reaps the orphan and schedules the replacement attempt.
    core.reconcile().await.unwrap();

    let executions = stack.store.list_executions(job.id, 10).await.unwrap();
    assert_eq!(executions.len(), 2);
    let retry = executions.iter().find(|e| e.attempt == 2).expect("retry row");
    assert_eq!(retry.status, ExecutionStatus::Pending);
}
