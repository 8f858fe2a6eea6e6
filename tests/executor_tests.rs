
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use skeenode::executor::{Executor, ExecutorConfig, ShellRunner};
use skeenode::logstore::{LocalLogStore, LogStore};
use skeenode::models::{Execution, ExecutionStatus, Job};
use skeenode::queue::{Queue, EXECUTOR_GROUP};
use skeenode::store::{ExecutionStore, JobStore};
use test_harness::{due_job, stack, TestStack};

fn test_config(node_id: &str) -> ExecutorConfig {
    ExecutorConfig {
        node_id: node_id.to_string(),
        concurrency: 2,
        heartbeat_interval: Duration::from_millis(50),
        node_ttl: Duration::from_millis(200),
        default_timeout: Duration::from_secs(5),
        idle_backoff: Duration::from_millis(20),
        pop_block: Duration::from_millis(100),
    }
}

async fn executor_with(
    stack: &TestStack,
    config: ExecutorConfig,
    logs: Arc<LocalLogStore>,
) -> Arc<Executor> {
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    Executor::new(
        config,
        stack.coordinator.clone(),
        stack.queue.clone(),
        stack.store.clone(),
        stack.store.clone(),
        logs,
        stack.metrics.clone(),
    )
}

/// Create the job, record the execution, and enqueue it, like a dispatch
/// tick would.
async fn enqueue(stack: &TestStack, job: &Job) -> Execution {
    stack.store.create_job(job).await.unwrap();
    let execution = Execution::dispatch(job, job.next_run_at.unwrap_or_else(Utc::now));
    stack.store.create_execution(&execution).await.unwrap();
    stack.queue.push(&execution).await.unwrap();
    execution
}

#[tokio::test]
async fn test_consume_once_runs_command_to_success() {
    let stack = stack();
    let logs_dir = TempDir::new().unwrap();
    let logs = Arc::new(LocalLogStore::new(logs_dir.path()).await.unwrap());
    let executor = executor_with(&stack, test_config("exec-1"), logs.clone()).await;

    let job = due_job("echoes", "echo hello");
    let execution = enqueue(&stack, &job).await;

    assert!(executor.consume_once(&CancellationToken::new()).await);

    let finished = stack.store.get_execution(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Success);
    assert_eq!(finished.exit_code, 0);
    assert_eq!(finished.node_id.as_deref(), Some("exec-1"));
    assert!(finished.started_at.is_some());
    assert!(finished.completed_at.is_some());

    // Captured output landed in the log store under the returned URI.
    assert!(!finished.output_uri.is_empty());
    let contents = logs.retrieve(&finished.output_uri).await.unwrap();
    let contents = String::from_utf8(contents).unwrap();
    assert!(contents.contains("STDOUT:\nhello"), "unexpected log: {contents}");

    // Entry acknowledged: nothing left to pop.
    assert!(stack
        .queue
        .pop(EXECUTOR_GROUP, "probe", Duration::from_millis(50))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_consume_once_records_nonzero_exit() {
    let stack = stack();
    let logs_dir = TempDir::new().unwrap();
    let logs = Arc::new(LocalLogStore::new(logs_dir.path()).await.unwrap());
    let executor = executor_with(&stack, test_config("exec-1"), logs).await;

    let job = due_job("fails", "echo oops >&2; exit 3");
    let execution = enqueue(&stack, &job).await;

    executor.consume_once(&CancellationToken::new()).await;

    let finished = stack.store.get_execution(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);
    assert_eq!(finished.exit_code, 3);
}

#[tokio::test]
async fn test_consume_once_times_out_long_commands() {
    let stack = stack();
    let logs_dir = TempDir::new().unwrap();
    let logs = Arc::new(LocalLogStore::new(logs_dir.path()).await.unwrap());
    let mut config = test_config("exec-1");
    config.default_timeout = Duration::from_millis(200);
    let executor = executor_with(&stack, config, logs).await;

    let job = due_job("hangs", "sleep 30");
    let execution = enqueue(&stack, &job).await;

    let started = tokio::time::Instant::now();
    executor.consume_once(&CancellationToken::new()).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let finished = stack.store.get_execution(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);
    assert_eq!(finished.exit_code, -1);
}

#[tokio::test]
async fn test_job_constraint_overrides_default_timeout() {
    let stack = stack();
    let logs_dir = TempDir::new().unwrap();
    let logs = Arc::new(LocalLogStore::new(logs_dir.path()).await.unwrap());
    let executor = executor_with(&stack, test_config("exec-1"), logs).await;

    let mut job = due_job("tight-budget", "sleep 30");
    job.constraints.timeout = "200ms".to_string();
    let execution = enqueue(&stack, &job).await;

    let started = tokio::time::Instant::now();
    executor.consume_once(&CancellationToken::new()).await;
    assert!(started.elapsed() < Duration::from_secs(5));

    let finished = stack.store.get_execution(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);
    assert_eq!(finished.exit_code, -1);
}

#[tokio::test]
async fn test_consume_once_handles_unstartable_command() {
    let stack = stack();
    let logs_dir = TempDir::new().unwrap();
    let logs = Arc::new(LocalLogStore::new(logs_dir.path()).await.unwrap());
    let executor = executor_with(&stack, test_config("exec-1"), logs).await;

    let job = due_job("missing-binary", "definitely_not_a_command_9e7b");
    let execution = enqueue(&stack, &job).await;

    executor.consume_once(&CancellationToken::new()).await;

    let finished = stack.store.get_execution(execution.id).await.unwrap();
    assert_eq!(finished.status, ExecutionStatus::Failed);
    // `sh -c` reports a missing command as 127.
    assert_eq!(finished.exit_code, 127);
}

#[tokio::test]
async fn test_consume_once_returns_false_on_empty_queue() {
    let stack = stack();
    let logs_dir = TempDir::new().unwrap();
    let logs = Arc::new(LocalLogStore::new(logs_dir.path()).await.unwrap());
    let executor = executor_with(&stack, test_config("exec-1"), logs).await;

    assert!(!executor.consume_once(&CancellationToken::new()).await);
}

#[tokio::test]
async fn test_run_loop_heartbeats_and_executes() {
    let stack = stack();
    let logs_dir = TempDir::new().unwrap();
    let logs = Arc::new(LocalLogStore::new(logs_dir.path()).await.unwrap());
    let executor = executor_with(&stack, test_config("exec-live"), logs).await;

    let job = due_job("looped", "echo from-loop");
    let execution = enqueue(&stack, &job).await;

    let cancel = CancellationToken::new();
    let run = tokio::spawn(executor.clone().run(cancel.clone()));

    let store = stack.store.clone();
    let execution_id = execution.id;
    test_harness::assert_eventually(
        move || {
            let store = store.clone();
            async move {
                store.get_execution(execution_id).await.unwrap().status
                    == ExecutionStatus::Success
            }
        },
        Duration::from_secs(5),
        "run loop never completed the execution",
    )
    .await;

    use skeenode::coordination::Coordinator;
    let nodes = stack.coordinator.active_nodes().await.unwrap();
    assert!(nodes.contains(&"exec-live".to_string()), "node never registered: {nodes:?}");
    assert!(stack.metrics.snapshot().heartbeats_sent > 0);

    cancel.cancel();
    run.await.unwrap();
}

#[tokio::test]
async fn test_runner_captures_streams_separately() {
    let runner = ShellRunner::new();
    let cancel = CancellationToken::new();
    let outcome = runner
        .run(
            "echo to-stdout; echo to-stderr >&2",
            Duration::from_secs(5),
            &cancel,
        )
        .await;

    assert!(outcome.succeeded());
    assert_eq!(outcome.exit_code, 0);
    assert_eq!(outcome.stdout, "to-stdout\n");
    assert_eq!(outcome.stderr, "to-stderr\n");
}

#[tokio::test]
async fn test_runner_reports_timeout_with_sentinel_exit_code() {
    let runner = ShellRunner::new();
    let cancel = CancellationToken::new();
    let outcome = runner.run("sleep 30", Duration::from_millis(150), &cancel).await;

    assert!(!outcome.succeeded());
    assert!(outcome.timed_out);
    assert_eq!(outcome.exit_code, -1);
}

#[tokio::test]
async fn test_runner_honours_cancellation() {
    let runner = ShellRunner::new();
    let cancel = CancellationToken::new();
    let cancel_for_task = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel_for_task.cancel();
    });

    let started = tokio::time::Instant::now();
    let outcome = runner.run("sleep 30", Duration::from_secs(60), &cancel).await;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(outcome.cancelled);
    assert_eq!(outcome.exit_code, -1);
}
