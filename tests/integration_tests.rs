//! End-to-end flows: scheduler and executor wired over the in-memory
//! backends, driven through their real run loops.


use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use skeenode::coordination::{Coordinator, SCHEDULER_ELECTION};
use skeenode::executor::{Executor, ExecutorConfig};
use skeenode::logstore::LocalLogStore;
use skeenode::models::ExecutionStatus;
use skeenode::queue::{Queue, EXECUTOR_GROUP};
use skeenode::store::{ExecutionStore, JobStore};
use test_harness::{
    allow_predictor, assert_eventually, due_job, retrying_job, stack, test_core, TestStack,
};

async fn spawn_executor(
    stack: &TestStack,
    node_id: &str,
    cancel: &CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let logs_dir = TempDir::new().unwrap();
    let logs = Arc::new(LocalLogStore::new(logs_dir.path()).await.unwrap());
    // Keep the tempdir alive for the whole test process.
    std::mem::forget(logs_dir);

    let executor = Executor::new(
        ExecutorConfig {
            node_id: node_id.to_string(),
            concurrency: 2,
            heartbeat_interval: Duration::from_millis(50),
            node_ttl: Duration::from_millis(200),
            default_timeout: Duration::from_secs(5),
            idle_backoff: Duration::from_millis(20),
            pop_block: Duration::from_millis(100),
        },
        stack.coordinator.clone(),
        stack.queue.clone(),
        stack.store.clone(),
        stack.store.clone(),
        logs,
        stack.metrics.clone(),
    );
    tokio::spawn(executor.run(cancel.clone()))
}

#[tokio::test]
async fn test_basic_dispatch_reaches_success_end_to_end() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();

    let core = test_core(&stack, allow_predictor(), "sched-1");
    let election = stack
        .coordinator
        .election(SCHEDULER_ELECTION, Duration::from_secs(60));
    election.campaign("sched-1").await.unwrap();

    let job = due_job("end-to-end", "echo hi");
    let t0 = job.next_run_at.unwrap();
    stack.store.create_job(&job).await.unwrap();

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(core.clone().run(election, cancel.clone()));
    let executor = spawn_executor(&stack, "exec-1", &cancel).await;

    let store = stack.store.clone();
    let job_id = job.id;
    assert_eventually(
        move || {
            let store = store.clone();
            async move {
                store
                    .list_executions(job_id, 10)
                    .await
                    .unwrap()
                    .iter()
                    .any(|e| e.status == ExecutionStatus::Success && e.exit_code == 0)
            }
        },
        Duration::from_secs(5),
        "execution never reached SUCCESS",
    )
    .await;

    // Exactly one execution for the t0 occurrence, and the job moved on.
    let executions = stack.store.list_executions(job.id, 10).await.unwrap();
    let for_t0: Vec<_> = executions.iter().filter(|e| e.scheduled_at == t0).collect();
    assert_eq!(for_t0.len(), 1);
    assert_eq!(for_t0[0].attempt, 1);
    let reloaded = stack.store.get_job(job.id).await.unwrap();
    assert!(reloaded.next_run_at.unwrap() > t0);

    cancel.cancel();
    scheduler.await.unwrap();
    executor.await.unwrap();
}

#[tokio::test]
async fn test_failed_command_retries_until_policy_exhausted() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();

    let core = test_core(&stack, allow_predictor(), "sched-1");
    let election = stack
        .coordinator
        .election(SCHEDULER_ELECTION, Duration::from_secs(60));
    election.campaign("sched-1").await.unwrap();

    let mut job = retrying_job("retry-loop", "exit 1", 2);
    job.retry_policy.initial_interval = "100ms".to_string();
    job.retry_policy.max_interval = "1s".to_string();
    stack.store.create_job(&job).await.unwrap();

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(core.clone().run(election, cancel.clone()));
    let executor = spawn_executor(&stack, "exec-1", &cancel).await;

    // All three attempts fail with the command's exit code.
    let store = stack.store.clone();
    let job_id = job.id;
    assert_eventually(
        move || {
            let store = store.clone();
            async move {
                let executions = store.list_executions(job_id, 10).await.unwrap();
                executions
                    .iter()
                    .filter(|e| e.status == ExecutionStatus::Failed && e.exit_code == 1)
                    .count()
                    == 3
            }
        },
        Duration::from_secs(10),
        "retry chain never reached three failed attempts",
    )
    .await;

    // Give the reconciler a few more passes: no fourth attempt may appear.
    tokio::time::sleep(Duration::from_millis(400)).await;
    let executions = stack.store.list_executions(job.id, 10).await.unwrap();
    let mut attempts: Vec<u32> = executions.iter().map(|e| e.attempt).collect();
    attempts.sort_unstable();
    assert_eq!(attempts, vec![1, 2, 3]);

    cancel.cancel();
    scheduler.await.unwrap();
    executor.await.unwrap();
}

#[tokio::test]
async fn test_killed_executor_work_is_reaped_and_retried() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();

    let core = test_core(&stack, allow_predictor(), "sched-1");
    let election = stack
        .coordinator
        .election(SCHEDULER_ELECTION, Duration::from_secs(60));
    election.campaign("sched-1").await.unwrap();

    // Simulate an executor that claimed work and then died: RUNNING row,
    // no presence key.
    let job = retrying_job("crashed", "sleep 60", 1);
    stack.store.create_job(&job).await.unwrap();
    let execution = skeenode::models::Execution::dispatch(&job, job.next_run_at.unwrap());
    stack.store.create_execution(&execution).await.unwrap();
    stack
        .store
        .update_run_state(execution.id, "exec-dead", Utc::now())
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let scheduler = tokio::spawn(core.clone().run(election, cancel.clone()));

    let store = stack.store.clone();
    let execution_id = execution.id;
    assert_eventually(
        move || {
            let store = store.clone();
            async move {
                let reaped = store.get_execution(execution_id).await.unwrap();
                reaped.status == ExecutionStatus::Failed && reaped.exit_code == -1
            }
        },
        Duration::from_secs(5),
        "orphaned execution never reaped",
    )
    .await;

    // The reconcile loop also schedules the replacement attempt.
    let store = stack.store.clone();
    let job_id = job.id;
    assert_eventually(
        move || {
            let store = store.clone();
            async move {
                store
                    .list_executions(job_id, 10)
                    .await
                    .unwrap()
                    .iter()
                    .any(|e| e.attempt == 2)
            }
        },
        Duration::from_secs(5),
        "reaped execution never retried",
    )
    .await;

    cancel.cancel();
    scheduler.await.unwrap();
}

#[tokio::test]
async fn test_scheduler_failover_deduplicates_dispatch() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();

    let ttl = Duration::from_millis(200);

    // Replica A wins, dispatches, then crashes without resigning.
    let core_a = test_core(&stack, allow_predictor(), "sched-a");
    let election_a = stack.coordinator.election(SCHEDULER_ELECTION, ttl);
    election_a.campaign("sched-a").await.unwrap();

    let job = due_job("failover", "true");
    let t0 = job.next_run_at.unwrap();
    stack.store.create_job(&job).await.unwrap();

    let cancel_a = CancellationToken::new();
    let run_a = tokio::spawn(core_a.clone().run(election_a.clone(), cancel_a.clone()));

    let store = stack.store.clone();
    let job_id = job.id;
    assert_eventually(
        move || {
            let store = store.clone();
            async move { !store.list_executions(job_id, 10).await.unwrap().is_empty() }
        },
        Duration::from_secs(3),
        "first leader never dispatched",
    )
    .await;

    // Crash A: cancel its loop and drop the election so the lease decays.
    cancel_a.cancel();
    run_a.await.unwrap();
    drop(election_a);

    // Rewind the job as if the t0 occurrence were still due, as a restarted
    // leader would observe after a partial tick.
    stack.store.update_next_run(job.id, t0).await.unwrap();

    // Replica B takes over within about one TTL and replays the dispatch.
    let core_b = test_core(&stack, allow_predictor(), "sched-b");
    let election_b = stack.coordinator.election(SCHEDULER_ELECTION, ttl);
    election_b.campaign("sched-b").await.unwrap();

    let cancel_b = CancellationToken::new();
    let run_b = tokio::spawn(core_b.clone().run(election_b, cancel_b.clone()));

    let store = stack.store.clone();
    assert_eventually(
        move || {
            let store = store.clone();
            async move {
                // B processed the due job again: next_run_at advanced...
                store.get_job(job_id).await.unwrap().next_run_at.unwrap() > t0
            }
        },
        Duration::from_secs(3),
        "second leader never processed the job",
    )
    .await;

    // ...but the t0 occurrence was deduplicated by (job_id, scheduled_at).
    let executions = stack.store.list_executions(job.id, 10).await.unwrap();
    let for_t0 = executions.iter().filter(|e| e.scheduled_at == t0).count();
    assert_eq!(for_t0, 1, "duplicate dispatch observed after failover");

    cancel_b.cancel();
    run_b.await.unwrap();
}
