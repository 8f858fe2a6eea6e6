
use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio_util::sync::CancellationToken;

use skeenode::coordination::Coordinator;
use skeenode::models::{ExecutionStatus, JobStatus};
use skeenode::queue::{Queue, EXECUTOR_GROUP};
use skeenode::store::{ExecutionStore, JobStore};
use test_harness::{allow_predictor, assert_eventually, due_job, stack, test_core, StaticPredictor};

const POP_BLOCK: Duration = Duration::from_millis(100);

#[tokio::test]
async fn test_dispatch_creates_execution_and_advances_next_run() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let job = due_job("hello", "echo hi");
    let t0 = job.next_run_at.unwrap();
    stack.store.create_job(&job).await.unwrap();

    let dispatched = core.poll_and_schedule().await.unwrap();
    assert_eq!(dispatched, 1);

    // Exactly one execution, keyed to the due occurrence.
    let executions = stack.store.list_executions(job.id, 10).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].scheduled_at, t0);
    assert_eq!(executions[0].status, ExecutionStatus::Pending);
    assert_eq!(executions[0].attempt, 1);

    // The queue carries the command snapshot.
    let (_, delivered) = stack
        .queue
        .pop(EXECUTOR_GROUP, "probe", POP_BLOCK)
        .await
        .unwrap()
        .expect("queued execution");
    assert_eq!(delivered.id, executions[0].id);
    assert_eq!(delivered.job_command, "echo hi");

    // next_run_at moved to the minute after dispatch time.
    let reloaded = stack.store.get_job(job.id).await.unwrap();
    let next = reloaded.next_run_at.unwrap();
    assert!(next > Utc::now());
    assert!(next > t0);
}

#[tokio::test]
async fn test_dispatch_skips_paused_jobs() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let mut job = due_job("paused", "true");
    job.status = JobStatus::Paused;
    stack.store.create_job(&job).await.unwrap();

    assert_eq!(core.poll_and_schedule().await.unwrap(), 0);
    assert!(stack.store.list_executions(job.id, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_schedule_leaves_next_run_unchanged() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let mut job = due_job("broken", "true");
    job.schedule = "not a schedule".to_string();
    let due_at = job.next_run_at.unwrap();
    stack.store.create_job(&job).await.unwrap();

    // Dispatch still happens; only the advance is skipped, so the loop
    // never crashes on a data bug.
    assert_eq!(core.poll_and_schedule().await.unwrap(), 1);
    assert_eq!(stack.store.list_executions(job.id, 10).await.unwrap().len(), 1);
    let reloaded = stack.store.get_job(job.id).await.unwrap();
    assert_eq!(reloaded.next_run_at, Some(due_at));
}

#[tokio::test]
async fn test_duplicate_dispatch_is_deduplicated() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let job = due_job("dup", "true");
    let t0 = job.next_run_at.unwrap();
    stack.store.create_job(&job).await.unwrap();

    // Another replica already recorded this occurrence.
    let replica_execution = skeenode::models::Execution::dispatch(&job, t0);
    stack.store.create_execution(&replica_execution).await.unwrap();

    assert_eq!(core.poll_and_schedule().await.unwrap(), 1);

    // No second row; the conflict still advances next_run_at so the job is
    // not re-polled forever.
    assert_eq!(stack.store.list_executions(job.id, 10).await.unwrap().len(), 1);
    let reloaded = stack.store.get_job(job.id).await.unwrap();
    assert!(reloaded.next_run_at.unwrap() > t0);
}

#[tokio::test]
async fn test_predictor_abort_skips_dispatch_but_advances_schedule() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, Arc::new(StaticPredictor(Some("ABORT"))), "sched-1");

    let job = due_job("blocked", "true");
    let t0 = job.next_run_at.unwrap();
    stack.store.create_job(&job).await.unwrap();

    core.poll_and_schedule().await.unwrap();

    // No execution row, no queue message.
    assert!(stack.store.list_executions(job.id, 10).await.unwrap().is_empty());
    assert!(stack
        .queue
        .pop(EXECUTOR_GROUP, "probe", POP_BLOCK)
        .await
        .unwrap()
        .is_none());

    // But the occurrence is consumed.
    let reloaded = stack.store.get_job(job.id).await.unwrap();
    assert!(reloaded.next_run_at.unwrap() > t0);
    assert_eq!(
        stack.metrics.snapshot().dispatches_skipped,
        1,
        "skip must be recorded"
    );
}

#[tokio::test]
async fn test_unreachable_predictor_fails_open() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, Arc::new(StaticPredictor(None)), "sched-1");

    let job = due_job("fail-open", "true");
    stack.store.create_job(&job).await.unwrap();

    core.poll_and_schedule().await.unwrap();

    assert_eq!(stack.store.list_executions(job.id, 10).await.unwrap().len(), 1);
    assert!(stack
        .queue
        .pop(EXECUTOR_GROUP, "probe", POP_BLOCK)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_batch_dispatch_covers_every_due_job() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();
    let core = test_core(&stack, allow_predictor(), "sched-1");

    let mut ids = Vec::new();
    for i in 0..40 {
        let mut job = due_job(&format!("bulk-{i}"), "true");
        job.next_run_at = Some(Utc::now() - ChronoDuration::seconds(120 + i));
        stack.store.create_job(&job).await.unwrap();
        ids.push(job.id);
    }

    assert_eq!(core.poll_and_schedule().await.unwrap(), 40);
    for id in ids {
        assert_eq!(
            stack.store.list_executions(id, 10).await.unwrap().len(),
            1,
            "job {id} missed its dispatch"
        );
    }
}

#[tokio::test]
async fn test_only_the_leader_dispatches() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();

    // Another replica holds the lease.
    let rival = stack
        .coordinator
        .election("skeenode-leader", Duration::from_secs(60));
    rival.campaign("rival-replica").await.unwrap();

    let core = test_core(&stack, allow_predictor(), "follower-replica");
    let election = stack
        .coordinator
        .election("skeenode-leader", Duration::from_secs(60));

    let job = due_job("gated", "true");
    stack.store.create_job(&job).await.unwrap();

    let cancel = CancellationToken::new();
    let run = tokio::spawn(core.clone().run(election, cancel.clone()));

    // Several dispatch intervals pass without a single write.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(stack.store.list_executions(job.id, 10).await.unwrap().is_empty());

    cancel.cancel();
    run.await.unwrap();
}

#[tokio::test]
async fn test_leader_dispatches_through_run_loop() {
    let stack = stack();
    stack.queue.ensure_group(EXECUTOR_GROUP).await.unwrap();

    let core = test_core(&stack, allow_predictor(), "leader-replica");
    let election = stack
        .coordinator
        .election("skeenode-leader", Duration::from_secs(60));
    election.campaign("leader-replica").await.unwrap();

    let job = due_job("ungated", "true");
    stack.store.create_job(&job).await.unwrap();

    let cancel = CancellationToken::new();
    let run = tokio::spawn(core.clone().run(election, cancel.clone()));

    let store = stack.store.clone();
    let job_id = job.id;
    assert_eventually(
        move || {
            let store = store.clone();
            async move { !store.list_executions(job_id, 10).await.unwrap().is_empty() }
        },
        Duration::from_secs(3),
        "leader never dispatched the due job",
    )
    .await;

    cancel.cancel();
    run.await.unwrap();
}
