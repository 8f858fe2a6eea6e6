//! Leader-only scheduler core: the dispatch tick, the reconcile tick, and
//! the retry engine.
//!
//! Leadership is re-verified at the top of every tick; a tick whose check
//! fails is a no-op, never an error. No per-job failure terminates a tick
//! and no per-tick failure terminates the loop.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Datelike, Timelike, Utc};
use rand::Rng;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::coordination::{Coordinator, Election};
use crate::cron::Schedule;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::models::{Execution, Job, RetryPolicy};
use crate::predictor::{FailurePredictor, PredictionFeatures};
use crate::queue::Queue;
use crate::store::{ExecutionStore, JobStore};

/// Scheduler tuning knobs. Tests shrink the intervals; production uses the
/// config-derived defaults.
#[derive(Debug, Clone)]
pub struct CoreOptions {
    /// This replica's election value; ticks run only while the observed
    /// leader equals it.
    pub identity: String,
    pub dispatch_interval: Duration,
    pub reconcile_interval: Duration,
    /// Due jobs fetched per poll; the tick drains in batches of this size.
    pub dispatch_batch: i64,
    /// Concurrent dispatches within one batch.
    pub dispatch_concurrency: usize,
    /// PENDING executions that have sat unclaimed for longer than this are
    /// treated as lost (queue push failed, no live claimer) and failed by
    /// reconcile. Keyed on row age, not `scheduled_at`, so catch-up
    /// dispatches of long-overdue occurrences are left alone.
    pub stale_pending_after: Duration,
    /// Failures fetched per retry pass.
    pub retry_batch: i64,
}

impl CoreOptions {
    pub fn new(identity: impl Into<String>) -> Self {
        let reconcile_interval = Duration::from_secs(30);
        Self {
            identity: identity.into(),
            dispatch_interval: Duration::from_secs(10),
            reconcile_interval,
            dispatch_batch: 500,
            dispatch_concurrency: 20,
            stale_pending_after: 4 * reconcile_interval,
            retry_batch: 20,
        }
    }
}

pub struct Core {
    options: CoreOptions,
    jobs: Arc<dyn JobStore>,
    executions: Arc<dyn ExecutionStore>,
    queue: Arc<dyn Queue>,
    coordinator: Arc<dyn Coordinator>,
    predictor: Arc<dyn FailurePredictor>,
    metrics: Arc<Metrics>,
}

impl Core {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        options: CoreOptions,
        jobs: Arc<dyn JobStore>,
        executions: Arc<dyn ExecutionStore>,
        queue: Arc<dyn Queue>,
        coordinator: Arc<dyn Coordinator>,
        predictor: Arc<dyn FailurePredictor>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            options,
            jobs,
            executions,
            queue,
            coordinator,
            predictor,
            metrics,
        })
    }

    pub fn identity(&self) -> &str {
        &self.options.identity
    }

    /// Main loop: dispatch and reconcile tickers, until cancellation.
    pub async fn run(self: Arc<Self>, election: Arc<dyn Election>, cancel: CancellationToken) {
        let start = tokio::time::Instant::now();
        let mut dispatch = tokio::time::interval_at(
            start + self.options.dispatch_interval,
            self.options.dispatch_interval,
        );
        dispatch.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut reconcile = tokio::time::interval_at(
            start + self.options.reconcile_interval,
            self.options.reconcile_interval,
        );
        reconcile.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Scheduler shutting down");
                    return;
                }
                _ = dispatch.tick() => {
                    self.dispatch_tick(election.as_ref(), &cancel).await;
                }
                _ = reconcile.tick() => {
                    self.reconcile_tick(election.as_ref()).await;
                }
            }
        }
    }

    async fn verify_leadership(&self, election: &dyn Election) -> bool {
        match election.leader().await {
            Ok(Some(leader)) if leader == self.options.identity => true,
            Ok(leader) => {
                tracing::debug!(leader = ?leader, "Not the leader, skipping tick");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error checking leadership, skipping tick");
                false
            }
        }
    }

    async fn dispatch_tick(self: &Arc<Self>, election: &dyn Election, cancel: &CancellationToken) {
        if !self.verify_leadership(election).await {
            return;
        }
        // Drain mode: keep polling until a read comes back empty, bounded
        // by cancellation.
        loop {
            match self.poll_and_schedule().await {
                Ok(0) => break,
                Ok(count) => {
                    tracing::debug!(count, "Dispatched batch, polling again");
                    if cancel.is_cancelled() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Error in schedule loop");
                    break;
                }
            }
        }
    }

    /// Fetch due jobs and dispatch them in parallel under the bounded
    /// worker pool. Returns the number of jobs processed.
    pub async fn poll_and_schedule(self: &Arc<Self>) -> Result<usize> {
        let due = self.jobs.list_due_jobs(self.options.dispatch_batch).await?;
        if due.is_empty() {
            return Ok(0);
        }
        tracing::info!(count = due.len(), "Found jobs due for execution");

        let now = Utc::now();
        let count = due.len();
        let semaphore = Arc::new(Semaphore::new(self.options.dispatch_concurrency));
        let mut tasks = JoinSet::new();
        for job in due {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("dispatch semaphore never closes");
            let core = self.clone();
            tasks.spawn(async move {
                core.dispatch_job(job, now).await;
                drop(permit);
            });
        }
        while tasks.join_next().await.is_some() {}
        Ok(count)
    }

    /// Dispatch one due job: consult the predictor (fail open), record the
    /// execution, push it to the queue, then advance `next_run_at`.
    async fn dispatch_job(&self, job: Job, now: DateTime<Utc>) {
        let features = PredictionFeatures {
            day_of_week: now.weekday().num_days_from_sunday(),
            hour: now.hour(),
            job_type: job.kind.to_string(),
        };
        match self
            .predictor
            .predict_failure(&job.id.to_string(), &features)
            .await
        {
            Ok(prediction) if prediction.is_abort() => {
                tracing::warn!(
                    job = %job.name,
                    confidence = prediction.confidence,
                    "Predictor blocked execution, skipping this occurrence"
                );
                Metrics::incr(&self.metrics.dispatches_skipped);
                self.advance_next_run(&job, now).await;
                return;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Failure prediction unavailable, dispatching anyway");
            }
        }

        // Due jobs always carry next_run_at; it doubles as the dedup key.
        let Some(scheduled_at) = job.next_run_at else {
            tracing::warn!(job_id = %job.id, "Due job without next_run_at, skipping");
            return;
        };

        let execution = Execution::dispatch(&job, scheduled_at);
        match self.executions.create_execution(&execution).await {
            Ok(()) => {
                // The row is the system of record; a failed push leaves a
                // PENDING row for the reconciler's stale sweep.
                match self.queue.push(&execution).await {
                    Ok(()) => {
                        Metrics::incr(&self.metrics.jobs_dispatched);
                        tracing::info!(job = %job.name, exec_id = %execution.id, "Dispatched job");
                    }
                    Err(e) => {
                        tracing::warn!(job_id = %job.id, error = %e, "Failed to push execution");
                    }
                }
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!(
                    job_id = %job.id,
                    scheduled_at = %scheduled_at,
                    "Execution already dispatched by another replica"
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Failed to create execution");
                return;
            }
        }

        self.advance_next_run(&job, now).await;
    }

    async fn advance_next_run(&self, job: &Job, now: DateTime<Utc>) {
        let schedule = match Schedule::parse(&job.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                tracing::warn!(
                    job_id = %job.id,
                    error = %e,
                    "Invalid recurrence expression, leaving next_run_at unchanged"
                );
                return;
            }
        };
        let Some(next_run) = schedule.next_after(now) else {
            tracing::warn!(job_id = %job.id, "Recurrence has no future occurrence");
            return;
        };
        if let Err(e) = self.jobs.update_next_run(job.id, next_run).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to update next run");
        } else {
            tracing::debug!(job = %job.name, next_run = %next_run, "Advanced next run");
        }
    }

    async fn reconcile_tick(&self, election: &dyn Election) {
        if !self.verify_leadership(election).await {
            return;
        }
        if let Err(e) = self.reconcile().await {
            tracing::warn!(error = %e, "Error in reconcile loop");
        }
    }

    /// Reap orphans of dead nodes, fail stale PENDING rows, then run the
    /// retry engine.
    pub async fn reconcile(&self) -> Result<()> {
        let active_nodes = self.coordinator.active_nodes().await?;

        let reaped = self.executions.mark_orphans_as_failed(&active_nodes).await?;
        if reaped > 0 {
            Metrics::add(&self.metrics.orphans_reaped, reaped);
            tracing::warn!(count = reaped, "Reaped orphaned executions from dead nodes");
        }

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.options.stale_pending_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(2));
        let swept = self.executions.mark_stale_pending_as_failed(cutoff).await?;
        if swept > 0 {
            Metrics::add(&self.metrics.stale_pending_failed, swept);
            tracing::warn!(count = swept, "Failed stale pending executions with no claimer");
        }

        if let Err(e) = self.retry_failures().await {
            tracing::warn!(error = %e, "Error retrying failures");
        }
        Ok(())
    }

    /// Schedule bounded, jittered re-attempts for recent failures.
    pub async fn retry_failures(&self) -> Result<()> {
        let window = chrono::Duration::from_std(2 * self.options.reconcile_interval)
            .unwrap_or_else(|_| chrono::Duration::minutes(2));
        let failures = self
            .executions
            .list_recent_failures(Utc::now() - window, self.options.retry_batch)
            .await?;

        for failure in failures {
            let job = match self.jobs.get_job(failure.job_id).await {
                Ok(job) => job,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to load job for retry check");
                    continue;
                }
            };

            // attempt 1 is the original dispatch, so max_retries extra
            // attempts end at attempt max_retries + 1.
            if failure.attempt > job.retry_policy.max_retries {
                continue;
            }

            let delay = backoff_delay(failure.attempt.saturating_sub(1), &job.retry_policy);
            let scheduled_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(5));
            let retry = Execution::attempt(&job, scheduled_at, failure.attempt + 1);

            match self
                .executions
                .create_retry_execution(failure.id, &retry)
                .await
            {
                Ok(()) => {
                    if let Err(e) = self.queue.push(&retry).await {
                        tracing::warn!(exec_id = %retry.id, error = %e, "Failed to push retry");
                    }
                    Metrics::incr(&self.metrics.retries_scheduled);
                    tracing::info!(
                        job = %job.name,
                        attempt = retry.attempt,
                        max_retries = job.retry_policy.max_retries,
                        exec_id = %retry.id,
                        "Scheduled retry"
                    );
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(exec_id = %failure.id, "Failure already retried");
                }
                Err(e) => {
                    tracing::warn!(exec_id = %failure.id, error = %e, "Failed to schedule retry");
                }
            }
        }
        Ok(())
    }
}

/// Exponential backoff with ±20% uniform jitter. `retry_index` is
/// zero-based: index 0 (the first retry) waits about the policy's initial
/// interval, and the delay is capped at its max interval.
pub fn backoff_delay(retry_index: u32, policy: &RetryPolicy) -> Duration {
    let initial = policy.initial().as_secs_f64();
    let max = policy.max().as_secs_f64();
    let backoff = (initial * 2f64.powi(retry_index.min(32) as i32)).min(max);
    let jitter = (rand::thread_rng().gen::<f64>() - 0.5) * 0.4 * backoff;
    Duration::from_secs_f64((backoff + jitter).max(0.0))
}
