//! Stateless worker node: heartbeat loop plus semaphore-bounded consume
//! loop.
//!
//! Each worker claims executions from the shared consumer group, reports
//! RUNNING and the terminal result to the store, and only then acknowledges
//! the queue entry, so a crash anywhere before the ack leaves either a
//! redeliverable entry or an orphan the reconciler will reap.

pub mod runner;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::coordination::{node_identity, Coordinator};
use crate::logstore::LogStore;
use crate::metrics::Metrics;
use crate::models::ExecutionStatus;
use crate::queue::{Queue, EXECUTOR_GROUP};
use crate::store::{ExecutionStore, JobStore};

pub use runner::{RunOutcome, ShellRunner};

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Presence key and queue consumer name: `{hostname}-{8-hex}`.
    pub node_id: String,
    /// In-flight execution bound; defaults to the detected CPU count.
    pub concurrency: usize,
    pub heartbeat_interval: Duration,
    /// Must be at least twice the heartbeat interval so a single missed
    /// beat does not orphan in-flight work.
    pub node_ttl: Duration,
    /// Per-attempt timeout when the job carries no constraint.
    pub default_timeout: Duration,
    /// Pause after an empty or failed pop to avoid hot-spinning.
    pub idle_backoff: Duration,
    pub pop_block: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            node_id: node_identity(),
            concurrency: cpus,
            heartbeat_interval: Duration::from_secs(5),
            node_ttl: Duration::from_secs(10),
            default_timeout: Duration::from_secs(300),
            idle_backoff: Duration::from_secs(1),
            pop_block: Duration::from_secs(2),
        }
    }
}

pub struct Executor {
    config: ExecutorConfig,
    coordinator: Arc<dyn Coordinator>,
    queue: Arc<dyn Queue>,
    jobs: Arc<dyn JobStore>,
    executions: Arc<dyn ExecutionStore>,
    logs: Arc<dyn LogStore>,
    metrics: Arc<Metrics>,
    runner: ShellRunner,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        coordinator: Arc<dyn Coordinator>,
        queue: Arc<dyn Queue>,
        jobs: Arc<dyn JobStore>,
        executions: Arc<dyn ExecutionStore>,
        logs: Arc<dyn LogStore>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            coordinator,
            queue,
            jobs,
            executions,
            logs,
            metrics,
            runner: ShellRunner::new(),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Run heartbeat and consume loops until cancellation, then drain
    /// in-flight executions.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        tracing::info!(
            node_id = %self.config.node_id,
            concurrency = self.config.concurrency,
            "Executor starting up"
        );

        if let Err(e) = self.queue.ensure_group(EXECUTOR_GROUP).await {
            tracing::warn!(error = %e, "Failed to ensure consumer group");
        }

        let heartbeat = self.clone();
        let heartbeat_cancel = cancel.clone();
        tokio::spawn(async move {
            heartbeat.heartbeat_loop(heartbeat_cancel).await;
        });

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => {
                    let permit = permit.expect("consume semaphore never closes");
                    let worker = self.clone();
                    let worker_cancel = cancel.clone();
                    tokio::spawn(async move {
                        worker.consume_once(&worker_cancel).await;
                        drop(permit);
                    });
                }
            }
        }

        // In-flight executions report their outcome before releasing their
        // permit; wait for all of them.
        tracing::info!(node_id = %self.config.node_id, "Executor draining in-flight jobs");
        let _ = semaphore.acquire_many(self.config.concurrency as u32).await;
        tracing::info!(node_id = %self.config.node_id, "Executor shut down");
    }

    async fn heartbeat_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    match self
                        .coordinator
                        .register_node(&self.config.node_id, self.config.node_ttl)
                        .await
                    {
                        Ok(()) => {
                            Metrics::incr(&self.metrics.heartbeats_sent);
                            tracing::trace!(node_id = %self.config.node_id, "Heartbeat sent");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Heartbeat failed");
                        }
                    }
                }
            }
        }
    }

    /// One pop/run/report/ack round. Returns whether an execution was
    /// processed.
    pub async fn consume_once(&self, cancel: &CancellationToken) -> bool {
        let popped = tokio::select! {
            _ = cancel.cancelled() => return false,
            result = self.queue.pop(EXECUTOR_GROUP, &self.config.node_id, self.config.pop_block) => result,
        };

        let (message_id, execution) = match popped {
            Ok(Some(delivery)) => delivery,
            Ok(None) => {
                self.idle_pause(cancel).await;
                return false;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Error popping job");
                self.idle_pause(cancel).await;
                return false;
            }
        };

        tracing::info!(
            job_id = %execution.job_id,
            exec_id = %execution.id,
            command = %execution.job_command,
            "Received job"
        );

        // Commit point: claim the execution for this node. Best effort; on
        // redelivery the store keeps the original claim.
        if let Err(e) = self
            .executions
            .update_run_state(execution.id, &self.config.node_id, Utc::now())
            .await
        {
            tracing::warn!(exec_id = %execution.id, error = %e, "Failed to report run state");
        }

        let timeout = self.attempt_timeout(execution.job_id).await;
        let outcome = self.runner.run(&execution.job_command, timeout, cancel).await;

        let status = if outcome.succeeded() {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };

        if outcome.timed_out {
            tracing::warn!(exec_id = %execution.id, timeout = ?timeout, "Job timed out");
        } else if let Some(ref start_error) = outcome.start_error {
            tracing::warn!(exec_id = %execution.id, error = %start_error, "Job failed to start");
        }

        let combined = format!("STDOUT:\n{}\nSTDERR:\n{}", outcome.stdout, outcome.stderr);
        let output_uri = match self
            .logs
            .store(&execution.id.to_string(), combined.as_bytes())
            .await
        {
            Ok(uri) => uri,
            Err(e) => {
                tracing::warn!(exec_id = %execution.id, error = %e, "Failed to persist logs");
                String::new()
            }
        };

        if let Err(e) = self
            .executions
            .update_result(execution.id, status, outcome.exit_code, &output_uri)
            .await
        {
            tracing::warn!(exec_id = %execution.id, error = %e, "Failed to report result");
        }

        // Ack strictly after the terminal record, so an unreported crash
        // keeps the entry redeliverable.
        if let Err(e) = self.queue.ack(EXECUTOR_GROUP, &message_id).await {
            tracing::warn!(exec_id = %execution.id, error = %e, "Failed to ack job");
        }

        match status {
            ExecutionStatus::Success => Metrics::incr(&self.metrics.executions_succeeded),
            _ => Metrics::incr(&self.metrics.executions_failed),
        }
        tracing::info!(
            exec_id = %execution.id,
            status = %status,
            exit_code = outcome.exit_code,
            duration = ?outcome.duration,
            "Finished job"
        );
        true
    }

    /// The per-attempt timeout honours the job's constraint when the job is
    /// still readable; a missing job or malformed constraint falls back to
    /// the default.
    async fn attempt_timeout(&self, job_id: uuid::Uuid) -> Duration {
        match self.jobs.get_job(job_id).await {
            Ok(job) => job.constraints.timeout().unwrap_or(self.config.default_timeout),
            Err(_) => self.config.default_timeout,
        }
    }

    async fn idle_pause(&self, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(self.config.idle_backoff) => {}
        }
    }
}
