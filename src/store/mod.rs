//! Durable persistence for jobs, executions, and dependencies.
//!
//! The store is the single writer of truth: every mutation of durable state
//! goes through these traits, and no component caches mutable job state in
//! memory. Transient backend errors propagate unwrapped to the caller; the
//! scheduler and executor loops log and continue. [`SkeeError::NotFound`]
//! and [`SkeeError::Conflict`] are domain values, not fatal errors.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{Dependency, Execution, ExecutionStatus, Job};

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new job. `Conflict` on a duplicate id.
    async fn create_job(&self, job: &Job) -> Result<()>;

    async fn get_job(&self, id: Uuid) -> Result<Job>;

    /// Non-archived jobs ordered by creation time, newest first.
    async fn list_jobs(&self, limit: i64, offset: i64) -> Result<Vec<Job>>;

    /// Replace every mutable field of an existing job.
    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Soft delete: history keeps referencing the job row.
    async fn archive_job(&self, id: Uuid) -> Result<()>;

    /// Jobs with status ACTIVE and `next_run_at <= now`, ordered by
    /// `next_run_at` ascending so late jobs dispatch before newly due ones.
    async fn list_due_jobs(&self, limit: i64) -> Result<Vec<Job>>;

    /// Advance the scheduling cursor; also stamps `last_run_at`.
    async fn update_next_run(&self, id: Uuid, next_run_at: DateTime<Utc>) -> Result<()>;
}

#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Insert a new execution. `Conflict` on a duplicate
    /// `(job_id, scheduled_at)` pair, which deduplicates dispatch replay
    /// across scheduler restarts and split-brain windows.
    async fn create_execution(&self, execution: &Execution) -> Result<()>;

    async fn get_execution(&self, id: Uuid) -> Result<Execution>;

    /// Executions of one job, most recently scheduled first.
    async fn list_executions(&self, job_id: Uuid, limit: i64) -> Result<Vec<Execution>>;

    /// Claim the execution for a node: PENDING → RUNNING with node id and
    /// start time. Idempotent when already RUNNING on the same node, and a
    /// no-op on terminal rows (redelivery never resurrects them).
    async fn update_run_state(
        &self,
        id: Uuid,
        node_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()>;

    /// Record the terminal outcome and stamp `completed_at`. A no-op once
    /// the execution is already terminal.
    async fn update_result(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        exit_code: i32,
        output_uri: &str,
    ) -> Result<()>;

    /// Administrative cancellation: PENDING/RUNNING → CANCELLED.
    /// `Conflict` if the execution is already terminal.
    async fn cancel_execution(&self, id: Uuid) -> Result<()>;

    /// Fail every RUNNING execution whose node is not in `active_node_ids`
    /// (with an empty slice, every RUNNING execution). Sets exit code -1
    /// and `completed_at`. Returns the number of rows reaped.
    async fn mark_orphans_as_failed(&self, active_node_ids: &[String]) -> Result<u64>;

    /// Fail PENDING executions created before `cutoff`, rows whose queue
    /// push was lost and that no executor will ever claim. The predicate is
    /// row age, not `scheduled_at`, so a catch-up dispatch of a long-overdue
    /// occurrence is not mistaken for a stranded row. Returns the number of
    /// rows failed.
    async fn mark_stale_pending_as_failed(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// FAILED executions completed since `since` that have not yet been
    /// retried, most recent first.
    async fn list_recent_failures(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Execution>>;

    /// Atomically mark `source_id` as retried and insert `retry`. `Conflict`
    /// when the source was already retried (or the retry row already
    /// exists), so a reconcile window can never double-schedule a retry.
    async fn create_retry_execution(&self, source_id: Uuid, retry: &Execution) -> Result<()>;
}

#[async_trait]
pub trait DependencyStore: Send + Sync {
    async fn create_dependency(&self, dependency: &Dependency) -> Result<()>;

    /// Relations where the given job is the child.
    async fn list_dependencies(&self, child_job_id: Uuid) -> Result<Vec<Dependency>>;

    async fn delete_dependency(&self, parent_job_id: Uuid, child_job_id: Uuid) -> Result<()>;
}
