//! Postgres store backend over sqlx.
//!
//! Schema is applied by `skeenode migrate`; the services assume it exists
//! and fail fast otherwise. `RetryPolicy` and `ResourceConstraints` live in
//! JSONB columns and are validated at row-read time.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Result, SkeeError};
use crate::models::{
    Dependency, DependencyKind, Execution, ExecutionStatus, Job, JobKind, JobStatus, RetryPolicy,
    ResourceConstraints,
};

use super::{DependencyStore, ExecutionStore, JobStore};

/// Connect a shared pool for all Postgres-backed components. A failure here
/// is a fatal startup error.
pub async fn connect(config: &Config) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(50)
        .connect(&config.database_url())
        .await?;
    Ok(pool)
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn map_db_err(e: sqlx::Error) -> SkeeError {
    if let sqlx::Error::Database(ref db) = e {
        if db.is_unique_violation() {
            return SkeeError::Conflict;
        }
    }
    SkeeError::Database(e)
}

#[derive(FromRow)]
struct JobRow {
    id: Uuid,
    name: String,
    schedule: String,
    command: String,
    kind: String,
    owner_id: String,
    retry_policy: Json<RetryPolicy>,
    constraints: Json<ResourceConstraints>,
    status: String,
    next_run_at: Option<DateTime<Utc>>,
    last_run_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl JobRow {
    fn into_job(self) -> Result<Job> {
        Ok(Job {
            id: self.id,
            name: self.name,
            schedule: self.schedule,
            command: self.command,
            kind: JobKind::parse(&self.kind)
                .ok_or_else(|| SkeeError::Internal(format!("invalid job kind {:?}", self.kind)))?,
            owner_id: self.owner_id,
            retry_policy: self.retry_policy.0,
            constraints: self.constraints.0,
            status: JobStatus::parse(&self.status).ok_or_else(|| {
                SkeeError::Internal(format!("invalid job status {:?}", self.status))
            })?,
            next_run_at: self.next_run_at,
            last_run_at: self.last_run_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

#[derive(FromRow)]
struct ExecutionRow {
    id: Uuid,
    job_id: Uuid,
    node_id: Option<String>,
    scheduled_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    status: String,
    attempt: i32,
    exit_code: i32,
    output_uri: String,
}

impl ExecutionRow {
    fn into_execution(self) -> Result<Execution> {
        Ok(Execution {
            id: self.id,
            job_id: self.job_id,
            node_id: self.node_id,
            scheduled_at: self.scheduled_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
            status: ExecutionStatus::parse(&self.status).ok_or_else(|| {
                SkeeError::Internal(format!("invalid execution status {:?}", self.status))
            })?,
            attempt: self.attempt.max(0) as u32,
            exit_code: self.exit_code,
            output_uri: self.output_uri,
            job_command: String::new(),
        })
    }
}

const SELECT_JOB: &str = "SELECT id, name, schedule, command, kind, owner_id, retry_policy, \
     constraints, status, next_run_at, last_run_at, created_at, updated_at FROM jobs";

const SELECT_EXECUTION: &str = "SELECT id, job_id, node_id, scheduled_at, started_at, \
     completed_at, status, attempt, exit_code, output_uri FROM executions";

#[async_trait::async_trait]
impl JobStore for PostgresStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        sqlx::query(
            "INSERT INTO jobs (id, name, schedule, command, kind, owner_id, retry_policy, \
             constraints, status, next_run_at, last_run_at, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(&job.command)
        .bind(job.kind.as_str())
        .bind(&job.owner_id)
        .bind(Json(&job.retry_policy))
        .bind(Json(&job.constraints))
        .bind(job.status.as_str())
        .bind(job.next_run_at)
        .bind(job.last_run_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Job> {
        let row: Option<JobRow> = sqlx::query_as(&format!("{SELECT_JOB} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or(SkeeError::NotFound)?.into_job()
    }

    async fn list_jobs(&self, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "{SELECT_JOB} WHERE status <> 'ARCHIVED' ORDER BY created_at DESC \
             LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET name = $2, schedule = $3, command = $4, kind = $5, owner_id = $6, \
             retry_policy = $7, constraints = $8, status = $9, next_run_at = $10, \
             updated_at = now() WHERE id = $1",
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.schedule)
        .bind(&job.command)
        .bind(job.kind.as_str())
        .bind(&job.owner_id)
        .bind(Json(&job.retry_policy))
        .bind(Json(&job.constraints))
        .bind(job.status.as_str())
        .bind(job.next_run_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SkeeError::NotFound);
        }
        Ok(())
    }

    async fn archive_job(&self, id: Uuid) -> Result<()> {
        let result =
            sqlx::query("UPDATE jobs SET status = 'ARCHIVED', updated_at = now() WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(SkeeError::NotFound);
        }
        Ok(())
    }

    async fn list_due_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "{SELECT_JOB} WHERE status = 'ACTIVE' AND next_run_at IS NOT NULL \
             AND next_run_at <= now() ORDER BY next_run_at ASC LIMIT $1"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn update_next_run(&self, id: Uuid, next_run_at: DateTime<Utc>) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET last_run_at = next_run_at, next_run_at = $2, updated_at = now() \
             WHERE id = $1",
        )
        .bind(id)
        .bind(next_run_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SkeeError::NotFound);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ExecutionStore for PostgresStore {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        sqlx::query(
            "INSERT INTO executions (id, job_id, node_id, scheduled_at, started_at, \
             completed_at, status, attempt, exit_code, output_uri, retried) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, FALSE)",
        )
        .bind(execution.id)
        .bind(execution.job_id)
        .bind(&execution.node_id)
        .bind(execution.scheduled_at)
        .bind(execution.started_at)
        .bind(execution.completed_at)
        .bind(execution.status.as_str())
        .bind(execution.attempt as i32)
        .bind(execution.exit_code)
        .bind(&execution.output_uri)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        let row: Option<ExecutionRow> =
            sqlx::query_as(&format!("{SELECT_EXECUTION} WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or(SkeeError::NotFound)?.into_execution()
    }

    async fn list_executions(&self, job_id: Uuid, limit: i64) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "{SELECT_EXECUTION} WHERE job_id = $1 ORDER BY scheduled_at DESC LIMIT $2"
        ))
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn update_run_state(
        &self,
        id: Uuid,
        node_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'RUNNING', node_id = $2, started_at = $3 \
             WHERE id = $1 AND status = 'PENDING'",
        )
        .bind(id)
        .bind(node_id)
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            // Redelivered or already reaped: leave the row as it is, but a
            // missing row is still the caller's NotFound.
            self.get_execution(id).await?;
        }
        Ok(())
    }

    async fn update_result(
        &self,
        id: Uuid,
        status: ExecutionStatus,
        exit_code: i32,
        output_uri: &str,
    ) -> Result<()> {
        if !status.is_terminal() {
            return Err(SkeeError::Internal(format!(
                "update_result with non-terminal status {status}"
            )));
        }
        let result = sqlx::query(
            "UPDATE executions SET status = $2, exit_code = $3, output_uri = $4, \
             completed_at = now() WHERE id = $1 AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(id)
        .bind(status.as_str())
        .bind(exit_code)
        .bind(output_uri)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.get_execution(id).await?;
        }
        Ok(())
    }

    async fn cancel_execution(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'CANCELLED', completed_at = now() \
             WHERE id = $1 AND status IN ('PENDING', 'RUNNING')",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            self.get_execution(id).await?;
            return Err(SkeeError::Conflict);
        }
        Ok(())
    }

    async fn mark_orphans_as_failed(&self, active_node_ids: &[String]) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'FAILED', exit_code = -1, completed_at = now() \
             WHERE status = 'RUNNING' AND (node_id IS NULL OR NOT (node_id = ANY($1)))",
        )
        .bind(active_node_ids.to_vec())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn mark_stale_pending_as_failed(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE executions SET status = 'FAILED', exit_code = -1, completed_at = now() \
             WHERE status = 'PENDING' AND created_at < $1",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_recent_failures(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Execution>> {
        let rows: Vec<ExecutionRow> = sqlx::query_as(&format!(
            "{SELECT_EXECUTION} WHERE status = 'FAILED' AND retried = FALSE \
             AND completed_at >= $1 ORDER BY completed_at DESC LIMIT $2"
        ))
        .bind(since)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ExecutionRow::into_execution).collect()
    }

    async fn create_retry_execution(&self, source_id: Uuid, retry: &Execution) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let marked = sqlx::query(
            "UPDATE executions SET retried = TRUE \
             WHERE id = $1 AND status = 'FAILED' AND retried = FALSE",
        )
        .bind(source_id)
        .execute(&mut *tx)
        .await?;
        if marked.rows_affected() == 0 {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM executions WHERE id = $1")
                .bind(source_id)
                .fetch_optional(&mut *tx)
                .await?;
            return Err(if exists.is_some() {
                SkeeError::Conflict
            } else {
                SkeeError::NotFound
            });
        }

        sqlx::query(
            "INSERT INTO executions (id, job_id, node_id, scheduled_at, started_at, \
             completed_at, status, attempt, exit_code, output_uri, retried) \
             VALUES ($1, $2, NULL, $3, NULL, NULL, $4, $5, 0, '', FALSE)",
        )
        .bind(retry.id)
        .bind(retry.job_id)
        .bind(retry.scheduled_at)
        .bind(retry.status.as_str())
        .bind(retry.attempt as i32)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        tx.commit().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl DependencyStore for PostgresStore {
    async fn create_dependency(&self, dependency: &Dependency) -> Result<()> {
        sqlx::query(
            "INSERT INTO dependencies (parent_job_id, child_job_id, kind, confidence_score, \
             is_auto_detected, created_at) VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(dependency.parent_job_id)
        .bind(dependency.child_job_id)
        .bind(dependency.kind.as_str())
        .bind(dependency.confidence_score)
        .bind(dependency.is_auto_detected)
        .bind(dependency.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn list_dependencies(&self, child_job_id: Uuid) -> Result<Vec<Dependency>> {
        #[derive(FromRow)]
        struct DependencyRow {
            parent_job_id: Uuid,
            child_job_id: Uuid,
            kind: String,
            confidence_score: f64,
            is_auto_detected: bool,
            created_at: DateTime<Utc>,
        }

        let rows: Vec<DependencyRow> = sqlx::query_as(
            "SELECT parent_job_id, child_job_id, kind, confidence_score, is_auto_detected, \
             created_at FROM dependencies WHERE child_job_id = $1",
        )
        .bind(child_job_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Dependency {
                    parent_job_id: row.parent_job_id,
                    child_job_id: row.child_job_id,
                    kind: DependencyKind::parse(&row.kind).ok_or_else(|| {
                        SkeeError::Internal(format!("invalid dependency kind {:?}", row.kind))
                    })?,
                    confidence_score: row.confidence_score,
                    is_auto_detected: row.is_auto_detected,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn delete_dependency(&self, parent_job_id: Uuid, child_job_id: Uuid) -> Result<()> {
        let result = sqlx::query(
            "DELETE FROM dependencies WHERE parent_job_id = $1 AND child_job_id = $2",
        )
        .bind(parent_job_id)
        .bind(child_job_id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(SkeeError::NotFound);
        }
        Ok(())
    }
}
