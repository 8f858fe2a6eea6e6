//! Embedded store backend with the same transition guards as the Postgres
//! one. Backs the test suite and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, SkeeError};
use crate::models::{Dependency, Execution, ExecutionStatus, Job, JobStatus};

use super::{DependencyStore, ExecutionStore, JobStore};

#[derive(Debug, Clone)]
struct StoredExecution {
    execution: Execution,
    retried: bool,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    executions: HashMap<Uuid, StoredExecution>,
    dependencies: Vec<Dependency>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("store mutex poisoned")
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn create_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(SkeeError::Conflict);
        }
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Job> {
        self.lock().jobs.get(&id).cloned().ok_or(SkeeError::NotFound)
    }

    async fn list_jobs(&self, limit: i64, offset: i64) -> Result<Vec<Job>> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| j.status != JobStatus::Archived)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.lock();
        let entry = inner.jobs.get_mut(&job.id).ok_or(SkeeError::NotFound)?;
        let mut updated = job.clone();
        updated.created_at = entry.created_at;
        updated.updated_at = Utc::now();
        *entry = updated;
        Ok(())
    }

    async fn archive_job(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(SkeeError::NotFound)?;
        job.status = JobStatus::Archived;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn list_due_jobs(&self, limit: i64) -> Result<Vec<Job>> {
        let now = Utc::now();
        let inner = self.lock();
        let mut due: Vec<Job> = inner
            .jobs
            .values()
            .filter(|j| {
                j.status == JobStatus::Active
                    && j.next_run_at.map(|t| t <= now).unwrap_or(false)
            })
            .cloned()
            .collect();
        due.sort_by_key(|j| j.next_run_at);
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }

    async fn update_next_run(&self, id: Uuid, next_run_at: DateTime<Utc>) -> Result<()> {
        let mut inner = self.lock();
        let job = inner.jobs.get_mut(&id).ok_or(SkeeError::NotFound)?;
        job.last_run_at = job.next_run_at;
        job.next_run_at = Some(next_run_at);
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl ExecutionStore for MemoryStore {
    async fn create_execution(&self, execution: &Execution) -> Result<()> {
        let mut inner = self.lock();
        if inner.executions.contains_key(&execution.id) {
            return Err(SkeeError::Conflict);
        }
        let duplicate = inner.executions.values().any(|e| {
            e.execution.job_id == execution.job_id
                && e.execution.scheduled_at == execution.scheduled_at
        });
        if duplicate {
            return Err(SkeeError::Conflict);
        }
        inner.executions.insert(
            execution.id,
            StoredExecution {
                execution: execution.clone(),
                retried: false,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Execution> {
        self.lock()
            .executions
            .get(&id)
            .map(|e| e.execution.clone())
            .ok_or(SkeeError::NotFound)
    }

    async fn list_executions(&self, job_id: Uuid, limit: i64) -> Result<Vec<Execution>> {
        let inner = self.lock();
        let mut executions: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| e.execution.job_id == job_id)
            .map(|e| e.execution.clone())
            .collect();
        executions.sort_by(|a, b| b.scheduled_at.cmp(&a.scheduled_at));
        executions.truncate(limit.max(0) as usize);
        Ok(executions)
    }

    async fn update_run_state(
        &self,
        id: Uuid,
        node_id: &str,
        started_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut inner = self.lock();
        let stored = inner.executions.get_mut(&id).ok_or(SkeeError::NotFound)?;
        let execution = &mut stored.execution;
        match execution.status {
            ExecutionStatus::Pending => {
                execution.status = ExecutionStatus::Running;
                execution.node_id = Some(node_id.to_string());
                execution.started_at = Some(started_at);
                Ok(())
            }
            // Redelivery to the claiming node is a no-op; anything else
            // (terminal row, claim by another node) never transitions.
            _ => Ok(()),
        }
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
        let mut inner = self.lock();
        let stored = inner.executions.get_mut(&id).ok_or(SkeeError::NotFound)?;
        if stored.execution.status.is_terminal() {
            return Ok(());
        }
        stored.execution.status = status;
        stored.execution.exit_code = exit_code;
        stored.execution.output_uri = output_uri.to_string();
        stored.execution.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn cancel_execution(&self, id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let stored = inner.executions.get_mut(&id).ok_or(SkeeError::NotFound)?;
        if stored.execution.status.is_terminal() {
            return Err(SkeeError::Conflict);
        }
        stored.execution.status = ExecutionStatus::Cancelled;
        stored.execution.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn mark_orphans_as_failed(&self, active_node_ids: &[String]) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut count = 0;
        for stored in inner.executions.values_mut() {
            let execution = &mut stored.execution;
            if execution.status != ExecutionStatus::Running {
                continue;
            }
            let alive = execution
                .node_id
                .as_ref()
                .map(|n| active_node_ids.contains(n))
                .unwrap_or(false);
            if !alive {
                execution.status = ExecutionStatus::Failed;
                execution.exit_code = -1;
                execution.completed_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn mark_stale_pending_as_failed(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let now = Utc::now();
        let mut inner = self.lock();
        let mut count = 0;
        for stored in inner.executions.values_mut() {
            if stored.execution.status == ExecutionStatus::Pending && stored.created_at < cutoff {
                stored.execution.status = ExecutionStatus::Failed;
                stored.execution.exit_code = -1;
                stored.execution.completed_at = Some(now);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn list_recent_failures(
        &self,
        since: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Execution>> {
        let inner = self.lock();
        let mut failures: Vec<Execution> = inner
            .executions
            .values()
            .filter(|e| {
                e.execution.status == ExecutionStatus::Failed
                    && !e.retried
                    && e.execution.completed_at.map(|t| t >= since).unwrap_or(false)
            })
            .map(|e| e.execution.clone())
            .collect();
        failures.sort_by(|a, b| b.completed_at.cmp(&a.completed_at));
        failures.truncate(limit.max(0) as usize);
        Ok(failures)
    }

    async fn create_retry_execution(&self, source_id: Uuid, retry: &Execution) -> Result<()> {
        let mut inner = self.lock();
        {
            let source = inner.executions.get(&source_id).ok_or(SkeeError::NotFound)?;
            if source.execution.status != ExecutionStatus::Failed || source.retried {
                return Err(SkeeError::Conflict);
            }
        }
        let duplicate = inner.executions.values().any(|e| {
            e.execution.job_id == retry.job_id && e.execution.scheduled_at == retry.scheduled_at
        });
        if duplicate || inner.executions.contains_key(&retry.id) {
            return Err(SkeeError::Conflict);
        }
        inner
            .executions
            .get_mut(&source_id)
            .expect("source checked above")
            .retried = true;
        inner.executions.insert(
            retry.id,
            StoredExecution {
                execution: retry.clone(),
                retried: false,
                created_at: Utc::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl DependencyStore for MemoryStore {
    async fn create_dependency(&self, dependency: &Dependency) -> Result<()> {
        let mut inner = self.lock();
        let exists = inner.dependencies.iter().any(|d| {
            d.parent_job_id == dependency.parent_job_id
                && d.child_job_id == dependency.child_job_id
        });
        if exists {
            return Err(SkeeError::Conflict);
        }
        inner.dependencies.push(dependency.clone());
        Ok(())
    }

    async fn list_dependencies(&self, child_job_id: Uuid) -> Result<Vec<Dependency>> {
        Ok(self
            .lock()
            .dependencies
            .iter()
            .filter(|d| d.child_job_id == child_job_id)
            .cloned()
            .collect())
    }

    async fn delete_dependency(&self, parent_job_id: Uuid, child_job_id: Uuid) -> Result<()> {
        let mut inner = self.lock();
        let before = inner.dependencies.len();
        inner
            .dependencies
            .retain(|d| !(d.parent_job_id == parent_job_id && d.child_job_id == child_job_id));
        if inner.dependencies.len() == before {
            return Err(SkeeError::NotFound);
        }
        Ok(())
    }
}
