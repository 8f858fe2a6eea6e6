use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::parse_duration;

/// Execution environment of a job. Only SHELL jobs are runnable by the
/// built-in runner; the other kinds are accepted and dispatched for
/// external runners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobKind {
    Shell,
    Docker,
    Http,
    Kubernetes,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Shell => "SHELL",
            JobKind::Docker => "DOCKER",
            JobKind::Http => "HTTP",
            JobKind::Kubernetes => "KUBERNETES",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SHELL" => Some(JobKind::Shell),
            "DOCKER" => Some(JobKind::Docker),
            "HTTP" => Some(JobKind::Http),
            "KUBERNETES" => Some(JobKind::Kubernetes),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Active,
    Paused,
    Archived,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Active => "ACTIVE",
            JobStatus::Paused => "PAUSED",
            JobStatus::Archived => "ARCHIVED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(JobStatus::Active),
            "PAUSED" => Some(JobStatus::Paused),
            "ARCHIVED" => Some(JobStatus::Archived),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bounded re-attempt policy for failed executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff_strategy: String,
    pub initial_interval: String,
    pub max_interval: String,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_strategy: "exponential".to_string(),
            initial_interval: "5s".to_string(),
            max_interval: "5m".to_string(),
        }
    }
}

impl RetryPolicy {
    /// Parsed initial interval; falls back to 5s on a malformed policy.
    pub fn initial(&self) -> Duration {
        parse_duration(&self.initial_interval).unwrap_or(Duration::from_secs(5))
    }

    /// Parsed interval cap; falls back to 5m on a malformed policy.
    pub fn max(&self) -> Duration {
        parse_duration(&self.max_interval).unwrap_or(Duration::from_secs(300))
    }
}

/// Advisory resource hints for a job. Only `timeout` is enforced by the
/// shell runner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResourceConstraints {
    #[serde(default)]
    pub cpu: String,
    #[serde(default)]
    pub memory: String,
    #[serde(default)]
    pub timeout: String,
}

impl ResourceConstraints {
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout.is_empty() {
            return None;
        }
        parse_duration(&self.timeout).ok()
    }
}

/// A recurring unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub name: String,
    pub schedule: String,
    pub command: String,
    pub kind: JobKind,
    pub owner_id: String,
    pub retry_policy: RetryPolicy,
    pub constraints: ResourceConstraints,
    pub status: JobStatus,
    pub next_run_at: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(name: impl Into<String>, schedule: impl Into<String>, command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            schedule: schedule.into(),
            command: command.into(),
            kind: JobKind::Shell,
            owner_id: String::new(),
            retry_policy: RetryPolicy::default(),
            constraints: ResourceConstraints::default(),
            status: JobStatus::Active,
            next_run_at: None,
            last_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "PENDING",
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Success => "SUCCESS",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(ExecutionStatus::Pending),
            "RUNNING" => Some(ExecutionStatus::Running),
            "SUCCESS" => Some(ExecutionStatus::Success),
            "FAILED" => Some(ExecutionStatus::Failed),
            "CANCELLED" => Some(ExecutionStatus::Cancelled),
            _ => None,
        }
    }

    /// Terminal states are immutable; a retry is always a new execution.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Success | ExecutionStatus::Failed | ExecutionStatus::Cancelled
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single scheduled attempt of a job.
///
/// `job_command` is a dispatch-time snapshot carried on the queue wire so
/// mid-run edits to the job never mutate in-flight runs; it is not read back
/// from storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub job_id: Uuid,
    pub node_id: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: ExecutionStatus,
    pub attempt: u32,
    pub exit_code: i32,
    #[serde(default)]
    pub output_uri: String,
    #[serde(rename = "command", default)]
    pub job_command: String,
}

impl Execution {
    /// First attempt of a scheduled invocation.
    pub fn dispatch(job: &Job, scheduled_at: DateTime<Utc>) -> Self {
        Self::attempt(job, scheduled_at, 1)
    }

    pub fn attempt(job: &Job, scheduled_at: DateTime<Utc>, attempt: u32) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            node_id: None,
            scheduled_at,
            started_at: None,
            completed_at: None,
            status: ExecutionStatus::Pending,
            attempt,
            exit_code: 0,
            output_uri: String::new(),
            job_command: job.command.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DependencyKind {
    /// Child waits for parent success.
    Hard,
    /// Child waits for parent completion with any status.
    Soft,
    /// Child runs based on parent outcome.
    Conditional,
}

impl DependencyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DependencyKind::Hard => "HARD",
            DependencyKind::Soft => "SOFT",
            DependencyKind::Conditional => "CONDITIONAL",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "HARD" => Some(DependencyKind::Hard),
            "SOFT" => Some(DependencyKind::Soft),
            "CONDITIONAL" => Some(DependencyKind::Conditional),
            _ => None,
        }
    }
}

/// A parent→child relation between two jobs. Persisted for external
/// planners; never consulted by the dispatch loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub parent_job_id: Uuid,
    pub child_job_id: Uuid,
    pub kind: DependencyKind,
    pub confidence_score: f64,
    pub is_auto_detected: bool,
    pub created_at: DateTime<Utc>,
}
