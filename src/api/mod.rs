//! Admin HTTP surface: CRUD over jobs, execution history, manual trigger
//! and cancel, and cluster introspection.
//!
//! The API is a plain consumer of the store/queue/coordination seams; it
//! never mutates scheduling state beyond what those seams expose.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::coordination::{Coordinator, Election};
use crate::cron::Schedule;
use crate::error::{Result, SkeeError};
use crate::metrics::Metrics;
use crate::models::{
    Execution, ExecutionStatus, Job, JobKind, JobStatus, ResourceConstraints, RetryPolicy,
};
use crate::queue::Queue;
use crate::store::{ExecutionStore, JobStore};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Request validation limits and the command danger patterns.
#[derive(Debug, Clone)]
pub struct Validator {
    pub max_name_length: usize,
    pub max_command_length: usize,
    pub command_blacklist: Vec<String>,
}

impl Default for Validator {
    fn default() -> Self {
        Self {
            max_name_length: 256,
            max_command_length: 4096,
            command_blacklist: vec![
                "rm -rf /".to_string(),
                ":(){ :|:& };:".to_string(),
                "mkfs".to_string(),
                "dd if=".to_string(),
            ],
        }
    }
}

impl Validator {
    pub fn validate_name(&self, name: &str) -> std::result::Result<(), String> {
        if name.is_empty() {
            return Err("name is required".to_string());
        }
        if name.len() > self.max_name_length {
            return Err("name exceeds maximum length".to_string());
        }
        Ok(())
    }

    pub fn validate_command(&self, command: &str) -> std::result::Result<(), String> {
        if command.is_empty() {
            return Err("command is required".to_string());
        }
        if command.len() > self.max_command_length {
            return Err("command exceeds maximum length".to_string());
        }
        if self
            .command_blacklist
            .iter()
            .any(|pattern| command.contains(pattern.as_str()))
        {
            return Err("command contains potentially dangerous patterns".to_string());
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub jobs: Arc<dyn JobStore>,
    pub executions: Arc<dyn ExecutionStore>,
    pub queue: Arc<dyn Queue>,
    pub coordinator: Arc<dyn Coordinator>,
    pub election: Arc<dyn Election>,
    pub metrics: Arc<Metrics>,
    pub validator: Arc<Validator>,
}

type ApiError = (StatusCode, Json<serde_json::Value>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "error": message.into() })),
    )
}

fn from_store_error(e: SkeeError) -> ApiError {
    match e {
        SkeeError::NotFound => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "record not found" })),
        ),
        SkeeError::Conflict => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "record already exists" })),
        ),
        e => {
            tracing::error!(error = %e, "Request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateJobRequest {
    pub name: String,
    pub schedule: String,
    pub command: String,
    #[serde(default)]
    pub kind: Option<JobKind>,
    #[serde(default)]
    pub owner_id: Option<String>,
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    #[serde(default)]
    pub constraints: Option<ResourceConstraints>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateJobRequest {
    pub name: Option<String>,
    pub schedule: Option<String>,
    pub command: Option<String>,
    pub status: Option<JobStatus>,
    pub retry_policy: Option<RetryPolicy>,
    pub constraints: Option<ResourceConstraints>,
}

#[derive(Debug, Deserialize)]
pub struct Pagination {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
struct JobListResponse {
    jobs: Vec<Job>,
    count: usize,
}

pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/api/v1/jobs", post(create_job).get(list_jobs))
        .route(
            "/api/v1/jobs/:id",
            get(get_job).patch(update_job).delete(delete_job),
        )
        .route("/api/v1/jobs/:id/trigger", post(trigger_job))
        .route("/api/v1/jobs/:id/executions", get(list_job_executions))
        .route("/api/v1/executions/:id", get(get_execution))
        .route("/api/v1/executions/:id/cancel", post(cancel_execution))
        .route("/api/v1/cluster/nodes", get(list_nodes))
        .route("/api/v1/cluster/leader", get(get_leader))
        .layer(cors)
        .with_state(state)
}

/// Serve the API with graceful shutdown bounded to ten seconds after
/// cancellation.
pub async fn serve(addr: SocketAddr, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %addr, "Admin API listening");

    let shutdown = cancel.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    });

    tokio::select! {
        result = &mut server => {
            result.map_err(|e| SkeeError::Internal(e.to_string()))??;
            return Ok(());
        }
        _ = cancel.cancelled() => {}
    }

    match tokio::time::timeout(SHUTDOWN_GRACE, &mut server).await {
        Ok(result) => {
            result.map_err(|e| SkeeError::Internal(e.to_string()))??;
        }
        Err(_) => {
            tracing::warn!("Graceful shutdown timed out, aborting API server");
            server.abort();
        }
    }
    Ok(())
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics(State(state): State<ApiState>) -> impl IntoResponse {
    Json(state.metrics.snapshot())
}

async fn create_job(
    State(state): State<ApiState>,
    Json(req): Json<CreateJobRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    state.validator.validate_name(&req.name).map_err(bad_request)?;
    state
        .validator
        .validate_command(&req.command)
        .map_err(bad_request)?;
    let schedule = Schedule::parse(&req.schedule)
        .map_err(|e| bad_request(format!("invalid cron schedule: {e}")))?;
    let next_run = schedule
        .next_after(Utc::now())
        .ok_or_else(|| bad_request("schedule has no future occurrence"))?;

    let mut job = Job::new(req.name, req.schedule, req.command);
    job.kind = req.kind.unwrap_or(JobKind::Shell);
    job.owner_id = req.owner_id.unwrap_or_default();
    job.retry_policy = req.retry_policy.unwrap_or_default();
    job.constraints = req.constraints.unwrap_or_default();
    job.next_run_at = Some(next_run);

    state.jobs.create_job(&job).await.map_err(from_store_error)?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(
    State(state): State<ApiState>,
    Query(page): Query<Pagination>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let limit = page.limit.unwrap_or(50).clamp(1, 500);
    let offset = page.offset.unwrap_or(0).max(0);
    let jobs = state
        .jobs
        .list_jobs(limit, offset)
        .await
        .map_err(from_store_error)?;
    let count = jobs.len();
    Ok(Json(JobListResponse { jobs, count }))
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let job = state.jobs.get_job(id).await.map_err(from_store_error)?;
    Ok(Json(job))
}

async fn update_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateJobRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let mut job = state.jobs.get_job(id).await.map_err(from_store_error)?;

    if let Some(name) = req.name {
        state.validator.validate_name(&name).map_err(bad_request)?;
        job.name = name;
    }
    if let Some(command) = req.command {
        state
            .validator
            .validate_command(&command)
            .map_err(bad_request)?;
        job.command = command;
    }
    if let Some(schedule) = req.schedule {
        let parsed = Schedule::parse(&schedule)
            .map_err(|e| bad_request(format!("invalid cron schedule: {e}")))?;
        job.next_run_at = parsed.next_after(Utc::now());
        job.schedule = schedule;
    }
    if let Some(status) = req.status {
        job.status = status;
    }
    if let Some(retry_policy) = req.retry_policy {
        job.retry_policy = retry_policy;
    }
    if let Some(constraints) = req.constraints {
        job.constraints = constraints;
    }

    state.jobs.update_job(&job).await.map_err(from_store_error)?;
    Ok(Json(job))
}

async fn delete_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    state.jobs.archive_job(id).await.map_err(from_store_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Create an immediate one-off execution outside the recurrence.
async fn trigger_job(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let job = state.jobs.get_job(id).await.map_err(from_store_error)?;
    let execution = Execution::dispatch(&job, Utc::now());
    state
        .executions
        .create_execution(&execution)
        .await
        .map_err(from_store_error)?;
    if let Err(e) = state.queue.push(&execution).await {
        tracing::warn!(exec_id = %execution.id, error = %e, "Failed to push triggered execution");
    }
    Ok((StatusCode::CREATED, Json(execution)))
}

async fn list_job_executions(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
    Query(page): Query<Pagination>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let limit = page.limit.unwrap_or(50).clamp(1, 500);
    let executions = state
        .executions
        .list_executions(id, limit)
        .await
        .map_err(from_store_error)?;
    let count = executions.len();
    Ok(Json(json!({ "executions": executions, "count": count })))
}

async fn get_execution(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let execution = state
        .executions
        .get_execution(id)
        .await
        .map_err(from_store_error)?;
    Ok(Json(execution))
}

async fn cancel_execution(
    State(state): State<ApiState>,
    Path(id): Path<Uuid>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    match state.executions.cancel_execution(id).await {
        Ok(()) => Ok(Json(json!({ "id": id, "status": ExecutionStatus::Cancelled }))),
        Err(SkeeError::Conflict) => Err((
            StatusCode::CONFLICT,
            Json(json!({ "error": "execution already finished" })),
        )),
        Err(e) => Err(from_store_error(e)),
    }
}

async fn list_nodes(
    State(state): State<ApiState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let nodes = state
        .coordinator
        .active_nodes()
        .await
        .map_err(from_store_error)?;
    let count = nodes.len();
    Ok(Json(json!({ "nodes": nodes, "count": count })))
}

async fn get_leader(
    State(state): State<ApiState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let leader = state.election.leader().await.map_err(from_store_error)?;
    Ok(Json(json!({ "leader": leader })))
}
