use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkeeError {
    /// Domain sentinel: the referenced job or execution does not exist.
    #[error("record not found")]
    NotFound,

    /// Domain sentinel: a uniqueness constraint was violated, e.g. a
    /// duplicate `(job_id, scheduled_at)` dispatch.
    #[error("record already exists")]
    Conflict,

    #[error("invalid schedule: {0}")]
    Schedule(#[from] crate::cron::ScheduleParseError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("queue error: {0}")]
    Queue(String),

    #[error("coordination error: {0}")]
    Coordination(String),

    #[error("predictor error: {0}")]
    Predictor(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SkeeError {
    /// True for the domain sentinel callers treat as skip, not crash.
    pub fn is_not_found(&self) -> bool {
        matches!(self, SkeeError::NotFound)
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, SkeeError::Conflict)
    }
}

pub type Result<T> = std::result::Result<T, SkeeError>;
