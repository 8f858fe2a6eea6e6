//! Persistence for captured execution output.
//!
//! The executor combines a run's stdout and stderr into one document and
//! stores it here; the returned reference becomes the execution's
//! `output_uri`.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::error::Result;

#[async_trait]
pub trait LogStore: Send + Sync {
    /// Persist logs for an execution and return a reference to them.
    async fn store(&self, execution_id: &str, logs: &[u8]) -> Result<String>;

    /// Fetch logs by the reference previously returned from `store`.
    async fn retrieve(&self, reference: &str) -> Result<Vec<u8>>;
}

/// Local-filesystem log store. One `{execution_id}.log` file per run.
pub struct LocalLogStore {
    base_path: PathBuf,
}

impl LocalLogStore {
    pub async fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }
}

#[async_trait]
impl LogStore for LocalLogStore {
    async fn store(&self, execution_id: &str, logs: &[u8]) -> Result<String> {
        let path = self.base_path.join(format!("{execution_id}.log"));
        tokio::fs::write(&path, logs).await?;
        Ok(path.to_string_lossy().into_owned())
    }

    async fn retrieve(&self, reference: &str) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(reference).await?)
    }
}
