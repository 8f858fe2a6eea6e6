//! Coordination primitives: lease-based leader election and TTL node
//! presence.
//!
//! An election lease is refreshed by a background keep-alive while held; if
//! the holder stops refreshing, a follower acquires the lease within about
//! one TTL. The scheduler re-verifies `leader()` against its own identity
//! at the top of every tick, so a stale holder degrades to no-op ticks
//! rather than split-brain writes (the `(job_id, scheduled_at)` uniqueness
//! constraint covers the turnover window).

pub mod memory;
pub mod postgres;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

pub use memory::MemoryCoordinator;
pub use postgres::PostgresCoordinator;

/// Campaign name shared by all scheduler replicas.
pub const SCHEDULER_ELECTION: &str = "skeenode-leader";

#[async_trait]
pub trait Election: Send + Sync {
    /// Block until this participant holds leadership, then keep the lease
    /// alive in the background until `resign` or drop.
    async fn campaign(&self, value: &str) -> Result<()>;

    /// Release leadership so another participant can take over quickly.
    async fn resign(&self) -> Result<()>;

    /// The current leader's campaign value, if any lease is live.
    async fn leader(&self) -> Result<Option<String>>;
}

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// An election handle for the given campaign name and lease TTL.
    fn election(&self, name: &str, ttl: Duration) -> Arc<dyn Election>;

    /// Refresh this node's presence key for `ttl`. Called from the executor
    /// heartbeat loop; the TTL must comfortably exceed the heartbeat
    /// interval so one missed beat does not orphan in-flight work.
    async fn register_node(&self, node_id: &str, ttl: Duration) -> Result<()>;

    /// Ids of all nodes with a live presence key.
    async fn active_nodes(&self) -> Result<Vec<String>>;
}

/// Identity for a node process: `{hostname}-{8-hex}`.
pub fn node_identity() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{host}-{}", &suffix[..8])
}
