//! Durable dispatch queue: an append-only stream with named consumer
//! groups.
//!
//! Each pushed entry gets a server-generated, monotonically increasing id
//! and carries the JSON-encoded execution snapshot plus `job_id`/`exec_id`
//! as indexed fields. Within a group an entry is delivered to one live
//! consumer at a time and stays pending until acknowledged; entries pending
//! past the redelivery window become claimable by other consumers. The
//! queue is the transport, not the source of truth: consumers tolerate
//! redelivery because the store's run-state and result transitions are
//! idempotent per execution id.

pub mod memory;
pub mod postgres;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::Execution;

pub use memory::MemoryQueue;
pub use postgres::PostgresQueue;

/// Stream key for pending job dispatches.
pub const STREAM_PENDING: &str = "jobs:queue:pending";

/// Consumer group shared by all executors.
pub const EXECUTOR_GROUP: &str = "skeenode-executors";

#[async_trait]
pub trait Queue: Send + Sync {
    /// Idempotently create `group` positioned at the current stream tail.
    async fn ensure_group(&self, group: &str) -> Result<()>;

    /// Append the execution snapshot to the stream.
    async fn push(&self, execution: &Execution) -> Result<()>;

    /// Blocking read of one entry for `consumer` within `group`. Returns
    /// `None` when `block` elapses without a deliverable entry. The block
    /// timeout is kept short so callers can observe cancellation.
    async fn pop(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<(String, Execution)>>;

    /// Remove `message_id` from the pending set of `group`.
    async fn ack(&self, group: &str, message_id: &str) -> Result<()>;
}
