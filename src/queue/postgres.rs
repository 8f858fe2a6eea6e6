//! Postgres stream backend.
//!
//! `queue_entries` is the append-only log (BIGSERIAL ids give the monotone
//! ordering), `queue_groups` holds each group's delivery cursor, and
//! `queue_pending` is the per-group pending set claimed with
//! `FOR UPDATE SKIP LOCKED` so concurrent consumers never double-claim.

use std::time::Duration;

use sqlx::{PgPool, Row};
use tokio::time::Instant;

use crate::error::{Result, SkeeError};
use crate::models::Execution;

use super::{Queue, STREAM_PENDING};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct PostgresQueue {
    pool: PgPool,
    stream: String,
    redeliver_after: Duration,
}

impl PostgresQueue {
    pub fn new(pool: PgPool) -> Self {
        Self::with_stream(pool, STREAM_PENDING, Duration::from_secs(600))
    }

    pub fn with_stream(pool: PgPool, stream: &str, redeliver_after: Duration) -> Self {
        Self {
            pool,
            stream: stream.to_string(),
            redeliver_after,
        }
    }

    async fn try_pop(&self, group: &str, consumer: &str) -> Result<Option<(String, String)>> {
        let mut tx = self.pool.begin().await?;

        // Reclaim an entry whose consumer stopped acknowledging.
        let stale = sqlx::query(
            "SELECT p.entry_id, e.payload FROM queue_pending p \
             JOIN queue_entries e ON e.id = p.entry_id \
             WHERE p.stream = $1 AND p.group_name = $2 \
             AND p.delivered_at < now() - make_interval(secs => $3) \
             ORDER BY p.delivered_at ASC LIMIT 1 FOR UPDATE OF p SKIP LOCKED",
        )
        .bind(&self.stream)
        .bind(group)
        .bind(self.redeliver_after.as_secs_f64())
        .fetch_optional(&mut *tx)
        .await?;

        if let Some(row) = stale {
            let entry_id: i64 = row.try_get("entry_id")?;
            let payload: String = row.try_get("payload")?;
            sqlx::query(
                "UPDATE queue_pending SET consumer = $4, delivered_at = now(), \
                 delivery_count = delivery_count + 1 \
                 WHERE stream = $1 AND group_name = $2 AND entry_id = $3",
            )
            .bind(&self.stream)
            .bind(group)
            .bind(entry_id)
            .bind(consumer)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            return Ok(Some((entry_id.to_string(), payload)));
        }

        // Otherwise advance the group cursor past the next undelivered
        // entry. The cursor row lock serializes deliveries within a group.
        let cursor_row = sqlx::query(
            "SELECT cursor FROM queue_groups WHERE stream = $1 AND name = $2 FOR UPDATE",
        )
        .bind(&self.stream)
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?;
        let cursor: i64 = cursor_row
            .ok_or_else(|| SkeeError::Queue(format!("no such consumer group {group:?}")))?
            .try_get("cursor")?;

        let next = sqlx::query(
            "SELECT id, payload FROM queue_entries WHERE stream = $1 AND id > $2 \
             ORDER BY id ASC LIMIT 1",
        )
        .bind(&self.stream)
        .bind(cursor)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = next else {
            tx.commit().await?;
            return Ok(None);
        };
        let entry_id: i64 = row.try_get("id")?;
        let payload: String = row.try_get("payload")?;

        sqlx::query("UPDATE queue_groups SET cursor = $3 WHERE stream = $1 AND name = $2")
            .bind(&self.stream)
            .bind(group)
            .bind(entry_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO queue_pending (stream, group_name, entry_id, consumer, delivered_at, \
             delivery_count) VALUES ($1, $2, $3, $4, now(), 1)",
        )
        .bind(&self.stream)
        .bind(group)
        .bind(entry_id)
        .bind(consumer)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some((entry_id.to_string(), payload)))
    }
}

#[async_trait::async_trait]
impl Queue for PostgresQueue {
    async fn ensure_group(&self, group: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO queue_groups (stream, name, cursor) \
             VALUES ($1, $2, (SELECT COALESCE(MAX(id), 0) FROM queue_entries WHERE stream = $1)) \
             ON CONFLICT (stream, name) DO NOTHING",
        )
        .bind(&self.stream)
        .bind(group)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn push(&self, execution: &Execution) -> Result<()> {
        let payload = serde_json::to_string(execution)?;
        sqlx::query(
            "INSERT INTO queue_entries (stream, payload, job_id, exec_id) VALUES ($1, $2, $3, $4)",
        )
        .bind(&self.stream)
        .bind(payload)
        .bind(execution.job_id.to_string())
        .bind(execution.id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pop(
        &self,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Option<(String, Execution)>> {
        let deadline = Instant::now() + block;
        loop {
            if let Some((id, payload)) = self.try_pop(group, consumer).await? {
                let execution: Execution = serde_json::from_str(&payload)?;
                return Ok(Some((id, execution)));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(POLL_INTERVAL.min(block)).await;
        }
    }

    async fn ack(&self, group: &str, message_id: &str) -> Result<()> {
        let entry_id: i64 = message_id
            .parse()
            .map_err(|_| SkeeError::Queue(format!("invalid message id {message_id:?}")))?;
        sqlx::query(
            "DELETE FROM queue_pending WHERE stream = $1 AND group_name = $2 AND entry_id = $3",
        )
        .bind(&self.stream)
        .bind(group)
        .bind(entry_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
