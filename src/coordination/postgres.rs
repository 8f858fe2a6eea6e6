//! Postgres coordination backend.
//!
//! Elections are a lease row per campaign name, acquired and refreshed with
//! a single conditional upsert; node presence is a TTL row per node id.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::task::JoinHandle;

use crate::error::Result;

use super::{Coordinator, Election};

#[derive(Clone)]
pub struct PostgresCoordinator {
    pool: PgPool,
}

impl PostgresCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Coordinator for PostgresCoordinator {
    fn election(&self, name: &str, ttl: Duration) -> Arc<dyn Election> {
        Arc::new(PostgresElection {
            pool: self.pool.clone(),
            name: name.to_string(),
            ttl,
            value: Mutex::new(None),
            keepalive: Mutex::new(None),
        })
    }

    async fn register_node(&self, node_id: &str, ttl: Duration) -> Result<()> {
        sqlx::query(
            "INSERT INTO node_presence (node_id, expires_at) \
             VALUES ($1, now() + make_interval(secs => $2)) \
             ON CONFLICT (node_id) DO UPDATE SET expires_at = EXCLUDED.expires_at",
        )
        .bind(node_id)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await?;
        // Opportunistic cleanup of long-dead rows.
        sqlx::query("DELETE FROM node_presence WHERE expires_at < now() - interval '5 minutes'")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn active_nodes(&self) -> Result<Vec<String>> {
        let rows =
            sqlx::query("SELECT node_id FROM node_presence WHERE expires_at > now() ORDER BY node_id")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter()
            .map(|row| Ok(row.try_get::<String, _>("node_id")?))
            .collect()
    }
}

pub struct PostgresElection {
    pool: PgPool,
    name: String,
    ttl: Duration,
    value: Mutex<Option<String>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

/// Acquire or refresh the lease row. Wins when the row is absent, expired,
/// or already held by `value`; returns whether `value` holds the lease.
async fn try_acquire(pool: &PgPool, name: &str, value: &str, ttl: Duration) -> Result<bool> {
    let row = sqlx::query(
        "INSERT INTO election_leases (name, holder, expires_at) \
         VALUES ($1, $2, now() + make_interval(secs => $3)) \
         ON CONFLICT (name) DO UPDATE \
         SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at \
         WHERE election_leases.expires_at < now() OR election_leases.holder = EXCLUDED.holder \
         RETURNING holder",
    )
    .bind(name)
    .bind(value)
    .bind(ttl.as_secs_f64())
    .fetch_optional(pool)
    .await?;
    Ok(row.is_some())
}

#[async_trait]
impl Election for PostgresElection {
    async fn campaign(&self, value: &str) -> Result<()> {
        let poll = (self.ttl / 4).max(Duration::from_millis(200));
        loop {
            if try_acquire(&self.pool, &self.name, value, self.ttl).await? {
                break;
            }
            tokio::time::sleep(poll).await;
        }

        let pool = self.pool.clone();
        let name = self.name.clone();
        let value_owned = value.to_string();
        let ttl = self.ttl;
        let refresh = (ttl / 3).max(Duration::from_millis(200));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(refresh).await;
                match try_acquire(&pool, &name, &value_owned, ttl).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(election = %name, "Lost election lease to another holder");
                    }
                    Err(e) => {
                        tracing::warn!(election = %name, error = %e, "Failed to refresh election lease");
                    }
                }
            }
        });

        *self.value.lock().expect("value mutex poisoned") = Some(value.to_string());
        let mut keepalive = self.keepalive.lock().expect("keepalive mutex poisoned");
        if let Some(old) = keepalive.replace(handle) {
            old.abort();
        }
        Ok(())
    }

    async fn resign(&self) -> Result<()> {
        if let Some(handle) = self
            .keepalive
            .lock()
            .expect("keepalive mutex poisoned")
            .take()
        {
            handle.abort();
        }
        let value = self.value.lock().expect("value mutex poisoned").take();
        if let Some(value) = value {
            sqlx::query("DELETE FROM election_leases WHERE name = $1 AND holder = $2")
                .bind(&self.name)
                .bind(value)
                .execute(&self.pool)
                .await?;
        }
        Ok(())
    }

    async fn leader(&self) -> Result<Option<String>> {
        let row = sqlx::query(
            "SELECT holder FROM election_leases WHERE name = $1 AND expires_at > now()",
        )
        .bind(&self.name)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| Ok(r.try_get::<String, _>("holder")?)).transpose()
    }
}

impl Drop for PostgresElection {
    fn drop(&mut self) {
        if let Some(handle) = self
            .keepalive
            .lock()
            .expect("keepalive mutex poisoned")
            .take()
        {
            handle.abort();
        }
    }
}
