//! In-process coordination backend with the same lease semantics as the
//! Postgres one. Backs the test suite and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::error::Result;

use super::{Coordinator, Election};

#[derive(Debug, Clone)]
struct Lease {
    holder: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct CoordState {
    elections: Mutex<HashMap<String, Lease>>,
    nodes: Mutex<HashMap<String, Instant>>,
}

impl CoordState {
    /// Acquire or refresh the lease: succeeds when vacant, expired, or
    /// already held by `value`.
    fn try_acquire(&self, name: &str, value: &str, ttl: Duration) -> bool {
        let mut elections = self.elections.lock().expect("election mutex poisoned");
        let now = Instant::now();
        match elections.get(name) {
            Some(lease) if lease.expires_at > now && lease.holder != value => false,
            _ => {
                elections.insert(
                    name.to_string(),
                    Lease {
                        holder: value.to_string(),
                        expires_at: now + ttl,
                    },
                );
                true
            }
        }
    }
}

#[derive(Debug, Default, Clone)]
pub struct MemoryCoordinator {
    state: Arc<CoordState>,
}

impl MemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    fn election(&self, name: &str, ttl: Duration) -> Arc<dyn Election> {
        Arc::new(MemoryElection {
            state: self.state.clone(),
            name: name.to_string(),
            ttl,
            value: Mutex::new(None),
            keepalive: Mutex::new(None),
        })
    }

    async fn register_node(&self, node_id: &str, ttl: Duration) -> Result<()> {
        let mut nodes = self.state.nodes.lock().expect("node mutex poisoned");
        nodes.insert(node_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn active_nodes(&self) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut nodes = self.state.nodes.lock().expect("node mutex poisoned");
        nodes.retain(|_, expires_at| *expires_at > now);
        let mut ids: Vec<String> = nodes.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

pub struct MemoryElection {
    state: Arc<CoordState>,
    name: String,
    ttl: Duration,
    value: Mutex<Option<String>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl Election for MemoryElection {
    async fn campaign(&self, value: &str) -> Result<()> {
        let poll = (self.ttl / 4).max(Duration::from_millis(10));
        loop {
            if self.state.try_acquire(&self.name, value, self.ttl) {
                break;
            }
            tokio::time::sleep(poll).await;
        }

        let state = self.state.clone();
        let name = self.name.clone();
        let held_value = value.to_string();
        let ttl = self.ttl;
        let refresh = (ttl / 3).max(Duration::from_millis(10));
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(refresh).await;
                state.try_acquire(&name, &held_value, ttl);
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
        // Drop the lease outright so a follower wins without waiting for
        // expiry. Only this participant's own lease is cleared.
        let value = self.value.lock().expect("value mutex poisoned").take();
        if let Some(value) = value {
            let mut elections = self.state.elections.lock().expect("election mutex poisoned");
            if elections.get(&self.name).map(|l| l.holder == value) == Some(true) {
                elections.remove(&self.name);
            }
        }
        Ok(())
    }

    async fn leader(&self) -> Result<Option<String>> {
        let elections = self.state.elections.lock().expect("election mutex poisoned");
        Ok(elections
            .get(&self.name)
            .filter(|lease| lease.expires_at > Instant::now())
            .map(|lease| lease.holder.clone()))
    }
}

impl Drop for MemoryElection {
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
