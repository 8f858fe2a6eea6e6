//! In-process stream backend with consumer-group semantics matching the
//! Postgres one. Backs the test suite and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{Result, SkeeError};
use crate::models::Execution;

use super::Queue;

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
struct Entry {
    id: u64,
    payload: String,
}

#[derive(Debug, Clone)]
struct PendingDelivery {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct Group {
    cursor: u64,
    pending: HashMap<u64, PendingDelivery>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u64,
    entries: Vec<Entry>,
    groups: HashMap<String, Group>,
}

#[derive(Debug)]
pub struct MemoryQueue {
    inner: Mutex<Inner>,
    redeliver_after: Duration,
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(600))
    }
}

impl MemoryQueue {
    /// `redeliver_after` bounds how long an unacknowledged entry stays
    /// claimed by one consumer before another may take it over.
    pub fn new(redeliver_after: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            redeliver_after,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("queue mutex poisoned")
    }

    fn try_pop(&self, group: &str, consumer: &str) -> Result<Option<(String, String)>> {
        let mut guard = self.lock();
        let Inner {
            entries, groups, ..
        } = &mut *guard;

        let group_state = groups
            .get_mut(group)
            .ok_or_else(|| SkeeError::Queue(format!("no such consumer group {group:?}")))?;

        // Stale pending entries first: a consumer that died mid-flight must
        // not hold its deliveries forever.
        let reclaimable = group_state
            .pending
            .iter()
            .filter(|(_, p)| p.delivered_at.elapsed() >= self.redeliver_after)
            .map(|(id, _)| *id)
            .min();
        if let Some(id) = reclaimable {
            let delivery = group_state.pending.get_mut(&id).expect("id from pending");
            delivery.consumer = consumer.to_string();
            delivery.delivered_at = Instant::now();
            delivery.delivery_count += 1;
            let payload = entries
                .iter()
                .find(|e| e.id == id)
                .map(|e| e.payload.clone())
                .ok_or_else(|| SkeeError::Queue(format!("pending entry {id} lost")))?;
            return Ok(Some((id.to_string(), payload)));
        }

        let Some(entry) = entries.iter().find(|e| e.id > group_state.cursor).cloned() else {
            return Ok(None);
        };

        group_state.cursor = entry.id;
        group_state.pending.insert(
            entry.id,
            PendingDelivery {
                consumer: consumer.to_string(),
                delivered_at: Instant::now(),
                delivery_count: 1,
            },
        );
        Ok(Some((entry.id.to_string(), entry.payload)))
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn ensure_group(&self, group: &str) -> Result<()> {
        let mut inner = self.lock();
        let tail = inner.entries.last().map(|e| e.id).unwrap_or(0);
        inner.groups.entry(group.to_string()).or_insert(Group {
            cursor: tail,
            pending: HashMap::new(),
        });
        Ok(())
    }

    async fn push(&self, execution: &Execution) -> Result<()> {
        let payload = serde_json::to_string(execution)?;
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(Entry { id, payload });
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
            if let Some((id, payload)) = self.try_pop(group, consumer)? {
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
        let id: u64 = message_id
            .parse()
            .map_err(|_| SkeeError::Queue(format!("invalid message id {message_id:?}")))?;
        let mut inner = self.lock();
        if let Some(group_state) = inner.groups.get_mut(group) {
            group_state.pending.remove(&id);
        }
        Ok(())
    }
}
