//! Explicit metrics registry.
//!
//! One `Metrics` instance is created in `main` and passed through component
//! constructors; nothing registers itself globally, so tests can run in
//! parallel with isolated registries.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct Metrics {
    pub jobs_dispatched: AtomicU64,
    pub dispatches_skipped: AtomicU64,
    pub orphans_reaped: AtomicU64,
    pub stale_pending_failed: AtomicU64,
    pub retries_scheduled: AtomicU64,
    pub heartbeats_sent: AtomicU64,
    pub executions_succeeded: AtomicU64,
    pub executions_failed: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_dispatched: u64,
    pub dispatches_skipped: u64,
    pub orphans_reaped: u64,
    pub stale_pending_failed: u64,
    pub retries_scheduled: u64,
    pub heartbeats_sent: u64,
    pub executions_succeeded: u64,
    pub executions_failed: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(counter: &AtomicU64, value: u64) {
        counter.fetch_add(value, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_dispatched: self.jobs_dispatched.load(Ordering::Relaxed),
            dispatches_skipped: self.dispatches_skipped.load(Ordering::Relaxed),
            orphans_reaped: self.orphans_reaped.load(Ordering::Relaxed),
            stale_pending_failed: self.stale_pending_failed.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            heartbeats_sent: self.heartbeats_sent.load(Ordering::Relaxed),
            executions_succeeded: self.executions_succeeded.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
        }
    }
}
