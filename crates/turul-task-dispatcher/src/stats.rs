//! Pool bookkeeping counters and the `PoolStats` snapshot exported to metrics collectors.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;

use crate::dispatcher::DispatcherState;

/// Point-in-time view of a dispatcher. Safe to poll concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    /// Lifecycle state at the time of the snapshot
    pub state: DispatcherState,
    /// Configured number of workers
    pub worker_count: usize,
    /// Tasks accepted but not yet dequeued
    pub queue_depth: usize,
    /// Workers currently executing a task
    pub active_workers: usize,
    /// Workers alive and waiting for a task
    pub idle_workers: usize,
    /// Tasks accepted by `submit`/`try_submit`
    pub submitted_count: u64,
    /// Tasks whose result has been handed to the sink
    pub completed_count: u64,
    /// Completed tasks whose outcome was an error (panics included)
    pub failed_count: u64,
    /// Completed tasks that panicked
    pub panicked_count: u64,
    /// `try_submit` calls rejected because the queue was full
    pub rejected_count: u64,
    /// Results dropped by the sink, including deliveries that panicked
    pub dropped_count: u64,
}

/// Atomic counters owned by a dispatcher and shared with its workers.
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    pub(crate) live_workers: AtomicUsize,
    pub(crate) active_workers: AtomicUsize,
    pub(crate) submitted: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) panicked: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) sink_failures: AtomicU64,
}

impl PoolCounters {
    pub(crate) fn record_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_sink_failure(&self) {
        self.sink_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_completion(&self, failed: bool, panicked: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        if panicked {
            self.panicked.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(
        &self,
        state: DispatcherState,
        worker_count: usize,
        queue_depth: usize,
        dropped_count: u64,
    ) -> PoolStats {
        let live = self.live_workers.load(Ordering::Acquire);
        let active = self.active_workers.load(Ordering::Acquire);
        PoolStats {
            state,
            worker_count,
            queue_depth,
            active_workers: active,
            idle_workers: live.saturating_sub(active),
            submitted_count: self.submitted.load(Ordering::Relaxed),
            completed_count: self.completed.load(Ordering::Relaxed),
            failed_count: self.failed.load(Ordering::Relaxed),
            panicked_count: self.panicked.load(Ordering::Relaxed),
            rejected_count: self.rejected.load(Ordering::Relaxed),
            dropped_count: dropped_count + self.sink_failures.load(Ordering::Relaxed),
        }
    }
}
