//! Dispatcher configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DispatchError, Result};

/// Configuration for a [`Dispatcher`](crate::Dispatcher).
///
/// Deserializable with per-field defaults, so a partial TOML/JSON document is valid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Name used in log output
    pub name: String,
    /// Number of long-lived workers (must be at least 1)
    pub worker_count: usize,
    /// Queue capacity; 0 makes submission a rendezvous with an idle worker
    pub queue_capacity: usize,
    /// Timeout applied to tasks that do not set their own (None = no limit)
    pub default_task_timeout_ms: Option<u64>,
    /// Drain budget used by `Dispatcher::shutdown_gracefully`
    pub drain_timeout_ms: u64,
    /// How long shutdown waits for workers after forcing cancellation
    pub cancel_grace_ms: u64,
    /// Buffer size of the collecting result channel
    pub result_buffer: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            name: "dispatcher".to_string(),
            worker_count: 4,
            queue_capacity: 64,
            default_task_timeout_ms: None,
            drain_timeout_ms: 30_000,
            cancel_grace_ms: 100,
            result_buffer: 1024,
        }
    }
}

impl DispatcherConfig {
    /// Configuration with the given pool shape and defaults elsewhere.
    pub fn new(worker_count: usize, queue_capacity: usize) -> Self {
        Self {
            worker_count,
            queue_capacity,
            ..Self::default()
        }
    }

    /// Reject misconfiguration at construction time, never at runtime.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.worker_count < 1 {
            errors.push(format!("worker_count must be >= 1, got {}", self.worker_count));
        }
        if self.result_buffer < 1 {
            errors.push("result_buffer must be >= 1".to_string());
        }
        if self.name.trim().is_empty() {
            errors.push("name must not be empty".to_string());
        }
        if self.default_task_timeout_ms == Some(0) {
            errors.push("default_task_timeout_ms must be > 0 when set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DispatchError::InvalidConfig(errors.join("; ")))
        }
    }

    pub fn default_task_timeout(&self) -> Option<Duration> {
        self.default_task_timeout_ms.map(Duration::from_millis)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_millis(self.cancel_grace_ms)
    }
}
