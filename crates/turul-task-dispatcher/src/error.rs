//! Unified error types for dispatcher and task execution.

use std::time::Duration;

/// Dispatcher-level errors, returned synchronously to submitters and lifecycle callers.
///
/// `Clone` so that a memoised shutdown outcome can be handed to every caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid dispatcher configuration: {0}")]
    InvalidConfig(String),

    #[error("Dispatcher has already been started")]
    AlreadyStarted,

    #[error("Dispatcher has not been started")]
    NotStarted,

    #[error("Dispatcher is closed to new tasks")]
    DispatcherClosed,

    #[error("Task queue is full")]
    QueueFull,

    #[error("Drain did not complete within {drain_timeout:?}; in-flight tasks were cancelled")]
    DrainTimeout { drain_timeout: Duration },

    #[error("Dispatcher scope ended before drain completed: {0}")]
    ScopeEnded(ScopeError),
}

/// Why a [`CancellationScope`](crate::scope::CancellationScope) ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("context canceled")]
    Canceled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Task-level errors, carried inside a [`TaskResult`](crate::result::TaskResult).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    #[error("Task panicked: {message}")]
    Panicked { message: String, stack: String },

    #[error("Task cancelled")]
    Cancelled,

    #[error("Task deadline exceeded")]
    DeadlineExceeded,

    #[error("Task failed: {0}")]
    Failed(String),
}

impl TaskError {
    /// Build a `Failed` error from anything displayable.
    pub fn failed(err: impl std::fmt::Display) -> Self {
        TaskError::Failed(err.to_string())
    }

    /// Returns `true` if the task ended because its scope ended.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, TaskError::Cancelled | TaskError::DeadlineExceeded)
    }
}

impl From<ScopeError> for TaskError {
    fn from(err: ScopeError) -> Self {
        match err {
            ScopeError::Canceled => TaskError::Cancelled,
            ScopeError::DeadlineExceeded => TaskError::DeadlineExceeded,
        }
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        TaskError::Failed(err.to_string())
    }
}

/// Result type for dispatcher operations.
pub type Result<T, E = DispatchError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_error_maps_verbatim() {
        assert_eq!(TaskError::from(ScopeError::Canceled), TaskError::Cancelled);
        assert_eq!(
            TaskError::from(ScopeError::DeadlineExceeded),
            TaskError::DeadlineExceeded
        );
    }

    #[test]
    fn test_cancellation_classification() {
        assert!(TaskError::Cancelled.is_cancellation());
        assert!(TaskError::DeadlineExceeded.is_cancellation());
        assert!(!TaskError::failed("db down").is_cancellation());
    }

    #[test]
    fn test_drain_timeout_message_includes_budget() {
        let err = DispatchError::DrainTimeout {
            drain_timeout: Duration::from_millis(10),
        };
        assert!(err.to_string().contains("10ms"));
    }
}
