//! Task results as reported to a [`ResultSink`](crate::sink::ResultSink).

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::TaskError;
use crate::task::TaskId;
use crate::worker::WorkerId;

/// Outcome of one executed task. Produced exactly once per dequeued task.
#[derive(Debug, Clone)]
pub struct TaskResult<O> {
    /// The task this result belongs to
    pub task_id: TaskId,
    /// Value on success, task-level error otherwise
    pub outcome: Result<O, TaskError>,
    /// Worker that executed the task
    pub worker_id: WorkerId,
    /// Wall-clock completion time
    pub completed_at: DateTime<Utc>,
    /// Time spent executing
    pub elapsed: Duration,
}

impl<O> TaskResult<O> {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn value(&self) -> Option<&O> {
        self.outcome.as_ref().ok()
    }

    pub fn error(&self) -> Option<&TaskError> {
        self.outcome.as_ref().err()
    }

    /// Consume the result, keeping only the outcome.
    pub fn into_outcome(self) -> Result<O, TaskError> {
        self.outcome
    }
}
