//! The unit of work accepted by the dispatcher.
//!
//! Concrete task kinds implement [`Task`]; ad-hoc work can be wrapped in a
//! [`FnTask`], which pairs a payload with an async closure.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::scope::CancellationScope;

/// Opaque task identifier, caller-assigned or generated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a new task ID using UUID v7 (temporal ordering).
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for TaskId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<u64> for TaskId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// A unit of work executed by exactly one worker.
///
/// `execute` consumes the task, so a submitted task cannot be run twice.
/// Implementations must observe `scope` at every internal blocking point
/// (database calls, outbound RPCs) so cancellation reaches the task body.
#[async_trait]
pub trait Task: Send + 'static {
    /// Value produced on success.
    type Output: Send + 'static;

    /// Identifier used to correlate the task with its result.
    fn id(&self) -> TaskId;

    /// Per-task timeout, narrowed from the pool-wide scope.
    ///
    /// `None` falls back to the dispatcher's default task timeout.
    fn timeout(&self) -> Option<Duration> {
        None
    }

    /// Run the task under `scope`.
    async fn execute(self: Box<Self>, scope: CancellationScope) -> Result<Self::Output, TaskError>;
}

/// Boxed task as stored in the queue.
pub type BoxedTask<O> = Box<dyn Task<Output = O>>;

/// A task built from a payload and an async closure.
///
/// The payload is moved into the closure as an explicit argument, never captured
/// from a surrounding loop.
pub struct FnTask<P, F, Fut, O> {
    id: TaskId,
    payload: P,
    work: F,
    timeout: Option<Duration>,
    _marker: PhantomData<fn() -> (Fut, O)>,
}

impl<P, F, Fut, O> FnTask<P, F, Fut, O>
where
    P: Send + 'static,
    F: FnOnce(P, CancellationScope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, TaskError>> + Send + 'static,
    O: Send + 'static,
{
    pub fn new(id: impl Into<TaskId>, payload: P, work: F) -> Self {
        Self {
            id: id.into(),
            payload,
            work,
            timeout: None,
            _marker: PhantomData,
        }
    }

    /// Set a task-wide timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn payload(&self) -> &P {
        &self.payload
    }

    /// Box the task for submission.
    pub fn boxed(self) -> BoxedTask<O> {
        Box::new(self)
    }
}

#[async_trait]
impl<P, F, Fut, O> Task for FnTask<P, F, Fut, O>
where
    P: Send + 'static,
    F: FnOnce(P, CancellationScope) -> Fut + Send + 'static,
    Fut: Future<Output = Result<O, TaskError>> + Send + 'static,
    O: Send + 'static,
{
    type Output = O;

    fn id(&self) -> TaskId {
        self.id.clone()
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn execute(self: Box<Self>, scope: CancellationScope) -> Result<O, TaskError> {
        let FnTask { payload, work, .. } = *self;
        (work)(payload, scope).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique() {
        let first = TaskId::generate();
        let second = TaskId::generate();
        assert_ne!(first, second);
    }

    #[test]
    fn test_id_conversions() {
        assert_eq!(TaskId::from(7u64).as_str(), "7");
        assert_eq!(TaskId::from("report-1").to_string(), "report-1");
        assert_eq!(
            serde_json::to_value(TaskId::from("a")).unwrap(),
            serde_json::json!("a")
        );
    }

    #[tokio::test]
    async fn test_fn_task_passes_payload() {
        let task = FnTask::new("double", 21u32, |n, _scope| async move { Ok(n * 2) })
            .with_timeout(Duration::from_secs(1));
        assert_eq!(task.id(), TaskId::from("double"));
        assert_eq!(task.timeout(), Some(Duration::from_secs(1)));
        assert_eq!(*task.payload(), 21);

        let output = task.boxed().execute(CancellationScope::new()).await;
        assert_eq!(output, Ok(42));
    }

    #[tokio::test]
    async fn test_fn_task_observes_scope() {
        let scope = CancellationScope::new();
        scope.cancel();
        let task = FnTask::new("wait", (), |_, scope: CancellationScope| async move {
            Err::<(), TaskError>(scope.done().await.into())
        });
        let output = Box::new(task).execute(scope).await;
        assert_eq!(output, Err(TaskError::Cancelled));
    }
}
