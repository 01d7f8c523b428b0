//! Result sinks: where workers hand completed task outcomes.
//!
//! Separates *how tasks run* from *how results are consumed*:
//! - [`CollectingSink`]: fan-in over a bounded channel, drained by the caller
//! - [`CallbackSink`]: push-style `on_result` callback
//! - [`FireAndForgetSink`]: logged and counted, never blocks a worker

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::result::TaskResult;
use crate::scope::CancellationScope;

/// Receives completed task outcomes from workers.
#[async_trait]
pub trait ResultSink<O>: Send + Sync {
    /// Human-readable name of the sink (e.g., "collecting", "callback")
    fn sink_name(&self) -> &'static str;

    /// Deliver one result. Must return promptly once `scope` is done.
    async fn deliver(&self, result: TaskResult<O>, scope: &CancellationScope);

    /// Number of results dropped because a consumer could not keep up.
    fn dropped(&self) -> u64 {
        0
    }

    /// Called once after every worker has exited; no further deliveries follow.
    fn close(&self) {}
}

/// Shared sink handle held by every worker.
pub type BoxedResultSink<O> = Arc<dyn ResultSink<O>>;

/// Pull side of a [`CollectingSink`] or a [`FireAndForgetSink`] tap.
pub struct ResultReceiver<O> {
    rx: mpsc::Receiver<TaskResult<O>>,
}

impl<O> ResultReceiver<O> {
    /// Receive the next result; `None` once the dispatcher has stopped and the
    /// buffer is empty.
    pub async fn recv(&mut self) -> Option<TaskResult<O>> {
        self.rx.recv().await
    }

    /// Receive without waiting.
    pub fn try_recv(&mut self) -> Option<TaskResult<O>> {
        self.rx.try_recv().ok()
    }

    /// Receive every remaining result until the channel ends.
    pub async fn collect_all(&mut self) -> Vec<TaskResult<O>> {
        let mut results = Vec::new();
        while let Some(result) = self.rx.recv().await {
            results.push(result);
        }
        results
    }

    /// Number of results currently buffered.
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

impl<O> fmt::Debug for ResultReceiver<O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultReceiver")
            .field("buffered", &self.rx.len())
            .finish()
    }
}

fn channel<O>(buffer: usize) -> (mpsc::Sender<TaskResult<O>>, ResultReceiver<O>) {
    let (tx, rx) = mpsc::channel(buffer.max(1));
    (tx, ResultReceiver { rx })
}

/// Places results on a bounded channel for the original caller to drain.
///
/// While the pool scope is live a full buffer applies backpressure to the worker.
/// Once the scope is done delivery degrades to a non-blocking send so a stalled
/// consumer cannot hold workers past cancellation; overflow is dropped and counted.
pub struct CollectingSink<O> {
    tx: Mutex<Option<mpsc::Sender<TaskResult<O>>>>,
    dropped: AtomicU64,
}

impl<O> CollectingSink<O>
where
    O: Send + 'static,
{
    pub fn new(buffer: usize) -> (Self, ResultReceiver<O>) {
        let (tx, receiver) = channel(buffer);
        let sink = Self {
            tx: Mutex::new(Some(tx)),
            dropped: AtomicU64::new(0),
        };
        (sink, receiver)
    }

    fn sender(&self) -> Option<mpsc::Sender<TaskResult<O>>> {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn count_drop(&self, result: &TaskResult<O>, reason: &str) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
        warn!(task_id = %result.task_id, reason, "Dropped task result");
    }
}

#[async_trait]
impl<O> ResultSink<O> for CollectingSink<O>
where
    O: Send + 'static,
{
    fn sink_name(&self) -> &'static str {
        "collecting"
    }

    async fn deliver(&self, result: TaskResult<O>, scope: &CancellationScope) {
        let Some(tx) = self.sender() else {
            self.count_drop(&result, "sink closed");
            return;
        };

        if !scope.is_done() {
            tokio::select! {
                permit = tx.reserve() => {
                    match permit {
                        Ok(permit) => permit.send(result),
                        Err(_) => self.count_drop(&result, "receiver dropped"),
                    }
                    return;
                }
                _ = scope.done() => {}
            }
        }

        match tx.try_send(result) {
            Ok(()) => {}
            Err(TrySendError::Full(result)) => self.count_drop(&result, "buffer full"),
            Err(TrySendError::Closed(result)) => self.count_drop(&result, "receiver dropped"),
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

/// Push-style sink invoking a callback for every result.
///
/// The callback runs on the worker; it should hand off rather than block.
pub struct CallbackSink<O> {
    callback: Arc<dyn Fn(TaskResult<O>) + Send + Sync>,
    failures: AtomicU64,
}

impl<O> CallbackSink<O> {
    pub fn new<F>(callback: F) -> Self
    where
        F: Fn(TaskResult<O>) + Send + Sync + 'static,
    {
        Self {
            callback: Arc::new(callback),
            failures: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl<O> ResultSink<O> for CallbackSink<O>
where
    O: Send + 'static,
{
    fn sink_name(&self) -> &'static str {
        "callback"
    }

    async fn deliver(&self, result: TaskResult<O>, _scope: &CancellationScope) {
        let task_id = result.task_id.clone();
        let callback = AssertUnwindSafe(|| (self.callback)(result));
        if std::panic::catch_unwind(callback).is_err() {
            self.failures.fetch_add(1, Ordering::Relaxed);
            warn!(task_id = %task_id, "Result callback panicked");
        }
    }

    fn dropped(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Background-job sink: results are logged and counted, nobody waits on them.
///
/// An optional observer tap receives copies through a non-blocking send;
/// when the tap is full the result is dropped and counted instead.
pub struct FireAndForgetSink<O> {
    tap: Mutex<Option<mpsc::Sender<TaskResult<O>>>>,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl<O> FireAndForgetSink<O>
where
    O: Send + 'static,
{
    pub fn new() -> Self {
        Self {
            tap: Mutex::new(None),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Attach an observer tap with room for `buffer` results.
    pub fn with_tap(buffer: usize) -> (Self, ResultReceiver<O>) {
        let (tx, receiver) = channel(buffer);
        let sink = Self {
            tap: Mutex::new(Some(tx)),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        };
        (sink, receiver)
    }

    /// Number of results seen by this sink.
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl<O> Default for FireAndForgetSink<O>
where
    O: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<O> ResultSink<O> for FireAndForgetSink<O>
where
    O: Send + 'static,
{
    fn sink_name(&self) -> &'static str {
        "fire-and-forget"
    }

    async fn deliver(&self, result: TaskResult<O>, _scope: &CancellationScope) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        match &result.outcome {
            Ok(_) => debug!(
                task_id = %result.task_id,
                worker_id = %result.worker_id,
                elapsed_ms = result.elapsed.as_millis() as u64,
                "Task completed"
            ),
            Err(e) => warn!(
                task_id = %result.task_id,
                worker_id = %result.worker_id,
                error = %e,
                "Task failed"
            ),
        }

        let tap = self.tap.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tap) = tap.as_ref()
            && tap.try_send(result).is_err()
        {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn close(&self) {
        self.tap.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::task::TaskId;
    use crate::worker::WorkerId;
    use std::time::Duration;

    fn make_result(id: u64, outcome: Result<u32, TaskError>) -> TaskResult<u32> {
        TaskResult {
            task_id: TaskId::from(id),
            outcome,
            worker_id: WorkerId::new(0),
            completed_at: chrono::Utc::now(),
            elapsed: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_collecting_sink_delivers_in_order() {
        let (sink, mut receiver) = CollectingSink::new(4);
        let scope = CancellationScope::new();
        sink.deliver(make_result(1, Ok(10)), &scope).await;
        sink.deliver(make_result(2, Err(TaskError::failed("nope"))), &scope)
            .await;

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.task_id, TaskId::from(1u64));
        assert_eq!(first.value(), Some(&10));
        let second = receiver.recv().await.unwrap();
        assert!(matches!(second.error(), Some(TaskError::Failed(_))));
        assert_eq!(sink.dropped(), 0);
    }

    #[tokio::test]
    async fn test_collecting_sink_drops_when_scope_done_and_full() {
        let (sink, mut receiver) = CollectingSink::new(1);
        let scope = CancellationScope::new();
        sink.deliver(make_result(1, Ok(1)), &scope).await;

        scope.cancel();
        tokio::time::timeout(
            Duration::from_millis(100),
            sink.deliver(make_result(2, Ok(2)), &scope),
        )
        .await
        .expect("delivery must not block after cancellation");
        assert_eq!(sink.dropped(), 1);
        assert_eq!(receiver.len(), 1);
    }

    #[tokio::test]
    async fn test_collecting_sink_unblocks_on_cancel() {
        let (sink, _receiver) = CollectingSink::new(1);
        let sink = Arc::new(sink);
        let scope = CancellationScope::new();
        sink.deliver(make_result(1, Ok(1)), &scope).await;

        let blocked = {
            let sink = Arc::clone(&sink);
            let scope = scope.clone();
            tokio::spawn(async move { sink.deliver(make_result(2, Ok(2)), &scope).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!blocked.is_finished());

        scope.cancel();
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("blocked delivery should resolve on cancel")
            .unwrap();
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn test_collecting_sink_close_ends_receiver() {
        let (sink, mut receiver) = CollectingSink::new(4);
        let scope = CancellationScope::new();
        sink.deliver(make_result(1, Ok(1)), &scope).await;
        sink.close();

        let all = receiver.collect_all().await;
        assert_eq!(all.len(), 1);

        sink.deliver(make_result(2, Ok(2)), &scope).await;
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn test_callback_sink_invokes_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = Arc::clone(&seen);
            CallbackSink::new(move |result: TaskResult<u32>| {
                seen.lock().unwrap().push(result.task_id);
            })
        };
        sink.deliver(make_result(3, Ok(3)), &CancellationScope::new())
            .await;
        assert_eq!(*seen.lock().unwrap(), vec![TaskId::from(3u64)]);
    }

    #[tokio::test]
    async fn test_callback_sink_survives_panicking_callback() {
        let sink = CallbackSink::new(|_: TaskResult<u32>| panic!("callback boom"));
        sink.deliver(make_result(4, Ok(4)), &CancellationScope::new())
            .await;
        assert_eq!(sink.dropped(), 1);
    }

    #[tokio::test]
    async fn test_fire_and_forget_never_blocks() {
        let (sink, mut tap) = FireAndForgetSink::with_tap(2);
        let scope = CancellationScope::new();

        tokio::time::timeout(Duration::from_millis(100), async {
            for id in 0..5 {
                sink.deliver(make_result(id, Ok(id as u32)), &scope).await;
            }
        })
        .await
        .expect("fire-and-forget delivery must never block");

        assert_eq!(sink.delivered(), 5);
        assert_eq!(sink.dropped(), 3);
        assert_eq!(tap.recv().await.unwrap().task_id, TaskId::from(0u64));
    }

    #[tokio::test]
    async fn test_fire_and_forget_without_tap_drops_nothing() {
        let sink = FireAndForgetSink::<u32>::new();
        sink.deliver(make_result(1, Err(TaskError::Cancelled)), &CancellationScope::new())
            .await;
        assert_eq!(sink.delivered(), 1);
        assert_eq!(sink.dropped(), 0);
    }
}
