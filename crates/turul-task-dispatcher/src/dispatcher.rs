//! Dispatcher: owns the queue and the worker pool, exposes submission and lifecycle.
//!
//! ```text
//! Created -> Running            start()
//! Running -> Draining           shutdown(): queue closed, queued + in-flight tasks finish
//! Draining -> Stopped           all workers exited
//! Running/Draining -> Stopped   pool scope cancelled (queued tasks abandoned)
//! Created -> Stopped            shutdown() before start()
//! ```
//!
//! The queue is closed only by the dispatcher: producers hold no channel sender,
//! so a submit racing with shutdown gets `DispatcherClosed` instead of a fault.

use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{OnceCell, watch};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, trace, warn};

use crate::config::DispatcherConfig;
use crate::error::{DispatchError, Result};
use crate::queue::{TaskQueue, TryPushError};
use crate::scope::CancellationScope;
use crate::sink::{BoxedResultSink, CollectingSink, ResultReceiver};
use crate::stats::{PoolCounters, PoolStats};
use crate::task::{BoxedTask, Task};
use crate::worker::{self, Worker, WorkerContext, WorkerId, WorkerSlot, WorkerState};

/// Lifecycle state of a dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DispatcherState {
    Created,
    Running,
    Draining,
    Stopped,
}

struct DispatcherInner<O: Send + 'static> {
    config: DispatcherConfig,
    queue: Arc<TaskQueue<BoxedTask<O>>>,
    sink: BoxedResultSink<O>,
    results: Mutex<Option<ResultReceiver<O>>>,
    counters: Arc<PoolCounters>,
    state_tx: watch::Sender<DispatcherState>,
    scope: OnceLock<CancellationScope>,
    workers: OnceLock<Vec<Arc<WorkerSlot>>>,
    tracker: TaskTracker,
    shutdown_outcome: OnceCell<Result<()>>,
}

/// A bounded worker-pool dispatcher.
///
/// Cheap to clone; every clone is a handle to the same pool, so submitters on
/// many tasks can share it. When the last handle is dropped without a shutdown
/// the queue is closed: workers finish what was accepted and then exit.
pub struct Dispatcher<O: Send + 'static> {
    inner: Arc<DispatcherInner<O>>,
    _last_handle: Arc<LastHandle<O>>,
}

impl<O: Send + 'static> Clone for Dispatcher<O> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
            _last_handle: Arc::clone(&self._last_handle),
        }
    }
}

/// Shared by every `Dispatcher` clone; dropped with the last one.
struct LastHandle<O: Send + 'static> {
    queue: Arc<TaskQueue<BoxedTask<O>>>,
    name: String,
}

impl<O: Send + 'static> Drop for LastHandle<O> {
    fn drop(&mut self) {
        if self.queue.close() {
            debug!(dispatcher = %self.name, "Last handle dropped; closing queue");
        }
    }
}

impl<O> Dispatcher<O>
where
    O: Send + 'static,
{
    /// Create a dispatcher with `worker_count` workers and a queue of `queue_capacity`.
    ///
    /// Results go to a collecting sink; take its receiver with [`drain`](Self::drain).
    /// Use [`DispatcherBuilder`](crate::DispatcherBuilder) for other sinks.
    pub fn new(worker_count: usize, queue_capacity: usize) -> Result<Self> {
        Self::with_config(DispatcherConfig::new(worker_count, queue_capacity))
    }

    /// Create a dispatcher from a full configuration with a collecting sink.
    pub fn with_config(config: DispatcherConfig) -> Result<Self> {
        config.validate()?;
        let (sink, receiver) = CollectingSink::new(config.result_buffer);
        Ok(Self::from_parts(config, Arc::new(sink), Some(receiver)))
    }

    pub(crate) fn from_parts(
        config: DispatcherConfig,
        sink: BoxedResultSink<O>,
        results: Option<ResultReceiver<O>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(DispatcherState::Created);
        let queue = Arc::new(TaskQueue::new(config.queue_capacity));
        let handles = Arc::new(LastHandle {
            queue: Arc::clone(&queue),
            name: config.name.clone(),
        });
        let inner = DispatcherInner {
            queue,
            sink,
            results: Mutex::new(results),
            counters: Arc::new(PoolCounters::default()),
            state_tx,
            scope: OnceLock::new(),
            workers: OnceLock::new(),
            tracker: TaskTracker::new(),
            shutdown_outcome: OnceCell::new(),
            config,
        };
        Self {
            inner: Arc::new(inner),
            _last_handle: handles,
        }
    }

    /// Start the pool. Workers run under a child of `scope`: cancelling `scope`
    /// stops the pool, and a forced shutdown never cancels the caller's scope.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// The first `start` in a process installs a panic hook that records task
    /// panic backtraces and forwards every other panic to the hook that was
    /// installed before it. A hook set by the application after that replaces
    /// it, and panicking tasks are then reported with
    /// `<backtrace unavailable>` as their stack.
    pub fn start(&self, scope: CancellationScope) -> Result<()> {
        let mut previous = DispatcherState::Created;
        self.inner.state_tx.send_if_modified(|state| {
            previous = *state;
            if *state == DispatcherState::Created {
                *state = DispatcherState::Running;
                true
            } else {
                false
            }
        });
        if previous != DispatcherState::Created {
            return Err(if self.inner.scope.get().is_none() {
                DispatchError::DispatcherClosed
            } else {
                DispatchError::AlreadyStarted
            });
        }

        worker::install_panic_capture();

        let pool_scope = scope.child();
        let _ = self.inner.scope.set(pool_scope.clone());

        let ctx = Arc::new(WorkerContext {
            queue: Arc::clone(&self.inner.queue),
            sink: Arc::clone(&self.inner.sink),
            scope: pool_scope,
            counters: Arc::clone(&self.inner.counters),
            default_task_timeout: self.inner.config.default_task_timeout(),
        });

        let slots: Vec<Arc<WorkerSlot>> = (0..self.inner.config.worker_count)
            .map(|index| Arc::new(WorkerSlot::new(WorkerId::new(index))))
            .collect();
        for slot in &slots {
            let worker = Worker::new(Arc::clone(slot), Arc::clone(&ctx));
            self.inner.tracker.spawn(worker.run());
        }
        let _ = self.inner.workers.set(slots);
        self.inner.tracker.close();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.tracker.wait().await;
            inner.queue.close();
            inner.sink.close();
            inner.state_tx.send_replace(DispatcherState::Stopped);
            info!(
                dispatcher = %inner.config.name,
                abandoned = inner.queue.len(),
                "Dispatcher stopped"
            );
        });

        info!(
            dispatcher = %self.inner.config.name,
            workers = self.inner.config.worker_count,
            queue_capacity = self.inner.config.queue_capacity,
            sink = self.inner.sink.sink_name(),
            "Dispatcher started"
        );
        Ok(())
    }

    /// Enqueue a task, waiting while the queue is full.
    ///
    /// Returns `DispatcherClosed` once shutdown has begun or the pool scope has ended,
    /// including while this call is waiting for a slot.
    pub async fn submit<T>(&self, task: T) -> Result<()>
    where
        T: Task<Output = O>,
    {
        self.submit_boxed(Box::new(task)).await
    }

    /// [`submit`](Self::submit) for an already boxed task.
    pub async fn submit_boxed(&self, task: BoxedTask<O>) -> Result<()> {
        let scope = self.accepting_scope()?;
        tokio::select! {
            biased;
            _ = scope.done() => Err(DispatchError::DispatcherClosed),
            pushed = self.inner.queue.push(task) => match pushed {
                Ok(()) => {
                    self.inner.counters.record_submitted();
                    trace!(queued = self.inner.queue.len(), "Task submitted");
                    Ok(())
                }
                Err(_) => Err(DispatchError::DispatcherClosed),
            },
        }
    }

    /// Enqueue a task without waiting. Rejects with `QueueFull` for load shedding.
    pub fn try_submit<T>(&self, task: T) -> Result<()>
    where
        T: Task<Output = O>,
    {
        self.try_submit_boxed(Box::new(task))
    }

    /// [`try_submit`](Self::try_submit) for an already boxed task.
    pub fn try_submit_boxed(&self, task: BoxedTask<O>) -> Result<()> {
        self.accepting_scope()?;
        match self.inner.queue.try_push(task) {
            Ok(()) => {
                self.inner.counters.record_submitted();
                Ok(())
            }
            Err(TryPushError::Full(_)) => {
                self.inner.counters.record_rejected();
                debug!(
                    dispatcher = %self.inner.config.name,
                    capacity = self.inner.queue.capacity(),
                    "Task rejected: queue full"
                );
                Err(DispatchError::QueueFull)
            }
            Err(TryPushError::Closed(_)) => Err(DispatchError::DispatcherClosed),
        }
    }

    fn accepting_scope(&self) -> Result<&CancellationScope> {
        match *self.inner.state_tx.borrow() {
            DispatcherState::Created => return Err(DispatchError::NotStarted),
            DispatcherState::Running => {}
            DispatcherState::Draining | DispatcherState::Stopped => {
                return Err(DispatchError::DispatcherClosed);
            }
        }
        let scope = self.inner.scope.get().ok_or(DispatchError::NotStarted)?;
        if scope.is_done() {
            return Err(DispatchError::DispatcherClosed);
        }
        Ok(scope)
    }

    /// Stop accepting tasks and wait up to `drain_timeout` for queued and in-flight
    /// tasks to finish.
    ///
    /// On timeout the pool scope is cancelled, workers get `cancel_grace` to exit,
    /// and `DrainTimeout` is returned. Safe to call repeatedly or concurrently:
    /// every call returns the outcome of the first.
    pub async fn shutdown(&self, drain_timeout: Duration) -> Result<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .shutdown_outcome
            .get_or_init(|| async move { inner.drain_and_stop(drain_timeout).await })
            .await
            .clone()
    }

    /// [`shutdown`](Self::shutdown) with the configured drain timeout.
    pub async fn shutdown_gracefully(&self) -> Result<()> {
        self.shutdown(self.inner.config.drain_timeout()).await
    }

    /// Block until the dispatcher is `Stopped`, by drain or by cancellation.
    pub async fn wait(&self) {
        self.inner.wait_stopped().await;
    }

    /// Take the collecting sink's receiver. Returns `None` if another caller took it
    /// or the dispatcher was built with a different sink.
    pub fn drain(&self) -> Option<ResultReceiver<O>> {
        self.inner
            .results
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Snapshot of pool bookkeeping. A pure read, safe for concurrent polling.
    pub fn stats(&self) -> PoolStats {
        self.inner.counters.snapshot(
            self.state(),
            self.inner.config.worker_count,
            self.inner.queue.len(),
            self.inner.sink.dropped(),
        )
    }

    /// Current state of every worker; empty before `start`.
    pub fn workers(&self) -> Vec<(WorkerId, WorkerState)> {
        self.inner
            .workers
            .get()
            .map(|slots| slots.iter().map(|slot| (slot.id(), slot.state())).collect())
            .unwrap_or_default()
    }

    pub fn state(&self) -> DispatcherState {
        *self.inner.state_tx.borrow()
    }

    /// The pool-wide scope, once started.
    pub fn scope(&self) -> Option<&CancellationScope> {
        self.inner.scope.get()
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }
}

impl<O: Send + 'static> DispatcherInner<O> {
    async fn wait_stopped(&self) {
        let mut rx = self.state_tx.subscribe();
        // The sender lives as long as `self`, so this only returns once stopped.
        let _ = rx.wait_for(|state| *state == DispatcherState::Stopped).await;
    }

    async fn drain_and_stop(&self, drain_timeout: Duration) -> Result<()> {
        let mut previous = DispatcherState::Created;
        self.state_tx.send_modify(|state| {
            previous = *state;
            *state = match *state {
                DispatcherState::Created => DispatcherState::Stopped,
                DispatcherState::Running => DispatcherState::Draining,
                other => other,
            };
        });

        let scope = match (previous, self.scope.get()) {
            (DispatcherState::Created, _) | (_, None) => {
                self.queue.close();
                self.sink.close();
                info!(dispatcher = %self.config.name, "Dispatcher shut down before start");
                return Ok(());
            }
            (_, Some(scope)) => scope,
        };

        if previous == DispatcherState::Stopped {
            return scope.err().map_or(Ok(()), |reason| Err(DispatchError::ScopeEnded(reason)));
        }

        info!(
            dispatcher = %self.config.name,
            queued = self.queue.len(),
            drain_timeout_ms = drain_timeout.as_millis() as u64,
            "Draining dispatcher"
        );
        self.queue.close();

        if tokio::time::timeout(drain_timeout, self.wait_stopped())
            .await
            .is_ok()
        {
            return match scope.err() {
                None => {
                    info!(dispatcher = %self.config.name, "Dispatcher drained");
                    Ok(())
                }
                Some(reason) => {
                    warn!(dispatcher = %self.config.name, reason = %reason, "Scope ended during drain");
                    Err(DispatchError::ScopeEnded(reason))
                }
            };
        }

        warn!(
            dispatcher = %self.config.name,
            queued = self.queue.len(),
            "Drain timed out; cancelling in-flight tasks"
        );
        scope.cancel();
        if tokio::time::timeout(self.config.cancel_grace(), self.wait_stopped())
            .await
            .is_err()
        {
            error!(
                dispatcher = %self.config.name,
                grace_ms = self.config.cancel_grace_ms,
                "Workers did not stop within the cancellation grace period"
            );
        }
        Err(DispatchError::DrainTimeout { drain_timeout })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TaskError;
    use crate::task::FnTask;

    fn quick(id: u64) -> BoxedTask<u64> {
        FnTask::new(id, id, |n, _scope| async move { Ok(n) }).boxed()
    }

    #[test]
    fn test_new_rejects_zero_workers() {
        assert!(matches!(
            Dispatcher::<u64>::new(0, 1),
            Err(DispatchError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_start_twice_is_error() {
        let dispatcher = Dispatcher::<u64>::new(1, 1).unwrap();
        dispatcher.start(CancellationScope::new()).unwrap();
        assert_eq!(
            dispatcher.start(CancellationScope::new()),
            Err(DispatchError::AlreadyStarted)
        );
        dispatcher.shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_submit_before_start_is_rejected() {
        let dispatcher = Dispatcher::<u64>::new(1, 1).unwrap();
        assert_eq!(
            dispatcher.submit_boxed(quick(1)).await,
            Err(DispatchError::NotStarted)
        );
        assert_eq!(
            dispatcher.try_submit_boxed(quick(2)),
            Err(DispatchError::NotStarted)
        );
    }

    #[tokio::test]
    async fn test_shutdown_before_start_stops() {
        let dispatcher = Dispatcher::<u64>::new(1, 1).unwrap();
        dispatcher.shutdown(Duration::from_millis(10)).await.unwrap();
        assert_eq!(dispatcher.state(), DispatcherState::Stopped);
        dispatcher.wait().await;
        assert_eq!(
            dispatcher.start(CancellationScope::new()),
            Err(DispatchError::DispatcherClosed)
        );
    }

    #[tokio::test]
    async fn test_submit_and_drain_results() {
        let dispatcher = Dispatcher::new(2, 4).unwrap();
        let mut results = dispatcher.drain().unwrap();
        assert!(dispatcher.drain().is_none());

        dispatcher.start(CancellationScope::new()).unwrap();
        for id in 0..4 {
            dispatcher.submit_boxed(quick(id)).await.unwrap();
        }
        dispatcher.shutdown(Duration::from_secs(1)).await.unwrap();

        let mut values: Vec<u64> = results
            .collect_all()
            .await
            .into_iter()
            .map(|r| r.outcome.unwrap())
            .collect();
        values.sort_unstable();
        assert_eq!(values, vec![0, 1, 2, 3]);

        let stats = dispatcher.stats();
        assert_eq!(stats.state, DispatcherState::Stopped);
        assert_eq!(stats.submitted_count, 4);
        assert_eq!(stats.completed_count, 4);
        assert_eq!(stats.active_workers, 0);
    }

    #[tokio::test]
    async fn test_submit_after_shutdown_is_closed() {
        let dispatcher = Dispatcher::new(1, 1).unwrap();
        dispatcher.start(CancellationScope::new()).unwrap();
        dispatcher.shutdown(Duration::from_secs(1)).await.unwrap();
        assert_eq!(
            dispatcher.submit_boxed(quick(1)).await,
            Err(DispatchError::DispatcherClosed)
        );
        assert_eq!(
            dispatcher.try_submit_boxed(quick(2)),
            Err(DispatchError::DispatcherClosed)
        );
    }

    #[tokio::test]
    async fn test_external_cancel_stops_pool() {
        let root = CancellationScope::new();
        let dispatcher = Dispatcher::<u64>::new(2, 1).unwrap();
        dispatcher.start(root.clone()).unwrap();
        root.cancel();

        tokio::time::timeout(Duration::from_secs(1), dispatcher.wait())
            .await
            .expect("cancelling the parent scope should stop the pool");
        assert_eq!(
            dispatcher.shutdown(Duration::from_millis(10)).await,
            Err(DispatchError::ScopeEnded(crate::error::ScopeError::Canceled))
        );
    }

    #[tokio::test]
    async fn test_forced_shutdown_leaves_caller_scope_alive() {
        let root = CancellationScope::new();
        let dispatcher = Dispatcher::new(1, 1).unwrap();
        dispatcher.start(root.clone()).unwrap();
        let stuck = FnTask::new("stuck", (), |_, _scope| async move {
            futures::future::pending::<()>().await;
            Ok::<u64, TaskError>(0)
        });
        dispatcher.submit(stuck).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let outcome = dispatcher.shutdown(Duration::from_millis(10)).await;
        assert!(matches!(outcome, Err(DispatchError::DrainTimeout { .. })));
        assert!(!root.is_done());
        assert!(dispatcher.scope().unwrap().is_done());
    }

    #[tokio::test]
    async fn test_workers_reported_after_start() {
        let dispatcher = Dispatcher::<u64>::new(3, 0).unwrap();
        assert!(dispatcher.workers().is_empty());
        dispatcher.start(CancellationScope::new()).unwrap();
        let workers = dispatcher.workers();
        assert_eq!(workers.len(), 3);
        assert_eq!(workers[2].0, WorkerId::new(2));
        dispatcher.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(
            dispatcher
                .workers()
                .iter()
                .all(|(_, state)| *state == WorkerState::Stopped)
        );
    }
}
