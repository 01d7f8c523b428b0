//! Worker: a long-lived loop pulling tasks from the queue and reporting outcomes.
//!
//! Each worker:
//! - exits when the queue is closed and drained (graceful drain)
//! - exits when the pool scope ends, abandoning queued tasks (forced cancellation)
//! - runs every task under a child scope, so a per-task timeout never affects siblings
//! - drops the task future when its scope ends, so cancellation reaches task bodies
//!   that never check the scope themselves
//! - recovers panics into [`TaskError::Panicked`] and keeps serving

use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use tracing::{Instrument, debug, debug_span, error};

use crate::error::TaskError;
use crate::queue::TaskQueue;
use crate::result::TaskResult;
use crate::scope::CancellationScope;
use crate::sink::BoxedResultSink;
use crate::stats::PoolCounters;
use crate::task::{BoxedTask, TaskId};

/// Index of a worker within its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Lifecycle of a single worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Busy = 1,
    Stopped = 2,
}

impl WorkerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerState::Idle,
            1 => WorkerState::Busy,
            _ => WorkerState::Stopped,
        }
    }
}

/// Shared, lock-free view of one worker's state.
#[derive(Debug)]
pub(crate) struct WorkerSlot {
    id: WorkerId,
    state: AtomicU8,
}

impl WorkerSlot {
    pub(crate) fn new(id: WorkerId) -> Self {
        Self {
            id,
            state: AtomicU8::new(WorkerState::Idle as u8),
        }
    }

    pub(crate) fn id(&self) -> WorkerId {
        self.id
    }

    pub(crate) fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: WorkerState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Everything a worker needs, shared by the whole pool.
pub(crate) struct WorkerContext<O: Send + 'static> {
    pub(crate) queue: Arc<TaskQueue<BoxedTask<O>>>,
    pub(crate) sink: BoxedResultSink<O>,
    pub(crate) scope: CancellationScope,
    pub(crate) counters: Arc<PoolCounters>,
    pub(crate) default_task_timeout: Option<Duration>,
}

pub(crate) struct Worker<O: Send + 'static> {
    slot: Arc<WorkerSlot>,
    ctx: Arc<WorkerContext<O>>,
}

impl<O> Worker<O>
where
    O: Send + 'static,
{
    pub(crate) fn new(slot: Arc<WorkerSlot>, ctx: Arc<WorkerContext<O>>) -> Self {
        Self { slot, ctx }
    }

    /// Serve tasks until the queue is drained or the pool scope ends.
    pub(crate) async fn run(self) {
        let worker_id = self.slot.id();
        let _live = LiveWorker::enter(&self.slot, &self.ctx.counters);
        debug!(worker_id = %worker_id, "Worker started");

        loop {
            let task = tokio::select! {
                biased;
                reason = self.ctx.scope.done() => {
                    debug!(worker_id = %worker_id, reason = %reason, "Worker cancelled");
                    break;
                }
                next = self.ctx.queue.pop() => match next {
                    Some(task) => task,
                    None => {
                        debug!(worker_id = %worker_id, "Queue closed and drained");
                        break;
                    }
                },
            };
            self.execute(task).await;
        }

        debug!(worker_id = %worker_id, "Worker stopped");
    }

    async fn execute(&self, task: BoxedTask<O>) {
        let worker_id = self.slot.id();
        let started = Instant::now();
        let busy = ActiveTask::enter(&self.slot, &self.ctx.counters);

        // Task metadata is user code too: a panic here becomes the task's result.
        let prepared = guard_panics(|| {
            let task_id = task.id();
            let task_scope = match task.timeout().or(self.ctx.default_task_timeout) {
                Some(timeout) => self.ctx.scope.child_with_timeout(timeout),
                None => self.ctx.scope.child(),
            };
            (task_id, task_scope)
        });

        let (task_id, outcome) = match prepared {
            Ok((task_id, task_scope)) => {
                let span = debug_span!("task", task_id = %task_id, worker_id = %worker_id);
                let run = AssertUnwindSafe(CapturePanics::new(task.execute(task_scope.clone())))
                    .catch_unwind();
                let outcome = match task_scope.run_until_done(run).instrument(span).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(payload)) => Err(recover_panic(&task_id, worker_id, payload)),
                    Err(reason) => {
                        debug!(task_id = %task_id, worker_id = %worker_id, reason = %reason, "Task abandoned by scope");
                        Err(reason.into())
                    }
                };
                (task_id, outcome)
            }
            Err(payload) => {
                let task_id = TaskId::generate();
                let error = recover_panic(&task_id, worker_id, payload);
                drop(task);
                (task_id, Err(error))
            }
        };
        let elapsed = started.elapsed();
        drop(busy);

        let failed = outcome.is_err();
        let panicked = matches!(outcome, Err(TaskError::Panicked { .. }));
        let result = TaskResult {
            task_id: task_id.clone(),
            outcome,
            worker_id,
            completed_at: chrono::Utc::now(),
            elapsed,
        };
        let delivered = AssertUnwindSafe(CapturePanics::new(
            self.ctx.sink.deliver(result, &self.ctx.scope),
        ))
        .catch_unwind()
        .await;
        if let Err(payload) = delivered {
            let message = panic_message(payload.as_ref());
            let _ = take_captured_backtrace();
            self.ctx.counters.record_sink_failure();
            error!(
                task_id = %task_id,
                worker_id = %worker_id,
                sink = self.ctx.sink.sink_name(),
                panic = %message,
                "Result sink panicked; result dropped"
            );
        }
        self.ctx.counters.record_completion(failed, panicked);
    }
}

/// Counts a worker as live until it exits, including by unwinding.
struct LiveWorker<'a> {
    slot: &'a WorkerSlot,
    counters: &'a PoolCounters,
}

impl<'a> LiveWorker<'a> {
    fn enter(slot: &'a WorkerSlot, counters: &'a PoolCounters) -> Self {
        counters.live_workers.fetch_add(1, Ordering::AcqRel);
        slot.set_state(WorkerState::Idle);
        Self { slot, counters }
    }
}

impl Drop for LiveWorker<'_> {
    fn drop(&mut self) {
        self.slot.set_state(WorkerState::Stopped);
        self.counters.live_workers.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Marks a worker busy for the lifetime of one task execution.
struct ActiveTask<'a> {
    slot: &'a WorkerSlot,
    counters: &'a PoolCounters,
}

impl<'a> ActiveTask<'a> {
    fn enter(slot: &'a WorkerSlot, counters: &'a PoolCounters) -> Self {
        slot.set_state(WorkerState::Busy);
        counters.active_workers.fetch_add(1, Ordering::AcqRel);
        Self { slot, counters }
    }
}

impl Drop for ActiveTask<'_> {
    fn drop(&mut self) {
        self.counters.active_workers.fetch_sub(1, Ordering::AcqRel);
        if self.slot.state() == WorkerState::Busy {
            self.slot.set_state(WorkerState::Idle);
        }
    }
}

/// Run synchronous task code with panic capture enabled.
fn guard_panics<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    let _guard = CaptureGuard::enter();
    std::panic::catch_unwind(AssertUnwindSafe(f))
}

fn recover_panic(task_id: &TaskId, worker_id: WorkerId, payload: Box<dyn Any + Send>) -> TaskError {
    let message = panic_message(payload.as_ref());
    let stack = take_captured_backtrace().unwrap_or_else(|| "<backtrace unavailable>".to_string());
    error!(
        task_id = %task_id,
        worker_id = %worker_id,
        panic = %message,
        stack = %stack,
        "Task panicked; worker continues"
    );
    TaskError::Panicked { message, stack }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// === Panic backtrace capture ===
//
// A chained panic hook records the backtrace at the panic site into a
// thread-local slot, but only while a task future is being polled. The worker
// that catches the unwind reads the slot on the same thread.

thread_local! {
    static CAPTURING: Cell<bool> = const { Cell::new(false) };
    static CAPTURED_BACKTRACE: RefCell<Option<String>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Install the task panic hook. Panics outside task polls reach the previous hook.
///
/// Installed once per process; a hook set later by the host replaces it and
/// disables stack capture for task panics.
pub(crate) fn install_panic_capture() {
    PANIC_HOOK.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            if CAPTURING.with(Cell::get) {
                let backtrace = Backtrace::force_capture().to_string();
                CAPTURED_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            } else {
                previous(info);
            }
        }));
    });
}

fn take_captured_backtrace() -> Option<String> {
    CAPTURED_BACKTRACE.with(|slot| slot.borrow_mut().take())
}

struct CaptureGuard {
    previous: bool,
}

impl CaptureGuard {
    fn enter() -> Self {
        Self {
            previous: CAPTURING.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for CaptureGuard {
    fn drop(&mut self) {
        CAPTURING.with(|flag| flag.set(self.previous));
    }
}

/// Marks the current thread as polling a task for the duration of each poll.
struct CapturePanics<F> {
    inner: F,
}

impl<F> CapturePanics<F> {
    fn new(inner: F) -> Self {
        Self { inner }
    }
}

impl<F> Future for CapturePanics<F>
where
    F: Future + Unpin,
{
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let _guard = CaptureGuard::enter();
        self.inner.poll_unpin(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CollectingSink, ResultReceiver, ResultSink};
    use crate::task::{FnTask, Task};

    type Harness = (Arc<WorkerContext<u32>>, ResultReceiver<u32>);

    fn harness(capacity: usize, default_task_timeout: Option<Duration>) -> Harness {
        install_panic_capture();
        let (sink, receiver) = CollectingSink::new(16);
        let ctx = Arc::new(WorkerContext {
            queue: Arc::new(TaskQueue::new(capacity)),
            sink: Arc::new(sink),
            scope: CancellationScope::new(),
            counters: Arc::new(PoolCounters::default()),
            default_task_timeout,
        });
        (ctx, receiver)
    }

    fn spawn_worker(ctx: &Arc<WorkerContext<u32>>, index: usize) -> tokio::task::JoinHandle<()> {
        let worker = Worker::new(Arc::new(WorkerSlot::new(WorkerId::new(index))), Arc::clone(ctx));
        tokio::spawn(worker.run())
    }

    #[tokio::test]
    async fn test_worker_executes_and_exits_on_close() {
        let (ctx, mut receiver) = harness(4, None);
        for id in 0..3u64 {
            let task = FnTask::new(id, id as u32, |n, _scope| async move { Ok(n + 1) });
            ctx.queue.push(task.boxed()).await.unwrap();
        }
        ctx.queue.close();

        spawn_worker(&ctx, 0).await.unwrap();

        for expected in 1..=3u32 {
            let result = receiver.recv().await.unwrap();
            assert_eq!(result.value(), Some(&expected));
            assert_eq!(result.worker_id, WorkerId::new(0));
        }
        assert_eq!(ctx.counters.completed.load(Ordering::Relaxed), 3);
        assert_eq!(ctx.counters.live_workers.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_worker_recovers_panic() {
        let (ctx, mut receiver) = harness(4, None);
        let boom = FnTask::new("boom", (), |_, _scope| async move {
            if true {
                panic!("boom");
            }
            Ok(0u32)
        });
        let fine = FnTask::new("fine", 5u32, |n, _scope| async move { Ok(n) });
        ctx.queue.push(boom.boxed()).await.unwrap();
        ctx.queue.push(fine.boxed()).await.unwrap();
        ctx.queue.close();

        spawn_worker(&ctx, 0).await.unwrap();

        let first = receiver.recv().await.unwrap();
        match first.error() {
            Some(TaskError::Panicked { message, stack }) => {
                assert_eq!(message, "boom");
                assert!(!stack.is_empty());
            }
            other => panic!("Expected Panicked, got: {:?}", other),
        }
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.value(), Some(&5));
        assert_eq!(ctx.counters.panicked.load(Ordering::Relaxed), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_task_timeout_applies() {
        let (ctx, mut receiver) = harness(1, Some(Duration::from_millis(20)));
        let slow = FnTask::new("slow", (), |_, _scope| async move {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(1u32)
        });
        ctx.queue.push(slow.boxed()).await.unwrap();
        ctx.queue.close();

        spawn_worker(&ctx, 0).await.unwrap();

        let result = receiver.recv().await.unwrap();
        assert_eq!(result.error(), Some(&TaskError::DeadlineExceeded));
        assert!(!ctx.scope.is_done());
    }

    #[tokio::test]
    async fn test_pool_cancel_abandons_in_flight_task() {
        let (ctx, mut receiver) = harness(1, None);
        let stuck = FnTask::new("stuck", (), |_, _scope| async move {
            futures::future::pending::<()>().await;
            Ok(1u32)
        });
        ctx.queue.push(stuck.boxed()).await.unwrap();
        let handle = spawn_worker(&ctx, 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.scope.cancel();

        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("worker should exit promptly after cancellation")
            .unwrap();
        let result = receiver.recv().await.unwrap();
        assert_eq!(result.error(), Some(&TaskError::Cancelled));
    }

    #[tokio::test]
    async fn test_unrepresentable_timeout_runs_without_deadline() {
        let (ctx, mut receiver) = harness(2, None);
        let huge = FnTask::new("huge", 1u32, |n, _scope| async move { Ok(n) })
            .with_timeout(Duration::MAX);
        let after = FnTask::new("after", 2u32, |n, _scope| async move { Ok(n) });
        ctx.queue.push(huge.boxed()).await.unwrap();
        ctx.queue.push(after.boxed()).await.unwrap();
        ctx.queue.close();

        spawn_worker(&ctx, 0).await.unwrap();

        let first = receiver.recv().await.unwrap();
        assert_eq!(first.task_id, TaskId::from("huge"));
        assert_eq!(first.value(), Some(&1));
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.task_id, TaskId::from("after"));
        assert_eq!(second.value(), Some(&2));
        assert_eq!(ctx.counters.live_workers.load(Ordering::Relaxed), 0);
    }

    struct MissingId;

    #[async_trait::async_trait]
    impl Task for MissingId {
        type Output = u32;

        fn id(&self) -> TaskId {
            panic!("id lookup failed");
        }

        async fn execute(self: Box<Self>, _scope: CancellationScope) -> Result<u32, TaskError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_panicking_metadata_becomes_task_result() {
        let (ctx, mut receiver) = harness(2, None);
        let after = FnTask::new("after", 9u32, |n, _scope| async move { Ok(n) });
        ctx.queue.push(Box::new(MissingId)).await.unwrap();
        ctx.queue.push(after.boxed()).await.unwrap();
        ctx.queue.close();

        spawn_worker(&ctx, 0).await.unwrap();

        let first = receiver.recv().await.unwrap();
        match first.error() {
            Some(TaskError::Panicked { message, .. }) => assert_eq!(message, "id lookup failed"),
            other => panic!("Expected Panicked, got: {:?}", other),
        }
        let second = receiver.recv().await.unwrap();
        assert_eq!(second.value(), Some(&9));
        assert_eq!(ctx.counters.completed.load(Ordering::Relaxed), 2);
        assert_eq!(ctx.counters.active_workers.load(Ordering::Relaxed), 0);
        assert_eq!(ctx.counters.live_workers.load(Ordering::Relaxed), 0);
    }

    struct ExplodingSink {
        calls: std::sync::atomic::AtomicU64,
    }

    #[async_trait::async_trait]
    impl ResultSink<u32> for ExplodingSink {
        fn sink_name(&self) -> &'static str {
            "exploding"
        }

        async fn deliver(&self, _result: TaskResult<u32>, _scope: &CancellationScope) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            panic!("sink unavailable");
        }
    }

    #[tokio::test]
    async fn test_panicking_sink_does_not_stop_worker() {
        install_panic_capture();
        let sink = Arc::new(ExplodingSink {
            calls: std::sync::atomic::AtomicU64::new(0),
        });
        let ctx = Arc::new(WorkerContext {
            queue: Arc::new(TaskQueue::new(2)),
            sink: Arc::clone(&sink) as BoxedResultSink<u32>,
            scope: CancellationScope::new(),
            counters: Arc::new(PoolCounters::default()),
            default_task_timeout: None,
        });
        for id in 0..2u64 {
            let task = FnTask::new(id, 0u32, |n, _scope| async move { Ok(n) });
            ctx.queue.push(task.boxed()).await.unwrap();
        }
        ctx.queue.close();

        spawn_worker(&ctx, 0).await.unwrap();

        assert_eq!(sink.calls.load(Ordering::Relaxed), 2);
        assert_eq!(ctx.counters.completed.load(Ordering::Relaxed), 2);
        assert_eq!(ctx.counters.sink_failures.load(Ordering::Relaxed), 2);
        assert_eq!(ctx.counters.live_workers.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_worker_state_round_trip() {
        let slot = WorkerSlot::new(WorkerId::new(3));
        assert_eq!(slot.state(), WorkerState::Idle);
        slot.set_state(WorkerState::Busy);
        assert_eq!(slot.state(), WorkerState::Busy);
        slot.set_state(WorkerState::Stopped);
        assert_eq!(slot.state(), WorkerState::Stopped);
        assert_eq!(slot.id().to_string(), "worker-3");
    }
}
