//! # Turul Task Dispatcher
//!
//! **Bounded worker-pool dispatcher with scoped cancellation, per-task timeouts,
//! panic isolation and pluggable result delivery.**
//!
//! A fixed number of long-lived workers pull tasks from a bounded FIFO queue.
//! Submission blocks (or, with `try_submit`, is rejected) when the queue is full,
//! so producers feel backpressure instead of spawning unbounded work. Every task
//! runs under a [`CancellationScope`] derived from the pool scope, so cancelling
//! the caller's scope, a task deadline, or a forced shutdown reaches the task body.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use turul_task_dispatcher::prelude::*;
//!
//! # async fn example() -> Result<(), DispatchError> {
//! let dispatcher = Dispatcher::builder()
//!     .name("reports")
//!     .workers(4)
//!     .queue_capacity(16)
//!     .default_task_timeout(Duration::from_secs(5))
//!     .build()?;
//! let mut results = dispatcher.drain().expect("collecting sink");
//!
//! dispatcher.start(CancellationScope::new())?;
//! for n in 0..8u64 {
//!     let task = FnTask::new(n, n, |n, _scope| async move { Ok(n * n) });
//!     dispatcher.submit(task).await?;
//! }
//! dispatcher.shutdown(Duration::from_secs(10)).await?;
//!
//! for result in results.collect_all().await {
//!     println!("{} -> {:?}", result.task_id, result.outcome);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **`Dispatcher`**: owns the queue and workers; `start`, `submit`, `try_submit`,
//!   `shutdown`, `wait`, `drain`, `stats`
//! - **`TaskQueue`**: bounded FIFO with close-once semantics; capacity 0 is a rendezvous
//! - **`CancellationScope`**: tree of cancellation with sticky reasons and deadlines
//! - **`ResultSink`**: collecting channel, callback, or fire-and-forget delivery
//! - **`PoolStats`**: serializable snapshot of pool bookkeeping

pub mod builder;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod prelude;
pub mod queue;
pub mod result;
pub mod scope;
pub mod sink;
pub mod stats;
pub mod task;
pub mod worker;

// Re-exports for convenience
pub use builder::DispatcherBuilder;
pub use config::DispatcherConfig;
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::{DispatchError, Result, ScopeError, TaskError};
pub use queue::{Closed, TaskQueue, TryPushError};
pub use result::TaskResult;
pub use scope::CancellationScope;
pub use sink::{
    BoxedResultSink, CallbackSink, CollectingSink, FireAndForgetSink, ResultReceiver, ResultSink,
};
pub use stats::PoolStats;
pub use task::{BoxedTask, FnTask, Task, TaskId};
pub use worker::{WorkerId, WorkerState};

// Re-export async_trait so custom tasks and sinks need no extra dependency
pub use async_trait::async_trait;
