//! Prelude module for convenient imports.
//!
//! ```rust,no_run
//! use turul_task_dispatcher::prelude::*;
//! ```

pub use crate::builder::DispatcherBuilder;
pub use crate::config::DispatcherConfig;
pub use crate::dispatcher::{Dispatcher, DispatcherState};
pub use crate::error::{DispatchError, ScopeError, TaskError};
pub use crate::result::TaskResult;
pub use crate::scope::CancellationScope;
pub use crate::sink::{
    BoxedResultSink, CallbackSink, CollectingSink, FireAndForgetSink, ResultReceiver, ResultSink,
};
pub use crate::stats::PoolStats;
pub use crate::task::{BoxedTask, FnTask, Task, TaskId};
pub use crate::worker::{WorkerId, WorkerState};
pub use async_trait::async_trait;
