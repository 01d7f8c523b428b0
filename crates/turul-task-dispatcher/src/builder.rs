//! Dispatcher Builder
//!
//! This module provides a builder pattern for creating dispatchers with a chosen
//! result sink.

use std::sync::Arc;
use std::time::Duration;

use crate::config::DispatcherConfig;
use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, Result};
use crate::result::TaskResult;
use crate::sink::{
    BoxedResultSink, CallbackSink, CollectingSink, FireAndForgetSink, ResultReceiver, ResultSink,
};

enum SinkChoice<O> {
    Collect,
    Callback(Box<dyn Fn(TaskResult<O>) + Send + Sync>),
    FireAndForget { tap: Option<usize> },
    Custom(BoxedResultSink<O>),
}

/// Builder for dispatchers
pub struct DispatcherBuilder<O> {
    /// Pool configuration
    config: DispatcherConfig,

    /// Where results go (defaults to a collecting sink)
    sink: SinkChoice<O>,

    /// Validation errors collected during builder configuration
    validation_errors: Vec<String>,
}

impl<O> DispatcherBuilder<O>
where
    O: Send + 'static,
{
    /// Create a new builder with the default configuration
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
            sink: SinkChoice::Collect,
            validation_errors: Vec::new(),
        }
    }

    /// Replace the whole configuration (e.g. one loaded from a file)
    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the name used in log output
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the number of workers
    pub fn workers(mut self, worker_count: usize) -> Self {
        self.config.worker_count = worker_count;
        self
    }

    /// Set the queue capacity (0 = rendezvous)
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.config.queue_capacity = capacity;
        self
    }

    /// Timeout for tasks that do not set their own
    pub fn default_task_timeout(mut self, timeout: Duration) -> Self {
        match u64::try_from(timeout.as_millis()) {
            Ok(ms) => self.config.default_task_timeout_ms = Some(ms),
            Err(_) => self
                .validation_errors
                .push(format!("default task timeout {timeout:?} is out of range")),
        }
        self
    }

    /// Drain budget used by `shutdown_gracefully`
    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.config.drain_timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Grace period for workers after a forced cancellation
    pub fn cancel_grace(mut self, grace: Duration) -> Self {
        self.config.cancel_grace_ms = grace.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Collect results on a bounded channel; take it with `Dispatcher::drain`
    pub fn collect_results(mut self, buffer: usize) -> Self {
        self.config.result_buffer = buffer;
        self.sink = SinkChoice::Collect;
        self
    }

    /// Push every result to `callback` as it completes
    pub fn on_result<F>(mut self, callback: F) -> Self
    where
        F: Fn(TaskResult<O>) + Send + Sync + 'static,
    {
        self.sink = SinkChoice::Callback(Box::new(callback));
        self
    }

    /// Log and count results without keeping them
    pub fn fire_and_forget(mut self) -> Self {
        self.sink = SinkChoice::FireAndForget { tap: None };
        self
    }

    /// Log and count results, copying them to a tap of `buffer` results that
    /// drops on overflow. Take the tap with `Dispatcher::drain`.
    pub fn fire_and_forget_with_tap(mut self, buffer: usize) -> Self {
        if buffer == 0 {
            self.validation_errors
                .push("fire-and-forget tap buffer must be >= 1".to_string());
        }
        self.sink = SinkChoice::FireAndForget { tap: Some(buffer) };
        self
    }

    /// Use a custom sink
    pub fn sink<S>(mut self, sink: S) -> Self
    where
        S: ResultSink<O> + 'static,
    {
        self.sink = SinkChoice::Custom(Arc::new(sink));
        self
    }

    /// Build the dispatcher. Misconfiguration fails here, never at runtime.
    pub fn build(self) -> Result<Dispatcher<O>> {
        let mut errors = self.validation_errors;
        if let Err(DispatchError::InvalidConfig(msg)) = self.config.validate() {
            errors.push(msg);
        }
        if !errors.is_empty() {
            return Err(DispatchError::InvalidConfig(errors.join("; ")));
        }

        let (sink, results): (BoxedResultSink<O>, Option<ResultReceiver<O>>) = match self.sink {
            SinkChoice::Collect => {
                let (sink, receiver) = CollectingSink::new(self.config.result_buffer);
                (Arc::new(sink), Some(receiver))
            }
            SinkChoice::Callback(callback) => {
                (Arc::new(CallbackSink::new(move |result| callback(result))), None)
            }
            SinkChoice::FireAndForget { tap: None } => (Arc::new(FireAndForgetSink::new()), None),
            SinkChoice::FireAndForget { tap: Some(buffer) } => {
                let (sink, receiver) = FireAndForgetSink::with_tap(buffer);
                (Arc::new(sink), Some(receiver))
            }
            SinkChoice::Custom(sink) => (sink, None),
        };

        Ok(Dispatcher::from_parts(self.config, sink, results))
    }
}

impl<O> Default for DispatcherBuilder<O>
where
    O: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<O> Dispatcher<O>
where
    O: Send + 'static,
{
    /// Create a builder for configuring a dispatcher
    pub fn builder() -> DispatcherBuilder<O> {
        DispatcherBuilder::new()
    }
}
