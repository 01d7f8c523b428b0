//! Cancellation scopes: deadline and cancellation propagation for task execution.
//!
//! A scope is created per `Dispatcher::start` call (pool-wide) and narrowed per task
//! with [`CancellationScope::child_with_timeout`]. Cancelling a scope cancels every
//! scope derived from it; cancelling a child never affects its parent or siblings.
//!
//! ```text
//! Active -> Cancelled         (explicit cancel, or an ancestor was cancelled)
//! Active -> DeadlineExceeded  (own or inherited deadline elapsed)
//! ```
//!
//! The first reason to fire is latched and reported by [`CancellationScope::err`]
//! from then on.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::ScopeError;

struct ScopeInner {
    token: CancellationToken,
    deadline: Option<Instant>,
    reason: OnceLock<ScopeError>,
    parent: Option<Arc<ScopeInner>>,
}

impl ScopeInner {
    fn expire(&self) {
        // A propagated cancellation that already landed takes precedence.
        if self.token.is_cancelled() && self.reason.get().is_none() {
            return;
        }
        let _ = self.reason.set(ScopeError::DeadlineExceeded);
        self.token.cancel();
    }

    fn resolve(&self) -> Option<ScopeError> {
        if let Some(reason) = self.reason.get() {
            return Some(*reason);
        }
        if self.token.is_cancelled() {
            let inherited = self.parent.as_ref().and_then(|parent| parent.resolve());
            return Some(inherited.unwrap_or(ScopeError::Canceled));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                self.expire();
                return self.resolve();
            }
        }
        None
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        // Releases the deadline timer, if one is armed.
        self.token.cancel();
    }
}

/// A cooperative cancellation scope threaded through every task execution.
///
/// Clone-friendly: all clones observe the same state.
#[derive(Clone)]
pub struct CancellationScope {
    inner: Arc<ScopeInner>,
}

impl CancellationScope {
    /// Create a new root scope with no deadline.
    pub fn new() -> Self {
        Self::build(CancellationToken::new(), None, None, false)
    }

    /// Create a root scope that expires after `timeout`.
    ///
    /// A timeout too large to represent as an instant means no deadline.
    pub fn with_timeout(timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    /// Create a root scope that expires at `deadline`.
    pub fn with_deadline(deadline: Instant) -> Self {
        Self::build(CancellationToken::new(), Some(deadline), None, true)
    }

    /// Derive a child scope that inherits this scope's deadline.
    pub fn child(&self) -> Self {
        Self::build(
            self.inner.token.child_token(),
            self.inner.deadline,
            Some(Arc::clone(&self.inner)),
            false,
        )
    }

    /// Derive a child scope that expires after `timeout` or when this scope ends,
    /// whichever comes first.
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.child_with_deadline(deadline),
            None => self.child(),
        }
    }

    /// Derive a child scope with the earlier of `deadline` and this scope's deadline.
    pub fn child_with_deadline(&self, deadline: Instant) -> Self {
        let (deadline, narrower) = match self.inner.deadline {
            Some(inherited) if inherited <= deadline => (inherited, false),
            _ => (deadline, true),
        };
        Self::build(
            self.inner.token.child_token(),
            Some(deadline),
            Some(Arc::clone(&self.inner)),
            narrower,
        )
    }

    fn build(
        token: CancellationToken,
        deadline: Option<Instant>,
        parent: Option<Arc<ScopeInner>>,
        arm_timer: bool,
    ) -> Self {
        let inner = Arc::new(ScopeInner {
            token,
            deadline,
            reason: OnceLock::new(),
            parent,
        });
        if arm_timer {
            arm_deadline_timer(&inner);
        }
        Self { inner }
    }

    /// Signal cancellation. Idempotent; a scope that already ended keeps its reason.
    pub fn cancel(&self) {
        if self.inner.resolve().is_none() {
            let _ = self.inner.reason.set(ScopeError::Canceled);
        }
        self.inner.token.cancel();
    }

    /// Returns `true` once the scope has been cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Why the scope ended, or `None` while it is still active.
    pub fn err(&self) -> Option<ScopeError> {
        self.inner.resolve()
    }

    /// The effective deadline of this scope, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline; `None` when the scope has no deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Wait until the scope ends and return the reason.
    ///
    /// Returns immediately if the scope has already ended.
    pub async fn done(&self) -> ScopeError {
        if let Some(reason) = self.err() {
            return reason;
        }
        match self.inner.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.inner.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => self.inner.expire(),
                }
            }
            None => self.inner.token.cancelled().await,
        }
        self.err().unwrap_or(ScopeError::Canceled)
    }

    /// Drive `fut` to completion unless the scope ends first.
    ///
    /// When both are ready at the same poll, the scope wins.
    pub async fn run_until_done<F>(&self, fut: F) -> Result<F::Output, ScopeError>
    where
        F: Future,
    {
        tokio::select! {
            biased;
            reason = self.done() => Err(reason),
            output = fut => Ok(output),
        }
    }

    /// The underlying token, for use in hand-written `tokio::select!` loops.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }
}

impl Default for CancellationScope {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellationScope")
            .field("deadline", &self.inner.deadline)
            .field("err", &self.err())
            .finish()
    }
}

fn arm_deadline_timer(inner: &Arc<ScopeInner>) {
    let Some(deadline) = inner.deadline else {
        return;
    };
    // Outside a runtime the deadline is still enforced lazily by `err()` and `done()`.
    let Ok(handle) = tokio::runtime::Handle::try_current() else {
        return;
    };
    let weak: Weak<ScopeInner> = Arc::downgrade(inner);
    let token = inner.token.clone();
    handle.spawn(async move {
        tokio::select! {
            _ = token.cancelled() => {}
            _ = tokio::time::sleep_until(deadline) => {
                if let Some(inner) = weak.upgrade() {
                    inner.expire();
                }
            }
        }
    });
}
