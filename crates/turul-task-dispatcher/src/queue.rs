//! Bounded FIFO task queue with blocking and non-blocking producers.
//!
//! Admission is bounded by a semaphore holding one permit per free slot plus one
//! per consumer currently waiting in [`TaskQueue::pop`]. A capacity of zero
//! therefore behaves as a rendezvous: a push is only admitted while a consumer
//! is ready to take it.
//!
//! The single channel sender lives inside the queue and is dropped by
//! [`TaskQueue::close`], so producers can never send on a closed channel;
//! they get their item back instead.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::{Semaphore, TryAcquireError, mpsc};

/// Returned by [`TaskQueue::push`] when the queue has been closed.
pub struct Closed<T>(pub T);

impl<T> Closed<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> fmt::Debug for Closed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Closed(..)")
    }
}

/// Returned by [`TaskQueue::try_push`]; the rejected item is handed back.
pub enum TryPushError<T> {
    Full(T),
    Closed(T),
}

impl<T> TryPushError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TryPushError::Full(item) | TryPushError::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for TryPushError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TryPushError::Full(_) => f.write_str("Full(..)"),
            TryPushError::Closed(_) => f.write_str("Closed(..)"),
        }
    }
}

/// A bounded multi-producer, multi-consumer FIFO queue.
pub struct TaskQueue<T> {
    capacity: usize,
    slots: Semaphore,
    sender: Mutex<Option<mpsc::UnboundedSender<T>>>,
    receiver: tokio::sync::Mutex<mpsc::UnboundedReceiver<T>>,
    depth: AtomicUsize,
    /// Permits owed by consumers that gave up after a producer used their permit.
    owed: AtomicUsize,
}

impl<T> TaskQueue<T> {
    /// Create an empty queue. Capacity is fixed for the queue's lifetime.
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            capacity,
            slots: Semaphore::new(capacity),
            sender: Mutex::new(Some(sender)),
            receiver: tokio::sync::Mutex::new(receiver),
            depth: AtomicUsize::new(0),
            owed: AtomicUsize::new(0),
        }
    }

    /// Push an item, waiting for a free slot. Returns the item if the queue is closed.
    pub async fn push(&self, item: T) -> Result<(), Closed<T>> {
        match self.slots.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(Closed(item)),
        }
        self.enqueue(item).map_err(Closed)
    }

    /// Push without waiting.
    pub fn try_push(&self, item: T) -> Result<(), TryPushError<T>> {
        match self.slots.try_acquire() {
            Ok(permit) => permit.forget(),
            Err(TryAcquireError::NoPermits) => return Err(TryPushError::Full(item)),
            Err(TryAcquireError::Closed) => return Err(TryPushError::Closed(item)),
        }
        self.enqueue(item).map_err(TryPushError::Closed)
    }

    fn enqueue(&self, item: T) -> Result<(), T> {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = sender.as_ref() else {
            return Err(item);
        };
        self.depth.fetch_add(1, Ordering::AcqRel);
        tx.send(item).map_err(|rejected| {
            self.depth.fetch_sub(1, Ordering::AcqRel);
            rejected.0
        })
    }

    /// Wait for the next item. Returns `None` once the queue is closed and drained.
    ///
    /// Cancel-safe: dropping the future never loses an item, and the admission
    /// granted to this consumer is taken back.
    pub async fn pop(&self) -> Option<T> {
        // One more item may be admitted while this consumer is waiting.
        self.release_slot();
        let mut waiting = WaitingConsumer {
            queue: self,
            armed: true,
        };
        let mut receiver = self.receiver.lock().await;
        let item = receiver.recv().await;
        waiting.armed = false;
        if item.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        item
    }

    fn release_slot(&self) {
        let repaid = self
            .owed
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |owed| owed.checked_sub(1))
            .is_ok();
        if !repaid {
            self.slots.add_permits(1);
        }
    }

    fn reclaim_slot(&self) {
        match self.slots.try_acquire() {
            Ok(permit) => permit.forget(),
            // A producer already used the permit; the next consumer pays it back.
            Err(_) => {
                self.owed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    /// Close the queue: reject further pushes and wake blocked producers.
    ///
    /// Items already queued stay available to [`pop`](Self::pop). Returns `true`
    /// for the call that actually closed the queue.
    pub fn close(&self) -> bool {
        self.slots.close();
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        sender.is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.slots.is_closed()
    }

    /// Current number of queued items.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Takes back a waiting consumer's admission if it leaves without an item.
struct WaitingConsumer<'a, T> {
    queue: &'a TaskQueue<T>,
    armed: bool,
}

impl<T> Drop for WaitingConsumer<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.reclaim_slot();
        }
    }
}

impl<T> fmt::Debug for TaskQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskQueue")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}
