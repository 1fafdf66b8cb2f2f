use crate::cancel::CancellationToken;
use crate::error::QueueError;
use crossbeam::queue::ArrayQueue;
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on how long a blocked queue operation goes without
/// re-checking its cancellation token.
pub const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Wake-up channel shared by one or more queues.
///
/// Every state change (put, take, close) bumps a generation counter.
/// Waiters read the generation before inspecting queue state and only
/// sleep if it is unchanged, so no wake-up can be missed.
#[derive(Debug, Default)]
pub struct Notify {
    generation: Mutex<u64>,
    changed: Condvar,
}

impl Notify {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation, to be read before checking state
    pub fn generation(&self) -> u64 {
        *self.generation.lock()
    }

    /// Signal a state change to all waiters
    pub fn ring(&self) {
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.changed.notify_all();
    }

    /// Sleep until the generation moves past `observed` or `timeout` elapses
    pub fn wait(&self, observed: u64, timeout: Duration) {
        let mut generation = self.generation.lock();
        if *generation == observed {
            self.changed.wait_for(&mut generation, timeout);
        }
    }
}

/// Result of a non-blocking take
#[derive(Debug, PartialEq, Eq)]
pub enum TryTake<T> {
    Item(T),
    Empty,
    Exhausted,
}

/// Why a non-blocking put handed its item back
#[derive(Debug, PartialEq, Eq)]
pub enum TryPutError<T> {
    Full(T),
    Closed(T),
}

impl<T> TryPutError<T> {
    pub fn into_inner(self) -> T {
        match self {
            TryPutError::Full(item) | TryPutError::Closed(item) => item,
        }
    }
}

/// Result of a non-blocking take across several queues
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum TryTakeAny<T> {
    /// Item taken from the queue at this index
    Item(usize, T),
    Empty,
    Exhausted,
}

/// A fixed-capacity blocking queue with half-close and cancellation.
///
/// Storage is a lock-free `ArrayQueue`; the `closed` mutex only serializes
/// puts against `close`, so once a taker has seen the queue closed no
/// further item can appear behind its back.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
}

#[derive(Debug)]
struct Shared<T> {
    items: ArrayQueue<T>,
    closed: Mutex<bool>,
    notify: Arc<Notify>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send> BoundedQueue<T> {
    /// Create a queue with its own notifier.
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self::with_notify(capacity, Arc::new(Notify::new()))
    }

    /// Create a queue that signals changes through a shared notifier
    pub fn with_notify(capacity: usize, notify: Arc<Notify>) -> Self {
        Self {
            shared: Arc::new(Shared {
                items: ArrayQueue::new(capacity),
                closed: Mutex::new(false),
                notify,
            }),
        }
    }

    /// Put an item without blocking. Hands the item back if the queue is full or closed.
    pub fn try_put(&self, item: T) -> Result<(), TryPutError<T>> {
        let pushed = {
            let closed = self.shared.closed.lock();
            if *closed {
                return Err(TryPutError::Closed(item));
            }
            self.shared.items.push(item)
        };
        match pushed {
            Ok(()) => {
                self.shared.notify.ring();
                Ok(())
            }
            Err(item) => Err(TryPutError::Full(item)),
        }
    }

    /// Put an item, blocking while the queue is full
    pub fn put(&self, mut item: T, token: &CancellationToken) -> Result<(), QueueError> {
        loop {
            if token.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            let observed = self.shared.notify.generation();
            match self.try_put(item) {
                Ok(()) => return Ok(()),
                Err(TryPutError::Closed(_)) => return Err(QueueError::Closed),
                Err(TryPutError::Full(back)) => item = back,
            }
            self.shared.notify.wait(observed, CANCEL_POLL);
        }
    }

    /// Take an item without blocking
    pub fn try_take(&self) -> TryTake<T> {
        if let Some(item) = self.shared.items.pop() {
            self.shared.notify.ring();
            return TryTake::Item(item);
        }
        if !self.is_closed() {
            return TryTake::Empty;
        }
        // Closed: no put can land after this point, so one more pop is final.
        match self.shared.items.pop() {
            Some(item) => {
                self.shared.notify.ring();
                TryTake::Item(item)
            }
            None => TryTake::Exhausted,
        }
    }

    /// Take an item, blocking while the queue is empty and open
    pub fn take(&self, token: &CancellationToken) -> Result<T, QueueError> {
        loop {
            if token.is_cancelled() {
                return Err(QueueError::Cancelled);
            }
            let observed = self.shared.notify.generation();
            match self.try_take() {
                TryTake::Item(item) => return Ok(item),
                TryTake::Exhausted => return Err(QueueError::Exhausted),
                TryTake::Empty => {}
            }
            self.shared.notify.wait(observed, CANCEL_POLL);
        }
    }

    /// Mark the queue as complete for puts. Idempotent.
    pub fn close(&self) {
        *self.shared.closed.lock() = true;
        self.shared.notify.ring();
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.lock()
    }

    /// Closed and fully drained
    pub fn is_exhausted(&self) -> bool {
        self.is_closed() && self.shared.items.is_empty()
    }

    /// Current depth. Advisory only.
    pub fn len(&self) -> usize {
        self.shared.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.shared.items.capacity()
    }

    /// Fill level as a percentage (0-100)
    pub fn utilization(&self) -> u32 {
        ((self.len() * 100) / self.capacity()).min(100) as u32
    }

    pub(crate) fn notify(&self) -> &Arc<Notify> {
        &self.shared.notify
    }
}

/// Round-robin starting point for `take_from_any`, so that a queue that is
/// always ready cannot starve the ones after it.
static NEXT_START: AtomicUsize = AtomicUsize::new(0);

/// One non-blocking pass over `queues`, starting at index `start`
pub(crate) fn try_take_from_any<T: Send>(queues: &[BoundedQueue<T>], start: usize) -> TryTakeAny<T> {
    let count = queues.len();
    let mut exhausted = 0;
    for offset in 0..count {
        let index = (start % count + offset) % count;
        match queues[index].try_take() {
            TryTake::Item(item) => return TryTakeAny::Item(index, item),
            TryTake::Exhausted => exhausted += 1,
            TryTake::Empty => {}
        }
    }
    if exhausted == count {
        TryTakeAny::Exhausted
    } else {
        TryTakeAny::Empty
    }
}

/// Take from whichever queue has an item first.
///
/// Returns `Exhausted` once every queue is closed and empty. Queues sharing a
/// notifier wake the caller immediately; otherwise readiness of the other
/// queues is noticed within `CANCEL_POLL`.
pub fn take_from_any<T: Send>(
    queues: &[BoundedQueue<T>],
    token: &CancellationToken,
) -> Result<T, QueueError> {
    if queues.is_empty() {
        return Err(QueueError::Exhausted);
    }
    let start = NEXT_START.fetch_add(1, Ordering::Relaxed);
    let notify = queues[start % queues.len()].notify();
    loop {
        if token.is_cancelled() {
            return Err(QueueError::Cancelled);
        }
        let observed = notify.generation();
        match try_take_from_any(queues, start) {
            TryTakeAny::Item(_, item) => return Ok(item),
            TryTakeAny::Exhausted => return Err(QueueError::Exhausted),
            TryTakeAny::Empty => {}
        }
        notify.wait(observed, CANCEL_POLL);
    }
}
