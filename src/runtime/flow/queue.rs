//! Bounded blocking queue
//!
//! A fixed-capacity, multi-producer multi-consumer FIFO guarded by one mutex
//! and two condition variables (`not_empty`, `not_full`).
//!
//! Every wait sits inside a loop that re-evaluates its predicate after
//! waking. A `notify_one` may wake a waiter whose slot or item has already
//! been taken by a third thread, and condition variables may wake spuriously;
//! in both cases the waiter simply parks again.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use super::cancel::{CancelReason, CancelWatcher, CancellationToken};
use super::error::{FlowError, FlowResult, TryPutError, TryTakeError};

/// Mutable queue state, only touched under `Shared::state`.
struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    /// Signalled when an item is appended (or on close / cancel).
    not_empty: Condvar,
    /// Signalled when an item is removed (or on close / cancel).
    not_full: Condvar,
    capacity: usize,
}

impl<T: Send> CancelWatcher for Shared<T> {
    fn on_cancel(
        &self,
        _reason: CancelReason,
    ) {
        // Taking the lock orders this broadcast after any in-progress
        // flag check, so a waiter cannot park past it.
        let _state = self.state.lock();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

/// A fixed-capacity thread-safe FIFO with blocking `put` / `take`.
///
/// Cloning the handle shares the same queue.
///
/// # Example
///
/// ```
/// use flowq::runtime::flow::{BoundedQueue, FlowError};
///
/// let queue = BoundedQueue::new(2).unwrap();
/// queue.put(1).unwrap();
/// queue.put(2).unwrap();
/// queue.close();
///
/// assert_eq!(queue.take(), Ok(1));
/// assert_eq!(queue.take(), Ok(2));
/// assert_eq!(queue.take(), Err(FlowError::Closed));
/// ```
pub struct BoundedQueue<T> {
    shared: Arc<Shared<T>>,
    token: Option<CancellationToken>,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// Fails with [`FlowError::InvalidCapacity`] when `capacity` is zero.
    pub fn new(capacity: usize) -> FlowResult<Self> {
        if capacity == 0 {
            return Err(FlowError::InvalidCapacity(capacity));
        }

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                capacity,
            }),
            token: None,
        })
    }

    /// Create a queue whose blocking operations are interrupted by `token`.
    pub fn with_cancellation(
        capacity: usize,
        token: &CancellationToken,
    ) -> FlowResult<Self>
    where
        T: Send + 'static,
    {
        let mut queue = Self::new(capacity)?;
        queue.watch(token);
        queue.token = Some(token.clone());
        Ok(queue)
    }

    /// Wake this queue's blocked callers when `token` fires.
    ///
    /// Needed before using [`put_until`](Self::put_until) or
    /// [`take_until`](Self::take_until) with a token the queue was not
    /// constructed with.
    pub fn watch(
        &self,
        token: &CancellationToken,
    ) where
        T: Send + 'static,
    {
        let weak: Weak<Shared<T>> = Arc::downgrade(&self.shared);
        let weak: Weak<dyn CancelWatcher> = weak;
        // An already-cancelled token is observed by the flag check alone.
        token.register(weak);
    }

    #[inline]
    fn cancelled(
        &self,
        extra: Option<&CancellationToken>,
    ) -> bool {
        self.token.as_ref().is_some_and(CancellationToken::is_done)
            || extra.is_some_and(CancellationToken::is_done)
    }

    /// Append `item`, blocking while the queue is full.
    ///
    /// Fails with [`FlowError::Closed`] if the queue is closed (items already
    /// queued stay retrievable) and with [`FlowError::Cancelled`] if the bound
    /// token fires.
    #[inline]
    pub fn put(
        &self,
        item: T,
    ) -> FlowResult<()> {
        self.put_inner(item, None, None)
    }

    /// Like [`put`](Self::put) but gives up with [`FlowError::Timeout`] after
    /// `timeout`. A timeout past the representable range waits untimed.
    #[inline]
    pub fn put_timeout(
        &self,
        item: T,
        timeout: Duration,
    ) -> FlowResult<()> {
        self.put_inner(item, Instant::now().checked_add(timeout), None)
    }

    /// Like [`put`](Self::put) but also fails with
    /// [`FlowError::Cancelled`] when `token` fires. The queue must
    /// [`watch`](Self::watch) `token` for a blocked call to be woken.
    #[inline]
    pub fn put_until(
        &self,
        item: T,
        token: &CancellationToken,
    ) -> FlowResult<()> {
        self.put_inner(item, None, Some(token))
    }

    fn put_inner(
        &self,
        item: T,
        until: Option<Instant>,
        extra: Option<&CancellationToken>,
    ) -> FlowResult<()> {
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                return Err(FlowError::Closed);
            }
            if self.cancelled(extra) {
                // Pass on a wakeup this caller may have consumed.
                if state.items.len() < self.shared.capacity {
                    self.shared.not_full.notify_one();
                }
                return Err(FlowError::Cancelled);
            }
            if state.items.len() < self.shared.capacity {
                break;
            }
            match until {
                Some(until) if Instant::now() >= until => return Err(FlowError::Timeout),
                Some(until) => {
                    self.shared.not_full.wait_until(&mut state, until);
                },
                None => self.shared.not_full.wait(&mut state),
            }
        }

        state.items.push_back(item);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Append `item` only if there is room right now.
    pub fn try_put(
        &self,
        item: T,
    ) -> Result<(), TryPutError<T>> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(TryPutError::Closed(item));
        }
        if self.cancelled(None) {
            return Err(TryPutError::Cancelled(item));
        }
        if state.items.len() >= self.shared.capacity {
            return Err(TryPutError::Full(item));
        }

        state.items.push_back(item);
        self.shared.not_empty.notify_one();
        Ok(())
    }

    /// Remove the oldest item, blocking while the queue is empty.
    ///
    /// Returns [`FlowError::Closed`] once the queue is closed and drained and
    /// [`FlowError::Cancelled`] once the bound token has fired.
    #[inline]
    pub fn take(&self) -> FlowResult<T> {
        self.take_inner(None, None)
    }

    /// Like [`take`](Self::take) but gives up with [`FlowError::Timeout`]
    /// after `timeout`. A timeout past the representable range waits untimed.
    #[inline]
    pub fn take_timeout(
        &self,
        timeout: Duration,
    ) -> FlowResult<T> {
        self.take_inner(Instant::now().checked_add(timeout), None)
    }

    /// Like [`take`](Self::take) but also fails with
    /// [`FlowError::Cancelled`] when `token` fires. The queue must
    /// [`watch`](Self::watch) `token` for a blocked call to be woken.
    #[inline]
    pub fn take_until(
        &self,
        token: &CancellationToken,
    ) -> FlowResult<T> {
        self.take_inner(None, Some(token))
    }

    fn take_inner(
        &self,
        until: Option<Instant>,
        extra: Option<&CancellationToken>,
    ) -> FlowResult<T> {
        let mut state = self.shared.state.lock();
        loop {
            if self.cancelled(extra) {
                if !state.items.is_empty() {
                    self.shared.not_empty.notify_one();
                }
                return Err(FlowError::Cancelled);
            }
            if let Some(item) = state.items.pop_front() {
                self.shared.not_full.notify_one();
                return Ok(item);
            }
            if state.closed {
                return Err(FlowError::Closed);
            }
            match until {
                Some(until) if Instant::now() >= until => return Err(FlowError::Timeout),
                Some(until) => {
                    self.shared.not_empty.wait_until(&mut state, until);
                },
                None => self.shared.not_empty.wait(&mut state),
            }
        }
    }

    /// Remove the oldest item only if one is available right now.
    pub fn try_take(&self) -> Result<T, TryTakeError> {
        let mut state = self.shared.state.lock();
        if self.cancelled(None) {
            return Err(TryTakeError::Cancelled);
        }
        match state.items.pop_front() {
            Some(item) => {
                self.shared.not_full.notify_one();
                Ok(item)
            },
            None if state.closed => Err(TryTakeError::Closed),
            None => Err(TryTakeError::Empty),
        }
    }

    /// Close the queue. Idempotent; returns `true` for the call that closed
    /// it.
    ///
    /// Wakes every blocked `put` and `take`: both sides must re-evaluate
    /// their exit condition, so this is a broadcast on both conditions.
    pub fn close(&self) -> bool {
        let mut state = self.shared.state.lock();
        if state.closed {
            return false;
        }
        state.closed = true;
        trace!(buffered = state.items.len(), "queue closed");
        self.shared.not_empty.notify_all();
        self.shared.not_full.notify_all();
        true
    }

    /// Whether `close` has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of buffered items.
    #[inline]
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Whether no items are buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shared.state.lock().items.is_empty()
    }

    /// Maximum number of buffered items.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// The token bound to this queue, if any.
    #[inline]
    pub fn token(&self) -> Option<&CancellationToken> {
        self.token.as_ref()
    }

    /// Whether two handles refer to the same queue.
    #[inline]
    pub fn same_as(
        &self,
        other: &BoundedQueue<T>,
    ) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Blocking iterator that yields items until the queue is closed and
    /// drained, or cancelled.
    pub fn iter(&self) -> QueueIter<T> {
        QueueIter {
            queue: self.clone(),
        }
    }
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            token: self.token.clone(),
        }
    }
}

impl<T> fmt::Debug for BoundedQueue<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("BoundedQueue")
            .field("len", &state.items.len())
            .field("capacity", &self.shared.capacity)
            .field("closed", &state.closed)
            .field("cancelled", &self.cancelled(None))
            .finish()
    }
}

/// Blocking iterator over a [`BoundedQueue`].
#[derive(Debug)]
pub struct QueueIter<T> {
    queue: BoundedQueue<T>,
}

impl<T> Iterator for QueueIter<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.take().ok()
    }
}

impl<T> IntoIterator for BoundedQueue<T> {
    type Item = T;
    type IntoIter = QueueIter<T>;

    fn into_iter(self) -> QueueIter<T> {
        QueueIter { queue: self }
    }
}
