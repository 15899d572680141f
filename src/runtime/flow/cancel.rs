//! Cooperative cancellation.
//!
//! A [`CancellationToken`] is a one-shot, shared "done" signal. Blocking
//! operations do not poll it: anything that parks a thread (a queue, a child
//! token) registers itself as a [`CancelWatcher`] and is woken when the token
//! fires.
//!
//! # Lost-wakeup freedom
//!
//! `cancel` stores the `done` flag before notifying watchers, and every
//! watcher takes its own lock before broadcasting. A waiter checks the flag
//! under that same lock before parking, so it either sees the flag or is
//! already parked when the broadcast arrives.

use std::fmt;
use std::sync::{
    atomic::{AtomicBool, AtomicU8, Ordering},
    Arc, Weak,
};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

/// Why a token was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel()` was called explicitly.
    Cancelled,
    /// The token's deadline elapsed.
    DeadlineExceeded,
}

impl CancelReason {
    #[inline]
    fn as_u8(&self) -> u8 {
        match self {
            CancelReason::Cancelled => 1,
            CancelReason::DeadlineExceeded => 2,
        }
    }

    #[inline]
    fn from_u8(val: u8) -> Option<Self> {
        match val {
            1 => Some(CancelReason::Cancelled),
            2 => Some(CancelReason::DeadlineExceeded),
            _ => None,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            CancelReason::Cancelled => write!(f, "cancelled"),
            CancelReason::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Something parked on a condition that must be woken when a token fires.
///
/// Implementations must acquire the lock guarding their wait condition before
/// notifying, otherwise a waiter between its flag check and its wait can miss
/// the wakeup.
pub trait CancelWatcher: Send + Sync {
    /// Called once, from the cancelling thread, after the token is done.
    fn on_cancel(
        &self,
        reason: CancelReason,
    );
}

/// Shared deadline timer state. The timer thread parks on `cond` until the
/// deadline or until `stopped` is set.
#[derive(Debug, Default)]
struct TimerSignal {
    stopped: Mutex<bool>,
    cond: Condvar,
}

impl TimerSignal {
    fn stop(&self) {
        let mut stopped = self.stopped.lock();
        *stopped = true;
        self.cond.notify_all();
    }
}

struct TokenInner {
    done: AtomicBool,
    /// 0 = none, otherwise [`CancelReason::as_u8`].
    reason: AtomicU8,
    /// Earliest deadline armed on this token.
    deadline: Mutex<Option<Instant>>,
    watchers: Mutex<Vec<Weak<dyn CancelWatcher>>>,
    timers: Mutex<Vec<Arc<TimerSignal>>>,
    /// Lock/condition pair used by `wait` and `wait_timeout`.
    wait_lock: Mutex<()>,
    wait_cond: Condvar,
}

impl TokenInner {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            reason: AtomicU8::new(0),
            deadline: Mutex::new(None),
            watchers: Mutex::new(Vec::new()),
            timers: Mutex::new(Vec::new()),
            wait_lock: Mutex::new(()),
            wait_cond: Condvar::new(),
        }
    }

    #[inline]
    fn is_done(&self) -> bool {
        self.done.load(Ordering::SeqCst)
    }

    fn cancel_with(
        &self,
        reason: CancelReason,
    ) -> bool {
        // Reason is written before the flag so observers of `done` see it.
        if self
            .reason
            .compare_exchange(0, reason.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.done.store(true, Ordering::SeqCst);

        {
            let _guard = self.wait_lock.lock();
            self.wait_cond.notify_all();
        }

        for timer in std::mem::take(&mut *self.timers.lock()) {
            timer.stop();
        }

        // Notify outside the registry lock: watchers take their own locks.
        let watchers = std::mem::take(&mut *self.watchers.lock());
        trace!(watchers = watchers.len(), %reason, "cancellation token fired");
        for watcher in watchers.iter().filter_map(Weak::upgrade) {
            watcher.on_cancel(reason);
        }
        true
    }

    fn register(
        &self,
        watcher: Weak<dyn CancelWatcher>,
    ) -> bool {
        let mut watchers = self.watchers.lock();
        if self.is_done() {
            return false;
        }
        watchers.retain(|w| w.strong_count() > 0);
        watchers.push(watcher);
        true
    }
}

impl CancelWatcher for TokenInner {
    fn on_cancel(
        &self,
        reason: CancelReason,
    ) {
        self.cancel_with(reason);
    }
}

impl Drop for TokenInner {
    fn drop(&mut self) {
        for timer in self.timers.get_mut().drain(..) {
            timer.stop();
        }
    }
}

/// A cooperative cancellation signal shared by queues, pools and pipelines.
///
/// Clones share the same state. Once cancelled a token stays cancelled.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<TokenInner>,
}

impl CancellationToken {
    /// Create a token that is not cancelled and has no deadline.
    #[inline]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TokenInner::new()),
        }
    }

    /// Create a token that cancels itself once `timeout` elapses.
    pub fn with_deadline(timeout: Duration) -> Self {
        let token = Self::new();
        token.cancel_after(timeout);
        token
    }

    /// Create a token that cancels itself at `deadline`.
    pub fn with_deadline_at(deadline: Instant) -> Self {
        let token = Self::new();
        token.cancel_at(deadline);
        token
    }

    /// Create a child token. Cancelling `self` cancels the child (with the
    /// same reason); cancelling the child leaves `self` untouched.
    pub fn child(&self) -> Self {
        let child = Self::new();
        let weak: Weak<TokenInner> = Arc::downgrade(&child.inner);
        let weak: Weak<dyn CancelWatcher> = weak;
        if !self.inner.register(weak) {
            let reason = self.reason().unwrap_or(CancelReason::Cancelled);
            child.inner.cancel_with(reason);
        }
        child
    }

    /// Cancel the token. Returns `true` for the call that actually
    /// transitioned it; later calls are no-ops.
    pub fn cancel(&self) -> bool {
        let fired = self.inner.cancel_with(CancelReason::Cancelled);
        if fired {
            debug!("cancellation requested");
        }
        fired
    }

    /// Arm a deadline `timeout` from now.
    ///
    /// A timeout too large to represent as an [`Instant`] arms nothing.
    pub fn cancel_after(
        &self,
        timeout: Duration,
    ) {
        match Instant::now().checked_add(timeout) {
            Some(deadline) => self.cancel_at(deadline),
            None => trace!(?timeout, "deadline beyond representable time, not armed"),
        }
    }

    /// Arm a deadline at `deadline`.
    ///
    /// A timer thread parks until the deadline and then cancels the token with
    /// [`CancelReason::DeadlineExceeded`]. The timer is released early if the
    /// token is cancelled or dropped first. If several deadlines are armed the
    /// earliest one wins.
    pub fn cancel_at(
        &self,
        deadline: Instant,
    ) {
        if self.is_done() {
            return;
        }

        {
            let mut current = self.inner.deadline.lock();
            *current = Some(match *current {
                Some(existing) if existing <= deadline => existing,
                _ => deadline,
            });
        }

        if deadline <= Instant::now() {
            self.inner.cancel_with(CancelReason::DeadlineExceeded);
            return;
        }

        let signal = Arc::new(TimerSignal::default());
        {
            let mut timers = self.inner.timers.lock();
            if self.is_done() {
                return;
            }
            timers.push(signal.clone());
        }

        let token = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("flowq-deadline".to_string())
            .spawn(move || Self::deadline_loop(&signal, deadline, &token));
        if let Err(err) = spawned {
            warn!(error = %err, "failed to spawn deadline timer, cancelling immediately");
            self.inner.cancel_with(CancelReason::DeadlineExceeded);
        }
    }

    fn deadline_loop(
        signal: &TimerSignal,
        deadline: Instant,
        token: &Weak<TokenInner>,
    ) {
        {
            let mut stopped = signal.stopped.lock();
            loop {
                if *stopped {
                    return;
                }
                if Instant::now() >= deadline {
                    break;
                }
                signal.cond.wait_until(&mut stopped, deadline);
            }
        }

        if let Some(inner) = token.upgrade() {
            if inner.cancel_with(CancelReason::DeadlineExceeded) {
                debug!("deadline exceeded, token cancelled");
            }
        }
    }

    /// Non-blocking check.
    #[inline]
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    /// Why the token fired, or `None` while it is still live.
    #[inline]
    pub fn reason(&self) -> Option<CancelReason> {
        CancelReason::from_u8(self.inner.reason.load(Ordering::SeqCst))
    }

    /// The earliest armed deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        *self.inner.deadline.lock()
    }

    /// Block until the token is cancelled.
    pub fn wait(&self) {
        let mut guard = self.inner.wait_lock.lock();
        while !self.is_done() {
            self.inner.wait_cond.wait(&mut guard);
        }
    }

    /// Block until the token is cancelled or `timeout` elapses. Returns
    /// whether the token is done.
    pub fn wait_timeout(
        &self,
        timeout: Duration,
    ) -> bool {
        let Some(until) = Instant::now().checked_add(timeout) else {
            self.wait();
            return true;
        };
        let mut guard = self.inner.wait_lock.lock();
        while !self.is_done() {
            if self.inner.wait_cond.wait_until(&mut guard, until).timed_out() {
                break;
            }
        }
        self.is_done()
    }

    /// Register a watcher to be woken when the token fires.
    ///
    /// Returns `false` if the token is already done, in which case the
    /// watcher is not retained and will not be called.
    pub fn register(
        &self,
        watcher: Weak<dyn CancelWatcher>,
    ) -> bool {
        self.inner.register(watcher)
    }

    /// Whether two handles refer to the same token.
    #[inline]
    pub fn same_as(
        &self,
        other: &CancellationToken,
    ) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationToken {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("CancellationToken")
            .field("done", &self.is_done())
            .field("reason", &self.reason())
            .field("deadline", &self.deadline())
            .finish()
    }
}
