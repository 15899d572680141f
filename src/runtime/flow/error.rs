//! Flow errors

use std::fmt;

use thiserror::Error;

/// Flow result
pub type FlowResult<T> = Result<T, FlowError>;

/// Errors returned by queues, pools and pipelines.
///
/// `Closed` and `Cancelled` are the two normal ways a blocking operation ends
/// without a value; the rest are construction or lifecycle misuse.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("queue is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,

    #[error("invalid queue capacity: {0} (must be greater than zero)")]
    InvalidCapacity(usize),

    #[error("invalid worker count: {0} (must be greater than zero)")]
    InvalidWorkerCount(usize),

    #[error("pipeline requires at least one stage")]
    EmptyPipeline,

    #[error("fan-in requires at least one source")]
    NoSources,

    #[error("worker pool already started")]
    AlreadyStarted,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),

    #[error("worker thread panicked: {0}")]
    WorkerPanicked(String),
}

impl FlowError {
    /// Whether this error marks a normal end of stream rather than misuse.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowError::Closed | FlowError::Cancelled)
    }
}

/// Error returned by [`BoundedQueue::try_put`](super::BoundedQueue::try_put).
///
/// The rejected item is handed back to the caller.
#[derive(Error, PartialEq, Eq)]
pub enum TryPutError<T> {
    #[error("queue is full")]
    Full(T),

    #[error("queue is closed")]
    Closed(T),

    #[error("operation cancelled")]
    Cancelled(T),
}

impl<T> TryPutError<T> {
    /// Recover the item that could not be queued.
    pub fn into_inner(self) -> T {
        match self {
            TryPutError::Full(item) | TryPutError::Closed(item) | TryPutError::Cancelled(item) => {
                item
            },
        }
    }
}

impl<T> fmt::Debug for TryPutError<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            TryPutError::Full(_) => write!(f, "Full(..)"),
            TryPutError::Closed(_) => write!(f, "Closed(..)"),
            TryPutError::Cancelled(_) => write!(f, "Cancelled(..)"),
        }
    }
}

/// Error returned by [`BoundedQueue::try_take`](super::BoundedQueue::try_take).
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TryTakeError {
    #[error("queue is empty")]
    Empty,

    #[error("queue is closed")]
    Closed,

    #[error("operation cancelled")]
    Cancelled,
}
