//! Jobs and per-job outcomes.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;

/// A unit of work moving through queues.
///
/// The optional sequence number is for ordering diagnostics only; queues
/// never look at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job<T> {
    /// Sequence number assigned by the producer.
    pub seq: Option<u64>,
    /// The work item itself.
    pub payload: T,
}

impl<T> Job<T> {
    /// Create a job without a sequence number.
    #[inline]
    pub fn new(payload: T) -> Self {
        Self { seq: None, payload }
    }

    /// Create a job tagged with `seq`.
    #[inline]
    pub fn with_seq(
        seq: u64,
        payload: T,
    ) -> Self {
        Self {
            seq: Some(seq),
            payload,
        }
    }

    /// Transform the payload, keeping the sequence number.
    #[inline]
    pub fn map<U, F>(
        self,
        f: F,
    ) -> Job<U>
    where
        F: FnOnce(T) -> U,
    {
        Job {
            seq: self.seq,
            payload: f(self.payload),
        }
    }

    /// Consume the job, returning its payload.
    #[inline]
    pub fn into_payload(self) -> T {
        self.payload
    }
}

impl<T> From<T> for Job<T> {
    fn from(payload: T) -> Self {
        Self::new(payload)
    }
}

/// Why a single job failed. Never fatal to the pool that ran it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError<E> {
    /// The processing function returned an error.
    #[error("job failed: {0}")]
    Failed(E),

    /// The processing function panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
}

impl<E> JobError<E> {
    /// Build a `Panicked` error from a `catch_unwind` payload.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        JobError::Panicked(panic_message(payload.as_ref()))
    }

    /// Whether the job panicked rather than returning an error.
    #[inline]
    pub fn is_panic(&self) -> bool {
        matches!(self, JobError::Panicked(_))
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// A job's result, tagged with the sequence number of the job that produced
/// it.
pub type Outcome<R, E> = Job<Result<R, JobError<E>>>;

/// Thread-safe generator of increasing sequence numbers.
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    next: AtomicU64,
}

impl SequenceGenerator {
    /// Create a generator starting at zero.
    #[inline]
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    /// Create a generator whose first number is `start`.
    #[inline]
    pub fn starting_at(start: u64) -> Self {
        Self {
            next: AtomicU64::new(start),
        }
    }

    /// Hand out the next sequence number.
    #[inline]
    #[allow(clippy::should_implement_trait)]
    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Wrap `payload` in a job carrying the next sequence number.
    #[inline]
    pub fn job<T>(
        &self,
        payload: T,
    ) -> Job<T> {
        Job::with_seq(self.next(), payload)
    }
}

impl<T: fmt::Display> fmt::Display for Job<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self.seq {
            Some(seq) => write!(f, "#{} {}", seq, self.payload),
            None => write!(f, "{}", self.payload),
        }
    }
}
