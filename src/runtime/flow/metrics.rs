//! Metrics hooks.
//!
//! The core reports through [`FlowMetrics`] and does not care where the
//! numbers go. [`FlowStats`] is a plain atomic-counter sink for callers and
//! tests that just want totals.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Counter interface called by worker pools and pipeline stages.
///
/// All methods default to no-ops.
pub trait FlowMetrics: Send + Sync {
    /// Depth of `queue` observed right after a worker took from it.
    fn queue_depth(
        &self,
        _queue: &str,
        _depth: usize,
    ) {
    }

    /// A job finished successfully.
    fn job_processed(&self) {}

    /// A job returned an error or panicked.
    fn job_failed(&self) {}
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl FlowMetrics for NoopMetrics {}

/// Shared no-op sink.
pub fn noop() -> Arc<dyn FlowMetrics> {
    Arc::new(NoopMetrics)
}

/// Atomic totals.
#[derive(Debug, Default)]
pub struct FlowStats {
    /// Total jobs processed successfully.
    pub jobs_processed: AtomicUsize,
    /// Total jobs that failed or panicked.
    pub jobs_failed: AtomicUsize,
    /// Last observed queue depth.
    pub last_depth: AtomicUsize,
    /// Peak observed queue depth.
    pub peak_depth: AtomicUsize,
}

impl FlowStats {
    /// Create zeroed stats.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Jobs processed successfully.
    #[inline]
    pub fn processed(&self) -> usize {
        self.jobs_processed.load(Ordering::SeqCst)
    }

    /// Jobs that failed or panicked.
    #[inline]
    pub fn failed(&self) -> usize {
        self.jobs_failed.load(Ordering::SeqCst)
    }

    /// Processed plus failed.
    #[inline]
    pub fn total(&self) -> usize {
        self.processed() + self.failed()
    }

    /// Peak observed queue depth.
    #[inline]
    pub fn peak(&self) -> usize {
        self.peak_depth.load(Ordering::SeqCst)
    }

    /// Fraction of jobs that failed.
    pub fn failure_rate(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        self.failed() as f64 / total as f64
    }
}

impl FlowMetrics for FlowStats {
    fn queue_depth(
        &self,
        _queue: &str,
        depth: usize,
    ) {
        self.last_depth.store(depth, Ordering::SeqCst);
        self.peak_depth.fetch_max(depth, Ordering::SeqCst);
    }

    #[inline]
    fn job_processed(&self) {
        self.jobs_processed.fetch_add(1, Ordering::SeqCst);
    }

    #[inline]
    fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::SeqCst);
    }
}

impl fmt::Display for FlowStats {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(
            f,
            "processed={} failed={} peak_depth={}",
            self.processed(),
            self.failed(),
            self.peak()
        )
    }
}
