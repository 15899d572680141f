//! Fixed-size worker pool.
//!
//! `N` workers take [`Job`]s from an input queue, run the processing function
//! on each payload and put an [`Outcome`] on the output queue. A failing or
//! panicking job becomes an error-tagged outcome; the worker moves on.
//!
//! The pool closes its output exactly once, after all `N` workers have
//! exited. Workers exit when the input is closed and drained, when the
//! output stops accepting results, or when the pool's token is cancelled.
//!
//! With more than one worker, outcomes may leave the pool in a different
//! order than their jobs arrived. Use [`Job::seq`] to reorder.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tracing::warn;

use super::cancel::CancellationToken;
use super::error::FlowResult;
use super::job::{Job, JobError, Outcome};
use super::metrics::{noop as noop_metrics, FlowMetrics};
use super::queue::BoundedQueue;
use super::workers::{run_guarded, PoolState, WorkerGroup};

/// Builder for [`WorkerPool`].
///
/// Typed by the pool it builds; `T`, `R` and `E` are inferred from the
/// queues handed to [`build`](Self::build).
pub struct WorkerPoolBuilder<T, R, E> {
    workers: usize,
    name: Option<String>,
    token: Option<CancellationToken>,
    metrics: Option<Arc<dyn FlowMetrics>>,
    _marker: PhantomData<fn(T) -> Result<R, E>>,
}

impl<T, R, E> WorkerPoolBuilder<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Start a builder for a pool of `workers` threads.
    #[inline]
    pub fn new(workers: usize) -> Self {
        Self {
            workers,
            name: None,
            token: None,
            metrics: None,
            _marker: PhantomData,
        }
    }

    /// Set the pool name (used for thread names and log fields).
    #[inline]
    pub fn name(
        mut self,
        name: impl Into<String>,
    ) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Stop the pool when `token` is cancelled.
    #[inline]
    pub fn token(
        mut self,
        token: &CancellationToken,
    ) -> Self {
        self.token = Some(token.clone());
        self
    }

    /// Report job counts and queue depth to `metrics`.
    #[inline]
    pub fn metrics(
        mut self,
        metrics: Arc<dyn FlowMetrics>,
    ) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Build the pool. Fails with
    /// [`FlowError::InvalidWorkerCount`](super::FlowError::InvalidWorkerCount)
    /// when the worker count is zero.
    pub fn build<F>(
        self,
        input: BoundedQueue<Job<T>>,
        output: BoundedQueue<Outcome<R, E>>,
        f: F,
    ) -> FlowResult<WorkerPool<T, R, E>>
    where
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
    {
        let name = self.name.unwrap_or_else(|| "flowq-pool".to_string());
        // A child token: stopping this pool must not cancel the caller's
        // token, but cancelling the caller's token stops the pool.
        let token = self.token.unwrap_or_default().child();
        let metrics = self.metrics.unwrap_or_else(noop_metrics);

        let step_metrics = metrics.clone();
        let step_name = name.clone();
        let step = Box::new(move |job: Job<T>| -> Option<Outcome<R, E>> {
            let seq = job.seq;
            let result = run_guarded(&f, job.payload);
            match &result {
                Ok(_) => step_metrics.job_processed(),
                Err(JobError::Panicked(message)) => {
                    step_metrics.job_failed();
                    warn!(pool = %step_name, ?seq, %message, "job panicked");
                },
                Err(JobError::Failed(_)) => {
                    step_metrics.job_failed();
                    warn!(pool = %step_name, ?seq, "job failed");
                },
            }
            Some(Job {
                seq,
                payload: result,
            })
        });

        let group = WorkerGroup::new(name, self.workers, input, output, token, metrics, step)?;
        Ok(WorkerPool { group })
    }
}

impl<T, R, E> fmt::Debug for WorkerPoolBuilder<T, R, E> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WorkerPoolBuilder")
            .field("workers", &self.workers)
            .field("name", &self.name)
            .field("token", &self.token)
            .finish()
    }
}

/// A fixed set of workers draining a job queue into a result queue.
///
/// # Example
///
/// ```
/// use flowq::runtime::flow::{BoundedQueue, CancellationToken, Job, WorkerPool};
///
/// let input = BoundedQueue::new(8).unwrap();
/// let output = BoundedQueue::new(8).unwrap();
/// let token = CancellationToken::new();
///
/// let mut pool = WorkerPool::new(
///     2,
///     input.clone(),
///     output.clone(),
///     |x: i32| Ok::<_, String>(x * 2),
///     &token,
/// )
/// .unwrap();
/// pool.start().unwrap();
///
/// for i in 0..4 {
///     input.put(Job::with_seq(i, i as i32)).unwrap();
/// }
/// input.close();
///
/// let mut doubled: Vec<i32> = output.iter().map(|o| o.payload.unwrap()).collect();
/// doubled.sort();
/// assert_eq!(doubled, vec![0, 2, 4, 6]);
/// pool.join().unwrap();
/// ```
pub struct WorkerPool<T, R, E> {
    group: WorkerGroup<Job<T>, Outcome<R, E>>,
}

impl<T, R, E> WorkerPool<T, R, E>
where
    T: Send + 'static,
    R: Send + 'static,
    E: Send + 'static,
{
    /// Create a pool of `workers` threads applying `f` to every job.
    ///
    /// The pool stops when `token` is cancelled. Nothing runs until
    /// [`start`](Self::start).
    pub fn new<F>(
        workers: usize,
        input: BoundedQueue<Job<T>>,
        output: BoundedQueue<Outcome<R, E>>,
        f: F,
        token: &CancellationToken,
    ) -> FlowResult<Self>
    where
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
    {
        WorkerPoolBuilder::new(workers)
            .token(token)
            .build(input, output, f)
    }

    /// Start configuring a pool.
    #[inline]
    pub fn builder(workers: usize) -> WorkerPoolBuilder<T, R, E> {
        WorkerPoolBuilder::new(workers)
    }

    /// Launch the workers. Fails with
    /// [`FlowError::AlreadyStarted`](super::FlowError::AlreadyStarted) on a
    /// second call.
    #[inline]
    pub fn start(&mut self) -> FlowResult<()> {
        self.group.start()
    }

    /// Cancel the pool and wait for every worker to exit. Jobs still
    /// buffered in the input are left there.
    #[inline]
    pub fn stop(&mut self) -> FlowResult<()> {
        self.group.stop()
    }

    /// Wait for every worker to exit.
    #[inline]
    pub fn join(&mut self) -> FlowResult<()> {
        self.group.join()
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> PoolState {
        self.group.state()
    }

    /// Pool name.
    #[inline]
    pub fn name(&self) -> &str {
        self.group.name()
    }

    /// Number of workers.
    #[inline]
    pub fn workers(&self) -> usize {
        self.group.size()
    }

    /// The job queue.
    #[inline]
    pub fn input(&self) -> &BoundedQueue<Job<T>> {
        self.group.input()
    }

    /// The result queue.
    #[inline]
    pub fn output(&self) -> &BoundedQueue<Outcome<R, E>> {
        self.group.output()
    }

    /// The pool's own token (a child of the one it was built with).
    #[inline]
    pub fn token(&self) -> &CancellationToken {
        self.group.token()
    }
}

impl<T, R, E> fmt::Debug for WorkerPool<T, R, E> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("group", &self.group)
            .finish()
    }
}
