//! Multi-stage pipelines and fan-in.
//!
//! A [`Pipeline`] chains [`Stage`]s: stage `i`'s output queue is stage
//! `i + 1`'s input queue. Each stage runs `K` workers (fan-out) and closes
//! its output once its input is closed and drained, so closing the
//! pipeline's input eventually closes its output.
//!
//! Items between stages are [`Outcome`]s. A stage only runs its function on
//! `Ok` payloads; error-tagged items are forwarded untouched so every failure
//! reaches the sink.
//!
//! # Ordering
//!
//! With one worker per stage, items leave in the order they entered. With
//! `K > 1` workers in any stage there is no ordering guarantee across items;
//! use [`Job::seq`] to reorder at the sink.
//!
//! [`fan_in`] merges several queues into one and closes the merged queue only
//! after **every** source has been closed and drained.

use std::fmt;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};
use std::thread;

use tracing::{debug, trace, warn};

use super::cancel::CancellationToken;
use super::error::{FlowError, FlowResult};
use super::job::{panic_message, Job, JobError, Outcome, SequenceGenerator};
use super::metrics::{noop as noop_metrics, FlowMetrics};
use super::queue::BoundedQueue;
use super::workers::{run_guarded, PoolState, StepFn, WorkerGroup};

/// Stage function: `Ok(Some(v))` forwards `v`, `Ok(None)` drops the item,
/// `Err(e)` forwards an error-tagged item.
pub type StageFn<T, E> = dyn Fn(T) -> Result<Option<T>, E> + Send + Sync;

/// One step of a [`Pipeline`].
pub struct Stage<T, E> {
    name: String,
    workers: usize,
    func: Arc<StageFn<T, E>>,
}

impl<T, E> Stage<T, E>
where
    T: 'static,
    E: 'static,
{
    /// A stage that can forward, drop, or fail each item.
    pub fn new<F>(
        name: impl Into<String>,
        workers: usize,
        f: F,
    ) -> Self
    where
        F: Fn(T) -> Result<Option<T>, E> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            workers,
            func: Arc::new(f),
        }
    }

    /// A stage that transforms every item.
    pub fn map<F>(
        name: impl Into<String>,
        workers: usize,
        f: F,
    ) -> Self
    where
        F: Fn(T) -> T + Send + Sync + 'static,
    {
        Self::new(name, workers, move |item| Ok(Some(f(item))))
    }

    /// A stage that transforms every item and may fail.
    pub fn try_map<F>(
        name: impl Into<String>,
        workers: usize,
        f: F,
    ) -> Self
    where
        F: Fn(T) -> Result<T, E> + Send + Sync + 'static,
    {
        Self::new(name, workers, move |item| f(item).map(Some))
    }

    /// A stage that keeps only items matching `predicate`.
    pub fn filter<P>(
        name: impl Into<String>,
        workers: usize,
        predicate: P,
    ) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        Self::new(name, workers, move |item| {
            Ok(if predicate(&item) { Some(item) } else { None })
        })
    }

    /// Stage name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of workers (fan-out).
    #[inline]
    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl<T, E> Clone for Stage<T, E> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            workers: self.workers,
            func: self.func.clone(),
        }
    }
}

impl<T, E> fmt::Debug for Stage<T, E> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("workers", &self.workers)
            .finish()
    }
}

/// Build the worker step for one stage.
fn stage_step<T, E>(
    name: String,
    func: Arc<StageFn<T, E>>,
    metrics: Arc<dyn FlowMetrics>,
) -> Box<StepFn<Outcome<T, E>, Outcome<T, E>>>
where
    T: Send + 'static,
    E: Send + 'static,
{
    Box::new(move |job: Outcome<T, E>| {
        let Job { seq, payload } = job;
        let value = match payload {
            Ok(value) => value,
            Err(err) => {
                trace!(stage = %name, ?seq, "forwarding failed item");
                return Some(Job {
                    seq,
                    payload: Err(err),
                });
            },
        };

        match run_guarded(&*func, value) {
            Ok(Some(value)) => {
                metrics.job_processed();
                Some(Job {
                    seq,
                    payload: Ok(value),
                })
            },
            Ok(None) => {
                metrics.job_processed();
                trace!(stage = %name, ?seq, "item filtered out");
                None
            },
            Err(err) => {
                metrics.job_failed();
                if let JobError::Panicked(message) = &err {
                    warn!(stage = %name, ?seq, %message, "stage function panicked");
                } else {
                    warn!(stage = %name, ?seq, "stage function failed");
                }
                Some(Job {
                    seq,
                    payload: Err(err),
                })
            },
        }
    })
}

/// Builder for [`Pipeline`].
pub struct PipelineBuilder<T, E> {
    stages: Vec<Stage<T, E>>,
    capacity: usize,
    token: Option<CancellationToken>,
    metrics: Option<Arc<dyn FlowMetrics>>,
}

impl<T, E> PipelineBuilder<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Default capacity of every inter-stage queue.
    pub const DEFAULT_CAPACITY: usize = 16;

    /// Start an empty builder.
    pub fn new() -> Self {
        Self {
            stages: Vec::new(),
            capacity: Self::DEFAULT_CAPACITY,
            token: None,
            metrics: None,
        }
    }

    /// Append a stage.
    pub fn stage(
        mut self,
        stage: Stage<T, E>,
    ) -> Self {
        self.stages.push(stage);
        self
    }

    /// Capacity of every queue in the pipeline.
    pub fn capacity(
        mut self,
        capacity: usize,
    ) -> Self {
        self.capacity = capacity;
        self
    }

    /// Stop the pipeline when `token` is cancelled.
    pub fn token(
        mut self,
        token: &CancellationToken,
    ) -> Self {
        self.token = Some(token.clone());
        self
    }

    /// Report job counts and queue depth to `metrics`.
    pub fn metrics(
        mut self,
        metrics: Arc<dyn FlowMetrics>,
    ) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Wire the queues and start every stage.
    pub fn build(self) -> FlowResult<Pipeline<T, E>> {
        if self.stages.is_empty() {
            return Err(FlowError::EmptyPipeline);
        }
        if self.capacity == 0 {
            return Err(FlowError::InvalidCapacity(self.capacity));
        }
        if let Some(stage) = self.stages.iter().find(|s| s.workers == 0) {
            return Err(FlowError::InvalidWorkerCount(stage.workers));
        }

        // One token instance for every stage and every queue.
        let token = self.token.unwrap_or_default().child();
        let metrics = self.metrics.unwrap_or_else(noop_metrics);

        let input = BoundedQueue::with_cancellation(self.capacity, &token)?;
        let mut current = input.clone();
        let mut groups = Vec::with_capacity(self.stages.len());

        for stage in self.stages {
            let output = BoundedQueue::with_cancellation(self.capacity, &token)?;
            let step = stage_step(stage.name.clone(), stage.func, metrics.clone());
            let mut group = WorkerGroup::new(
                stage.name,
                stage.workers,
                current,
                output.clone(),
                token.clone(),
                metrics.clone(),
                step,
            )?;
            if let Err(err) = group.start() {
                token.cancel();
                return Err(err);
            }
            groups.push(group);
            // This stage's output is the next stage's input.
            current = output;
        }

        debug!(stages = groups.len(), capacity = self.capacity, "pipeline started");

        Ok(Pipeline {
            input,
            output: current,
            token,
            groups,
            sequence: SequenceGenerator::new(),
        })
    }
}

impl<T, E> Default for PipelineBuilder<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

/// A running chain of stages.
///
/// # Example
///
/// ```
/// use flowq::runtime::flow::{CancellationToken, Job, Pipeline, Stage};
///
/// let token = CancellationToken::new();
/// let mut pipeline: Pipeline<i64, String> = Pipeline::compose(
///     vec![
///         Stage::filter("even", 1, |n: &i64| n % 2 == 0),
///         Stage::map("square", 1, |n: i64| n * n),
///         Stage::map("half", 1, |n: i64| n / 2),
///     ],
///     4,
///     &token,
/// )
/// .unwrap();
///
/// let producer = {
///     let input = pipeline.input().clone();
///     std::thread::spawn(move || {
///         for n in 0..=8i64 {
///             input.put(Job::with_seq(n as u64, Ok(n))).unwrap();
///         }
///         input.close();
///     })
/// };
///
/// let values: Vec<i64> = pipeline
///     .collect()
///     .into_iter()
///     .map(|job| job.payload.unwrap())
///     .collect();
/// producer.join().unwrap();
/// pipeline.join().unwrap();
///
/// assert_eq!(values, vec![0, 2, 8, 18, 32]);
/// ```
pub struct Pipeline<T, E> {
    input: BoundedQueue<Outcome<T, E>>,
    output: BoundedQueue<Outcome<T, E>>,
    token: CancellationToken,
    groups: Vec<WorkerGroup<Outcome<T, E>, Outcome<T, E>>>,
    sequence: SequenceGenerator,
}

impl<T, E> Pipeline<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Chain `stages` with queues of `capacity`, cancelled by `token`, and
    /// start them.
    ///
    /// Fails with [`FlowError::EmptyPipeline`] without stages,
    /// [`FlowError::InvalidCapacity`] for a zero capacity and
    /// [`FlowError::InvalidWorkerCount`] for a stage with zero workers.
    pub fn compose(
        stages: Vec<Stage<T, E>>,
        capacity: usize,
        token: &CancellationToken,
    ) -> FlowResult<Self> {
        stages
            .into_iter()
            .fold(PipelineBuilder::new(), PipelineBuilder::stage)
            .capacity(capacity)
            .token(token)
            .build()
    }

    /// Start configuring a pipeline.
    #[inline]
    pub fn builder() -> PipelineBuilder<T, E> {
        PipelineBuilder::new()
    }

    /// Queue feeding the first stage.
    #[inline]
    pub fn input(&self) -> &BoundedQueue<Outcome<T, E>> {
        &self.input
    }

    /// Queue written by the last stage.
    #[inline]
    pub fn output(&self) -> &BoundedQueue<Outcome<T, E>> {
        &self.output
    }

    /// Put `payload` on the input with the next sequence number, returning
    /// that number.
    pub fn submit(
        &self,
        payload: T,
    ) -> FlowResult<u64> {
        let seq = self.sequence.next();
        self.input.put(Job::with_seq(seq, Ok(payload)))?;
        Ok(seq)
    }

    /// Close the input; stages drain what is buffered and close in turn.
    #[inline]
    pub fn close_input(&self) -> bool {
        self.input.close()
    }

    /// Drain the output until it closes or the pipeline is cancelled.
    pub fn collect(&self) -> Vec<Outcome<T, E>> {
        self.output.iter().collect()
    }

    /// Cancel every stage. Buffered items are left undelivered.
    #[inline]
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    /// Wait for every stage's workers to exit.
    pub fn join(&mut self) -> FlowResult<()> {
        let mut result = Ok(());
        for group in &mut self.groups {
            let joined = group.join();
            if result.is_ok() {
                result = joined;
            }
        }
        result
    }

    /// The token shared by every stage.
    #[inline]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Number of stages.
    #[inline]
    pub fn stage_count(&self) -> usize {
        self.groups.len()
    }

    /// Name and lifecycle state of every stage, in order.
    pub fn stage_states(&self) -> Vec<(String, PoolState)> {
        self.groups
            .iter()
            .map(|g| (g.name().to_string(), g.state()))
            .collect()
    }
}

impl<T, E> fmt::Debug for Pipeline<T, E> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("stages", &self.groups)
            .field("token", &self.token)
            .finish()
    }
}

/// A running merge of several queues into one.
pub struct FanIn<T> {
    output: BoundedQueue<T>,
    token: CancellationToken,
    open: Arc<AtomicUsize>,
    handles: Vec<thread::JoinHandle<()>>,
}

/// Decrements the open-source count when a forwarding loop ends; the last
/// one closes the merged queue.
struct SourceGuard<'a, T> {
    open: &'a AtomicUsize,
    output: &'a BoundedQueue<T>,
    source: usize,
}

impl<T> Drop for SourceGuard<'_, T> {
    fn drop(&mut self) {
        let left = self.open.fetch_sub(1, Ordering::SeqCst) - 1;
        trace!(source = self.source, open = left, "fan-in source finished");
        if left == 0 {
            self.output.close();
            debug!("fan-in complete, merged queue closed");
        }
    }
}

/// Merge `sources` into one queue of `capacity`.
///
/// One forwarding thread per source. The merged queue closes only after every
/// source has been closed and drained (or the token fires). Items from one
/// source keep their relative order; items from different sources interleave
/// arbitrarily.
pub fn fan_in<T>(
    sources: Vec<BoundedQueue<T>>,
    capacity: usize,
    token: &CancellationToken,
) -> FlowResult<FanIn<T>>
where
    T: Send + 'static,
{
    if sources.is_empty() {
        return Err(FlowError::NoSources);
    }

    let token = token.child();
    let output = BoundedQueue::with_cancellation(capacity, &token)?;
    let open = Arc::new(AtomicUsize::new(sources.len()));
    let mut handles = Vec::with_capacity(sources.len());
    let total = sources.len();

    for (source_id, source) in sources.into_iter().enumerate() {
        source.watch(&token);
        let output_handle = output.clone();
        let open_handle = open.clone();
        let token_handle = token.clone();

        let spawned = thread::Builder::new()
            .name(format!("flowq-fan-in-{}", source_id))
            .spawn(move || {
                let _guard = SourceGuard {
                    open: &open_handle,
                    output: &output_handle,
                    source: source_id,
                };
                while let Ok(item) = source.take_until(&token_handle) {
                    if output_handle.put(item).is_err() {
                        break;
                    }
                }
            });

        match spawned {
            Ok(handle) => handles.push(handle),
            Err(err) => {
                warn!(source = source_id, error = %err, "failed to spawn fan-in forwarder");
                token.cancel();
                // Sources that never got a forwarder still count as finished.
                if open.fetch_sub(total - source_id, Ordering::SeqCst) == total - source_id {
                    output.close();
                }
                return Err(FlowError::Spawn(err.to_string()));
            },
        }
    }

    debug!(sources = total, "fan-in started");
    Ok(FanIn {
        output,
        token,
        open,
        handles,
    })
}

impl<T> FanIn<T> {
    /// The merged queue.
    #[inline]
    pub fn output(&self) -> &BoundedQueue<T> {
        &self.output
    }

    /// Sources whose forwarding loop has not finished yet.
    #[inline]
    pub fn open_sources(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Stop forwarding. Items still buffered in sources are left there.
    #[inline]
    pub fn cancel(&self) -> bool {
        self.token.cancel()
    }

    /// Wait for every forwarding thread to finish.
    pub fn join(&mut self) -> FlowResult<()> {
        let mut result = Ok(());
        for handle in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                if result.is_ok() {
                    result = Err(FlowError::WorkerPanicked(panic_message(payload.as_ref())));
                }
            }
        }
        result
    }
}

impl<T> fmt::Debug for FanIn<T> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("FanIn")
            .field("open_sources", &self.open_sources())
            .field("output", &self.output)
            .finish()
    }
}

impl<T> Drop for FanIn<T> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.token.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
