//! Worker threads draining one queue into another.
//!
//! [`WorkerGroup`] is the engine behind both [`WorkerPool`](super::WorkerPool)
//! and each pipeline stage: `N` named threads, each looping
//! take → step → put, plus the shutdown barrier that closes the output queue
//! exactly once after the last worker leaves.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicU8, AtomicUsize, Ordering},
    Arc,
};
use std::thread;

use tracing::{debug, info, trace, warn};

use super::cancel::CancellationToken;
use super::error::{FlowError, FlowResult};
use super::job::{panic_message, JobError};
use super::metrics::FlowMetrics;
use super::queue::BoundedQueue;

/// Worker pool lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Built, no threads yet.
    Created,
    /// Workers are taking jobs.
    Running,
    /// A worker saw the input end (closed and drained, or cancelled); the
    /// rest are finishing.
    Draining,
    /// Every worker has exited and the output is closed.
    Stopped,
}

impl PoolState {
    /// Convert from u8 (for atomic storage).
    #[inline]
    pub fn from_u8(val: u8) -> Self {
        match val {
            0 => PoolState::Created,
            1 => PoolState::Running,
            2 => PoolState::Draining,
            _ => PoolState::Stopped,
        }
    }

    /// Convert to u8 (for atomic storage).
    #[inline]
    pub fn as_u8(&self) -> u8 {
        match self {
            PoolState::Created => 0,
            PoolState::Running => 1,
            PoolState::Draining => 2,
            PoolState::Stopped => 3,
        }
    }
}

impl fmt::Display for PoolState {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        let name = match self {
            PoolState::Created => "created",
            PoolState::Running => "running",
            PoolState::Draining => "draining",
            PoolState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Run `f` on `input`, turning an `Err` or a panic into a [`JobError`].
pub(crate) fn run_guarded<T, R, E, F>(
    f: &F,
    input: T,
) -> Result<R, JobError<E>>
where
    F: Fn(T) -> Result<R, E> + ?Sized,
{
    match panic::catch_unwind(AssertUnwindSafe(|| f(input))) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(JobError::Failed(err)),
        Err(payload) => Err(JobError::from_panic(payload)),
    }
}

/// One input item in, at most one output item out.
pub(crate) type StepFn<I, O> = dyn Fn(I) -> Option<O> + Send + Sync;

struct GroupShared<I, O> {
    name: String,
    input: BoundedQueue<I>,
    output: BoundedQueue<O>,
    token: CancellationToken,
    step: Box<StepFn<I, O>>,
    metrics: Arc<dyn FlowMetrics>,
    /// Workers that have not exited yet.
    remaining: AtomicUsize,
    state: AtomicU8,
}

impl<I, O> GroupShared<I, O> {
    #[inline]
    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn enter_draining(&self) {
        let _ = self.state.compare_exchange(
            PoolState::Running.as_u8(),
            PoolState::Draining.as_u8(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Shutdown barrier: the worker that brings `remaining` to zero closes
    /// the output. `fetch_sub` hands that role to exactly one thread.
    fn worker_exited(&self) {
        if self.remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.output.close();
            self.state
                .store(PoolState::Stopped.as_u8(), Ordering::SeqCst);
            info!(pool = %self.name, "worker pool stopped");
        }
    }
}

/// Runs on every worker exit path, including unwinding.
struct ExitGuard<'a, I, O> {
    shared: &'a GroupShared<I, O>,
    worker_id: usize,
}

impl<I, O> Drop for ExitGuard<'_, I, O> {
    fn drop(&mut self) {
        debug!(pool = %self.shared.name, worker = self.worker_id, "worker exited");
        self.shared.enter_draining();
        self.shared.worker_exited();
    }
}

/// `N` workers draining `input` through a step function into `output`.
pub(crate) struct WorkerGroup<I, O> {
    shared: Arc<GroupShared<I, O>>,
    size: usize,
    handles: Vec<thread::JoinHandle<()>>,
}

impl<I, O> WorkerGroup<I, O>
where
    I: Send + 'static,
    O: Send + 'static,
{
    /// Validate the worker count and wire both queues to `token`.
    pub(crate) fn new(
        name: String,
        size: usize,
        input: BoundedQueue<I>,
        output: BoundedQueue<O>,
        token: CancellationToken,
        metrics: Arc<dyn FlowMetrics>,
        step: Box<StepFn<I, O>>,
    ) -> FlowResult<Self> {
        if size == 0 {
            return Err(FlowError::InvalidWorkerCount(size));
        }

        input.watch(&token);
        output.watch(&token);

        Ok(Self {
            shared: Arc::new(GroupShared {
                name,
                input,
                output,
                token,
                step,
                metrics,
                remaining: AtomicUsize::new(0),
                state: AtomicU8::new(PoolState::Created.as_u8()),
            }),
            size,
            handles: Vec::with_capacity(size),
        })
    }

    /// Spawn the workers.
    pub(crate) fn start(&mut self) -> FlowResult<()> {
        if self
            .shared
            .state
            .compare_exchange(
                PoolState::Created.as_u8(),
                PoolState::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(FlowError::AlreadyStarted);
        }

        self.shared.remaining.store(self.size, Ordering::SeqCst);

        for worker_id in 0..self.size {
            let shared = self.shared.clone();
            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", self.shared.name, worker_id))
                .spawn(move || Self::worker_loop(worker_id, &shared));

            match spawned {
                Ok(handle) => self.handles.push(handle),
                Err(err) => {
                    warn!(pool = %self.shared.name, worker = worker_id, error = %err, "failed to spawn worker");
                    // Account for the workers that will never run so the
                    // barrier still closes the output.
                    for _ in worker_id..self.size {
                        self.shared.enter_draining();
                        self.shared.worker_exited();
                    }
                    return Err(FlowError::Spawn(err.to_string()));
                },
            }
        }

        debug!(pool = %self.shared.name, workers = self.size, "worker pool started");
        Ok(())
    }

    /// Worker thread main loop.
    fn worker_loop(
        worker_id: usize,
        shared: &GroupShared<I, O>,
    ) {
        let _guard = ExitGuard { shared, worker_id };
        debug!(pool = %shared.name, worker = worker_id, "worker started");

        loop {
            if shared.token.is_done() {
                trace!(pool = %shared.name, worker = worker_id, "cancelled before take");
                break;
            }

            let item = match shared.input.take_until(&shared.token) {
                Ok(item) => item,
                Err(err) => {
                    trace!(pool = %shared.name, worker = worker_id, %err, "input finished");
                    break;
                },
            };
            shared
                .metrics
                .queue_depth(&shared.name, shared.input.len());

            let Some(out) = (shared.step)(item) else {
                continue;
            };

            if let Err(err) = shared.output.put_until(out, &shared.token) {
                trace!(pool = %shared.name, worker = worker_id, %err, "output rejected result");
                break;
            }
        }
    }

    /// Wait for every worker to exit.
    pub(crate) fn join(&mut self) -> FlowResult<()> {
        let mut result = Ok(());
        for handle in self.handles.drain(..) {
            if let Err(payload) = handle.join() {
                let message = panic_message(payload.as_ref());
                warn!(pool = %self.shared.name, %message, "worker thread panicked");
                if result.is_ok() {
                    result = Err(FlowError::WorkerPanicked(message));
                }
            }
        }
        result
    }

    /// Cancel the group's token and wait for the workers.
    ///
    /// A group that was never started is marked stopped and its output
    /// closed directly.
    pub(crate) fn stop(&mut self) -> FlowResult<()> {
        self.shared.token.cancel();
        if self
            .shared
            .state
            .compare_exchange(
                PoolState::Created.as_u8(),
                PoolState::Stopped.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            self.shared.output.close();
            return Ok(());
        }
        self.join()
    }

    #[inline]
    pub(crate) fn state(&self) -> PoolState {
        self.shared.state()
    }

    #[inline]
    pub(crate) fn name(&self) -> &str {
        &self.shared.name
    }

    #[inline]
    pub(crate) fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub(crate) fn input(&self) -> &BoundedQueue<I> {
        &self.shared.input
    }

    #[inline]
    pub(crate) fn output(&self) -> &BoundedQueue<O> {
        &self.shared.output
    }

    #[inline]
    pub(crate) fn token(&self) -> &CancellationToken {
        &self.shared.token
    }
}

impl<I, O> fmt::Debug for WorkerGroup<I, O> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("name", &self.shared.name)
            .field("size", &self.size)
            .field("state", &self.shared.state())
            .field("remaining", &self.shared.remaining.load(Ordering::SeqCst))
            .finish()
    }
}

impl<I, O> Drop for WorkerGroup<I, O> {
    fn drop(&mut self) {
        if self.handles.is_empty() {
            return;
        }
        self.shared.token.cancel();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}
