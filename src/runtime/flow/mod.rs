//! Bounded work coordination.
//!
//! Leaves first:
//!
//! - [`BoundedQueue`] - fixed-capacity blocking FIFO
//! - [`CancellationToken`] - cooperative cancellation / deadline signal
//! - [`WorkerPool`] - `N` workers draining a job queue into a result queue
//! - [`Pipeline`] / [`Stage`] - chained worker groups (fan-out), and
//!   [`fan_in`] to merge queues
//!
//! Every blocking point (`put` on a full queue, `take` on an empty one, a
//! pool or fan-in join) races the cancellation token, so callers always get
//! a value, [`FlowError::Closed`] or [`FlowError::Cancelled`].

pub mod cancel;
pub mod error;
pub mod job;
pub mod metrics;
pub mod pipeline;
pub mod pool;
pub mod queue;
mod workers;

pub use cancel::{CancelReason, CancelWatcher, CancellationToken};
pub use error::{FlowError, FlowResult, TryPutError, TryTakeError};
pub use job::{Job, JobError, Outcome, SequenceGenerator};
pub use metrics::{FlowMetrics, FlowStats, NoopMetrics};
pub use pipeline::{fan_in, FanIn, Pipeline, PipelineBuilder, Stage, StageFn};
pub use pool::{WorkerPool, WorkerPoolBuilder};
pub use queue::{BoundedQueue, QueueIter};
pub use workers::PoolState;

#[cfg(test)]
mod tests;
