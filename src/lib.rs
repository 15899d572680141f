//! flowq: bounded concurrent work queues
//!
//! A fixed-capacity blocking queue, worker pools that drain it, multi-stage
//! pipelines with fan-out and fan-in, and a cooperative cancellation token
//! observed at every blocking point.
//!
//! # Example
//!
//! ```
//! use flowq::{BoundedQueue, CancellationToken, FlowError};
//!
//! let token = CancellationToken::new();
//! let queue = BoundedQueue::with_cancellation(2, &token).unwrap();
//!
//! queue.put("job").unwrap();
//! assert_eq!(queue.take(), Ok("job"));
//!
//! token.cancel();
//! assert_eq!(queue.take(), Err(FlowError::Cancelled));
//! ```

#![doc(html_root_url = "https://docs.rs/flowq")]
#![warn(rust_2018_idioms)]

// Public modules
pub mod runtime;

// Utility modules
pub mod util;

// Re-exports
pub use runtime::flow::{
    fan_in, BoundedQueue, CancelReason, CancellationToken, FanIn, FlowError, FlowMetrics,
    FlowResult, FlowStats, Job, JobError, Outcome, Pipeline, PoolState, SequenceGenerator,
    Stage, TryPutError, TryTakeError, WorkerPool,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = "flowq";
