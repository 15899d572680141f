//! Flow unit tests
//!
//! Queue, cancellation, job, worker pool and pipeline behaviour.
