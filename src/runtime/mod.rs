//! Runtime system
//!
//! This module contains the bounded queue, worker pools, pipelines and the
//! cancellation token that ties them together.

pub mod flow;
