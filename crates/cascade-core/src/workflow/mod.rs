//! Workflow graph, scheduling and checkpointing.
//!
//! - `definition` / `dag`: building and validating workflow graphs
//! - `trigger` / `retry`: the pure decision functions the scheduler consults
//! - `checkpoint`: durable run state on top of a `RunRepository`
//! - `executor`: the scheduler that drives a run to completion

pub mod checkpoint;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod retry;
pub mod trigger;
