//! Workflow engine and repository trait definitions for Cascade.
//!
//! This crate holds the scheduler, the task registry, workflow graph
//! validation and the storage "port" (`RunRepository`) that the
//! infrastructure layer implements. It depends only on `cascade-types` --
//! never on `cascade-infra` or any database crate.

pub mod context;
pub mod registry;
pub mod repository;
pub mod runner;
pub mod task;
pub mod workflow;

pub use context::Context;
pub use registry::{TaskRegistry, build_workflow, register_task};
pub use runner::{RunResult, Runner, RunnerConfig, RunnerError};
pub use task::{Task, TaskError, task_fn};
pub use workflow::definition::{WorkflowBuilder, WorkflowDefinition};
