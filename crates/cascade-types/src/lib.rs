//! Shared domain types for Cascade.
//!
//! This crate contains the types exchanged between the engine, its storage
//! backends and the CLI: task and run statuses, trigger rules, retry
//! policies, persisted run/attempt/snapshot records, engine configuration and
//! the repository error type.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod error;
pub mod workflow;
