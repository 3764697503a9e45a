//! Infrastructure layer for Cascade.
//!
//! Contains the SQLite implementation of the `RunRepository` port defined in
//! `cascade-core`, and the TOML engine configuration loader.

pub mod config;
pub mod sqlite;
