//! Repository trait definitions (ports) and the in-memory backend.
//!
//! `RunRepository` defines the storage interface that the infrastructure
//! layer (cascade-infra) implements with SQLite. The in-memory backend lives
//! here so the engine can be exercised without any database.

pub mod memory;
pub mod run;

pub use memory::InMemoryRunRepository;
pub use run::RunRepository;
