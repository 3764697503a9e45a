//! Engine configuration types for Cascade.
//!
//! `EngineConfig` represents the `config.toml` in the Cascade data directory.
//! Every field is optional and falls back to engine defaults.

use serde::{Deserialize, Serialize};

/// Top-level configuration for the Cascade engine.
///
/// Loaded from `~/.cascade/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// SQLite URL for run persistence. Defaults to `{data_dir}/cascade.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_url: Option<String>,

    /// Upper bound on concurrently running tasks per run (unbounded if unset).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    /// Timeout applied to tasks that declare none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_task_timeout_secs: Option<u64>,

    /// Number of runs shown by `cascade runs list` when no limit is given.
    #[serde(default = "default_list_limit")]
    pub list_limit: u32,

    /// Lifetime of the execution lease a runner holds on a run. Renewed while
    /// the run executes; another runner may take the run over once it lapses.
    #[serde(default = "default_run_lease_secs")]
    pub run_lease_secs: u64,
}

fn default_list_limit() -> u32 {
    20
}

fn default_run_lease_secs() -> u64 {
    30
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            max_concurrency: None,
            default_task_timeout_secs: None,
            list_limit: default_list_limit(),
            run_lease_secs: default_run_lease_secs(),
        }
    }
}
