//! Application state shared by CLI commands.
//!
//! Pins the engine to the SQLite backend in the configured data directory.

use std::path::PathBuf;

use anyhow::Context as _;
use cascade_infra::config::{default_data_dir, load_engine_config, resolve_database_url};
use cascade_infra::sqlite::pool::DatabasePool;
use cascade_infra::sqlite::run::SqliteRunRepository;
use cascade_types::config::EngineConfig;

pub struct AppState {
    pub data_dir: PathBuf,
    pub config: EngineConfig,
    pub repo: SqliteRunRepository,
}

impl AppState {
    /// Resolve the data directory, load `config.toml` and open the database.
    pub async fn init() -> anyhow::Result<Self> {
        let data_dir = default_data_dir();
        tokio::fs::create_dir_all(&data_dir)
            .await
            .with_context(|| format!("failed to create data directory {}", data_dir.display()))?;

        let config = load_engine_config(&data_dir).await;
        let db_url = resolve_database_url(&config, &data_dir);
        let pool = DatabasePool::new(&db_url)
            .await
            .with_context(|| format!("failed to open database {db_url}"))?;

        tracing::debug!(data_dir = %data_dir.display(), "Application state ready");
        Ok(Self {
            data_dir,
            config,
            repo: SqliteRunRepository::new(pool),
        })
    }
}
