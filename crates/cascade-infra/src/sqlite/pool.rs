//! Database pool with split reader/writer connections in WAL mode.
//!
//! SQLite allows only one writer at a time. `DatabasePool` pairs a
//! multi-connection reader pool for concurrent queries with a single-connection
//! writer pool, so every write (including each `commit_transition`
//! transaction) is serialized. Both use WAL journal mode and enforce foreign
//! keys.
//!
//! The split requires a file-backed database; `sqlite::memory:` would give
//! each pool its own empty database.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};

/// Split read/write pool for SQLite with WAL mode.
///
/// - `reader`: Multi-connection pool (up to 8) for concurrent SELECT queries.
/// - `writer`: Single-connection pool for serialized INSERT/UPDATE/DELETE.
#[derive(Clone)]
pub struct DatabasePool {
    pub reader: SqlitePool,
    pub writer: SqlitePool,
}

impl DatabasePool {
    /// Open (creating if needed) the database and run migrations.
    ///
    /// Migrations run on the writer before the reader pool is opened, so
    /// readers always see the current schema.
    pub async fn new(database_url: &str) -> Result<Self, sqlx::Error> {
        let base_opts = SqliteConnectOptions::from_str(database_url)?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let read_opts = base_opts.clone().read_only(true);
        let write_opts = base_opts;

        let writer = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(write_opts)
            .await?;

        sqlx::migrate!("../../migrations").run(&writer).await?;

        let reader = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(read_opts)
            .await?;

        tracing::debug!(url = database_url, "Database pool ready");
        Ok(Self { reader, writer })
    }
}

/// SQLite URL for `cascade.db` inside a data directory.
pub fn database_url_in(data_dir: &Path) -> String {
    format!("sqlite://{}?mode=rwc", data_dir.join("cascade.db").display())
}

/// Default database URL: `cascade.db` in the default data directory.
pub fn default_database_url() -> String {
    database_url_in(&crate::config::default_data_dir())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pool_creates_tables() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url_in(dir.path())).await.unwrap();

        let tables: Vec<(String,)> = sqlx::query_as(
            "SELECT name FROM sqlite_master WHERE type='table' AND name NOT LIKE 'sqlite_%' AND name != '_sqlx_migrations' ORDER BY name",
        )
        .fetch_all(&pool.reader)
        .await
        .unwrap();

        let table_names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        assert_eq!(
            table_names,
            vec!["context_snapshots", "runs", "task_attempts", "task_states"]
        );
    }

    #[tokio::test]
    async fn test_pool_wal_mode_and_foreign_keys() {
        let dir = tempfile::tempdir().unwrap();
        let pool = DatabasePool::new(&database_url_in(dir.path())).await.unwrap();

        let mode: (String,) = sqlx::query_as("PRAGMA journal_mode")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(mode.0.to_lowercase(), "wal");

        let fk: (i32,) = sqlx::query_as("PRAGMA foreign_keys")
            .fetch_one(&pool.writer)
            .await
            .unwrap();
        assert_eq!(fk.0, 1, "foreign keys should be enabled");
    }

    #[tokio::test]
    async fn test_reopen_existing_database() {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url_in(dir.path());
        drop(DatabasePool::new(&url).await.unwrap());
        assert!(DatabasePool::new(&url).await.is_ok());
    }

    #[test]
    fn test_database_url_in() {
        let url = database_url_in(Path::new("/tmp/cascade-data"));
        assert_eq!(url, "sqlite:///tmp/cascade-data/cascade.db?mode=rwc");
        assert!(default_database_url().ends_with("cascade.db?mode=rwc"));
    }
}
