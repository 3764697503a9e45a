//! Engine configuration loader.
//!
//! Reads `config.toml` from the data directory (`~/.cascade/` unless
//! `CASCADE_DATA_DIR` is set) into [`EngineConfig`]. Falls back to defaults
//! when the file is missing or malformed.

use std::path::{Path, PathBuf};

use cascade_types::config::EngineConfig;

use crate::sqlite::pool::database_url_in;

/// Environment variable overriding the data directory.
pub const DATA_DIR_ENV: &str = "CASCADE_DATA_DIR";

/// Data directory: `$CASCADE_DATA_DIR`, else `~/.cascade`.
pub fn default_data_dir() -> PathBuf {
    match std::env::var_os(DATA_DIR_ENV) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cascade"),
    }
}

/// Load engine configuration from `{data_dir}/config.toml`.
///
/// - Missing file: returns [`EngineConfig::default()`].
/// - Unreadable or unparseable file: logs a warning and returns the default.
pub async fn load_engine_config(data_dir: &Path) -> EngineConfig {
    let config_path = data_dir.join("config.toml");

    let content = match tokio::fs::read_to_string(&config_path).await {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!("No config.toml found at {}, using defaults", config_path.display());
            return EngineConfig::default();
        }
        Err(err) => {
            tracing::warn!("Failed to read {}: {err}, using defaults", config_path.display());
            return EngineConfig::default();
        }
    };

    match toml::from_str::<EngineConfig>(&content) {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!("Failed to parse {}: {err}, using defaults", config_path.display());
            EngineConfig::default()
        }
    }
}

/// Database URL to open: the configured one, else `cascade.db` in `data_dir`.
pub fn resolve_database_url(config: &EngineConfig, data_dir: &Path) -> String {
    config
        .database_url
        .clone()
        .unwrap_or_else(|| database_url_in(data_dir))
}
