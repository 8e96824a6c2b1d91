//! Daemon configuration (`~/.coverage/daemon/config.toml`).
//!
//! A missing file means defaults. A malformed one is an error the caller
//! reports before falling back.

use std::path::PathBuf;

use coverage_core::EngineConfig;
use serde::Deserialize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    pub engine: EngineConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// Overrides `~/.coverage/daemon/scopes.db`.
    pub db_path: Option<PathBuf>,
}

pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(crate::daemon_dir()?.join("config.toml"))
}

pub fn load_config(path: Option<PathBuf>) -> Result<DaemonConfig, String> {
    let config_path = match path {
        Some(path) => path,
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(DaemonConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read daemon config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<DaemonConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse daemon config {}: {}",
            config_path.display(),
            err
        )
    })
}
