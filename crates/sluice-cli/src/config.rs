//! CLI configuration management.

use serde::{Deserialize, Serialize};
use sluice_scheduler::EngineConfig;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Engine(#[from] sluice_scheduler::ConfigError),
}

/// User-level CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CliConfig {
    /// Engine config used when `--config` is not given.
    #[serde(default)]
    pub engine_config: Option<PathBuf>,
    /// Log level when `RUST_LOG` is unset.
    #[serde(default)]
    pub log_level: Option<String>,
}

impl CliConfig {
    /// Load from the user config directory; missing file means defaults.
    pub fn load() -> Result<Self, CliConfigError> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, CliConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| CliConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yaml::from_str(&content).map_err(|source| CliConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn config_path() -> Result<PathBuf, CliConfigError> {
        let dirs = directories::ProjectDirs::from("dev", "sluice", "sluice")
            .ok_or(CliConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Engine configuration: the explicit path, else the configured one,
    /// else defaults.
    pub fn engine_config(&self, explicit: Option<&Path>) -> Result<EngineConfig, CliConfigError> {
        let mut config = match explicit.or(self.engine_config.as_deref()) {
            Some(path) => EngineConfig::from_file(path)?,
            None => EngineConfig::default(),
        };
        if let Some(level) = &self.log_level {
            config.tracing.level = level.clone();
        }
        Ok(config)
    }
}
