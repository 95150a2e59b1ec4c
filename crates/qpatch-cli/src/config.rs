//! Configuration loading for the qpatch CLI.
//!
//! # Configuration File Locations
//!
//! - Unix: `~/.config/qpatch/qpatch.toml`
//! - Windows: `%APPDATA%\qpatch\config\qpatch.toml`
//!
//! `--config` replaces the default location. A missing default file means the
//! built-in configuration; a missing explicit file is an error.

use std::path::{Path, PathBuf};

use qpatch_core::{PatcherError, PipelineConfig};
use thiserror::Error;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Explicitly requested file does not exist
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// File could not be read or parsed
    #[error("Failed to load config: {0}")]
    Load(#[from] PatcherError),

    /// Configuration is unusable
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Default config file path for this platform.
pub fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "qpatch")
        .map(|dirs| dirs.config_dir().join("qpatch.toml"))
}

/// A configuration together with the file it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: PipelineConfig,
    pub source: Option<PathBuf>,
}

impl LoadedConfig {
    /// Directory relative patch paths are resolved against.
    pub fn base_dir(&self) -> PathBuf {
        self.source
            .as_deref()
            .and_then(Path::parent)
            .filter(|parent| !parent.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Load from `explicit`, else from the default location, else built-in defaults.
pub fn load_config(explicit: Option<&Path>) -> Result<LoadedConfig, ConfigError> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        return load_existing(path);
    }

    match default_config_path() {
        Some(path) if path.is_file() => load_existing(&path),
        _ => Ok(LoadedConfig {
            config: PipelineConfig::default(),
            source: None,
        }),
    }
}

fn load_existing(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let config = PipelineConfig::load_from_file(path)?;
    Ok(LoadedConfig {
        config,
        source: Some(path.to_path_buf()),
    })
}

/// Values given on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub discovery_timeout_secs: Option<u64>,
    pub log_level: Option<String>,
}

/// Apply `overrides` and validate the result.
pub fn resolve(
    mut config: PipelineConfig,
    overrides: &CliOverrides,
) -> Result<PipelineConfig, ConfigError> {
    if let Some(secs) = overrides.discovery_timeout_secs {
        config.device.discovery_timeout_secs = Some(secs);
    }
    if let Some(level) = &overrides.log_level {
        config.logging.level = level.clone();
    }
    config
        .validate()
        .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
    Ok(config)
}
