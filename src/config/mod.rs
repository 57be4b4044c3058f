//! Configuration module
//!
//! Handles the TOML settings file and its location

mod settings;

pub use settings::{
    AppConfig, CalibrationConfig, DeviceConfig, LoggingConfig, ProtocolConfig, ResetConfig,
};

use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// File exists but could not be read
    #[error("Unable to read {path}: {source}")]
    Read {
        /// File involved
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        /// File involved
        path: PathBuf,
        /// Underlying cause
        #[source]
        source: toml::de::Error,
    },

    /// File could not be written
    #[error("Unable to write {path}: {reason}")]
    Write {
        /// File involved
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// No home directory to derive the config location from
    #[error("Could not determine config directory")]
    NoConfigDir,
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "serialcal", "serialcal")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Default location of the settings file
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    config_dir()
        .map(|d| d.join("config.toml"))
        .ok_or(ConfigError::NoConfigDir)
}

/// Load from `path` if given, else from the default location
pub fn load(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match path {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
}
