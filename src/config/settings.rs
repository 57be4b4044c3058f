//! Application settings

use super::ConfigError;
use crate::core::calibrate::{CalibrationScript, CalibrationStep, DEFAULT_IDENTITY};
use crate::core::context::{LineTerminator, Verbosity};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Device selection and line settings
    pub device: DeviceConfig,
    /// Command/response timing
    pub protocol: ProtocolConfig,
    /// Reset behavior
    pub reset: ResetConfig,
    /// Diagnostics
    pub logging: LoggingConfig,
    /// Calibration script
    pub calibration: CalibrationConfig,
}

impl AppConfig {
    /// Load config from the default location; a missing file yields defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&super::default_config_path()?)
    }

    /// Load config from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<(), ConfigError> {
        self.save_to(&super::default_config_path()?)
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        let write_error = |reason: String| ConfigError::Write {
            path: path.to_path_buf(),
            reason,
        };
        let content = toml::to_string_pretty(self).map_err(|e| write_error(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| write_error(e.to_string()))?;
        }
        std::fs::write(path, content).map_err(|e| write_error(e.to_string()))
    }
}

/// Default device for this platform
fn default_device_path() -> String {
    if cfg!(windows) {
        "COM3".to_string()
    } else if cfg!(target_os = "freebsd") {
        "/dev/cuaU0".to_string()
    } else {
        "/dev/ttyACM0".to_string()
    }
}

/// Device settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Device path
    pub path: String,
    /// Line settings, `BAUD[,parity[,bits[,stop]]]`
    pub settings: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            path: default_device_path(),
            settings: "9600,n,8,1".to_string(),
        }
    }
}

/// Protocol timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Line terminator
    pub terminator: LineTerminator,
    /// Overall reply wait (ms)
    pub reply_timeout_ms: u64,
    /// Retransmission interval (ms), 0 disables
    pub repeat_interval_ms: u64,
    /// Quiet period ending a question reply (ms)
    pub question_wait_ms: u64,
    /// Reply accumulator cap (bytes)
    pub reply_cap: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            terminator: LineTerminator::CrLf,
            reply_timeout_ms: 10_000,
            repeat_interval_ms: 1_000,
            question_wait_ms: 5_000,
            reply_cap: 4096,
        }
    }
}

/// Reset settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResetConfig {
    /// Reset the device before each session
    pub enabled: bool,
    /// Seconds to wait for the device after reset
    pub wait_secs: u64,
    /// Raise DTR/RTS when not resetting
    pub flow_control: bool,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            wait_secs: 5,
            flow_control: false,
        }
    }
}

/// Logging settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Diagnostic verbosity, 0 to 8
    pub verbosity: Verbosity,
    /// Also log to this file
    pub file: Option<PathBuf>,
}

/// Calibration script settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    /// Identity prefix used when `steps` is empty
    pub identity_prefix: String,
    /// Script steps; empty means the built-in script
    pub steps: Vec<CalibrationStep>,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            identity_prefix: DEFAULT_IDENTITY.to_string(),
            steps: Vec::new(),
        }
    }
}

impl CalibrationConfig {
    /// The script to run: configured steps, or the built-in script with the
    /// configured identity prefix
    pub fn script(&self) -> CalibrationScript {
        if !self.steps.is_empty() {
            return CalibrationScript {
                steps: self.steps.clone(),
            };
        }
        let mut script = CalibrationScript::default();
        for step in &mut script.steps {
            if let CalibrationStep::Identify { expect_prefix, .. } = step {
                expect_prefix.clone_from(&self.identity_prefix);
            }
        }
        script
    }
}
