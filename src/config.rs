//! Configuration module for the status file locations.
//!
//! Only the output paths are configurable. The polling thresholds are
//! fixed constants in [`crate::scheduler`].

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default plain-text status file.
pub const DEFAULT_STATUS_FILE: &str = "/tmp/fuhlen_battery";
/// Default JSON status file.
pub const DEFAULT_STATUS_JSON_FILE: &str = "/tmp/fuhlen_battery.json";

/// Monitor configuration.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Receives `"NN%"` or `"N/A"`
    pub status_file: PathBuf,
    /// Receives `{"percentage": NN, "is_present": bool}`
    pub status_json_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            status_file: PathBuf::from(DEFAULT_STATUS_FILE),
            status_json_file: PathBuf::from(DEFAULT_STATUS_JSON_FILE),
        }
    }
}

impl Config {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, path) in [
            ("status_file", &self.status_file),
            ("status_json_file", &self.status_json_file),
        ] {
            if !path.is_absolute() {
                return Err(ConfigError::ValidationError(format!(
                    "{} ({}) must be an absolute path",
                    name,
                    path.display()
                )));
            }
        }

        if self.status_file == self.status_json_file {
            return Err(ConfigError::ValidationError(format!(
                "status_file and status_json_file must differ (both are {})",
                self.status_file.display()
            )));
        }

        Ok(())
    }
}

/// Configuration loaded from disk.
pub struct ConfigManager {
    config: Config,
    path: PathBuf,
}

impl ConfigManager {
    /// Load configuration from file or use defaults.
    /// If the file doesn't exist, returns a manager with default config.
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let contents = fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
                path: path.display().to_string(),
                source: e,
            })?;

            let config: Config = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::ParseError(format!("Invalid JSON: {}", e)))?;

            config.validate()?;
            config
        } else {
            Config::default()
        };

        Ok(Self {
            config,
            path: path.to_path_buf(),
        })
    }

    /// Like [`Self::load_or_default`], but a broken file only costs a warning.
    pub fn load_or_warn(path: &Path) -> Self {
        Self::load_or_default(path).unwrap_or_else(|e| {
            tracing::warn!(
                "Ignoring configuration at {}: {}; using defaults",
                path.display(),
                e
            );
            Self {
                config: Config::default(),
                path: path.to_path_buf(),
            }
        })
    }

    /// Get current configuration.
    pub fn get(&self) -> Config {
        self.config.clone()
    }

    /// Get the config file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the default config path (~/.config/fuhlen-monitor/config.json).
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("fuhlen-monitor")
            .join("config.json")
    }
}
