//! Configuration for the portal-fusion CLI.
//!
//! Stored as TOML in the platform config directory:
//!
//! - Unix: `~/.config/portal-fusion/cli.toml`
//! - Windows: `%APPDATA%\portal-fusion\cli.toml`
//!
//! The `[core]` table is handed unchanged to the core library.

use std::path::{Path, PathBuf};

use pf_core::config::CoreConfig;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// # Example TOML
///
/// ```toml
/// [device]
/// name = "workstation"
///
/// [storage]
/// backend = "json"  # "json" | "sqlite"
/// path = ""         # Empty = default data directory
///
/// [output]
/// format = "table"  # "table" | "json" | "quiet"
///
/// [core.pairing]
/// session_ttl_secs = 300
/// pin_digits = 6
/// max_pin_attempts = 3
///
/// [core.logging]
/// level = "warn"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub device: DeviceConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub output: OutputConfig,

    #[serde(default)]
    pub core: CoreConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Name used when the local identity is first created
    #[serde(default = "default_device_name")]
    pub name: String,
}

fn default_device_name() -> String {
    "portal-fusion-device".to_string()
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "json" or "sqlite"
    #[serde(default = "default_backend")]
    pub backend: String,

    /// Store location (empty = default data directory)
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_backend() -> String {
    "json".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            path: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// "table", "json" or "quiet"
    #[serde(default = "default_format")]
    pub format: String,
}

fn default_format() -> String {
    "table".to_string()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_format(),
        }
    }
}

const VALID_BACKENDS: [&str; 2] = ["json", "sqlite"];
const VALID_FORMATS: [&str; 3] = ["table", "json", "quiet"];

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_default() -> Result<Self, ConfigError> {
        if let Some(path) = Self::default_path() {
            if path.exists() {
                return Self::load(&path);
            }
        }
        Ok(Self::default())
    }

    pub fn load_from(custom_path: Option<&Path>) -> Result<Self, ConfigError> {
        match custom_path {
            Some(path) => Self::load(path),
            None => Self::load_default(),
        }
    }

    fn project_dirs() -> Option<directories::ProjectDirs> {
        directories::ProjectDirs::from("io", "portalfusion", "portal-fusion")
    }

    pub fn default_path() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.config_dir().join("cli.toml"))
    }

    pub fn data_dir() -> Option<PathBuf> {
        Self::project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
    }

    /// Resolved store location: the configured path, or a file in the data
    /// directory named after the backend.
    pub fn store_path(&self) -> Result<PathBuf, ConfigError> {
        if let Some(path) = &self.storage.path {
            if !path.as_os_str().is_empty() {
                return Ok(path.clone());
            }
        }
        let file = match self.storage.backend.as_str() {
            "sqlite" => "portal-fusion.db",
            _ => "portal-fusion.json",
        };
        Self::data_dir()
            .map(|dir| dir.join(file))
            .ok_or_else(|| ConfigError::ValidationError("no data directory available".into()))
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Write the default config on first run. Returns whether a file was created.
    pub fn create_default_if_missing() -> Result<bool, ConfigError> {
        if let Some(path) = Self::default_path() {
            if !path.exists() {
                Self::default().save(&path)?;
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.name.trim().is_empty() {
            return Err(ConfigError::ValidationError("device name must not be empty".into()));
        }
        if !VALID_BACKENDS.contains(&self.storage.backend.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid storage backend '{}'. Valid values: {:?}",
                self.storage.backend, VALID_BACKENDS
            )));
        }
        if !VALID_FORMATS.contains(&self.output.format.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid output format '{}'. Valid values: {:?}",
                self.output.format, VALID_FORMATS
            )));
        }
        self.core
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))
    }

    /// Apply command-line overrides; flags win over the file.
    pub fn with_overrides(mut self, overrides: &CliOverrides) -> Self {
        if let Some(format) = &overrides.output_format {
            self.output.format = format.clone();
        }
        if let Some(path) = &overrides.store_path {
            self.storage.path = Some(path.clone());
        }
        if let Some(backend) = &overrides.backend {
            self.storage.backend = backend.clone();
        }
        if let Some(name) = &overrides.device_name {
            self.device.name = name.clone();
        }
        if overrides.debug == Some(true) {
            self.core.logging.level = "debug".to_string();
        } else if overrides.verbose == Some(true) {
            self.core.logging.level = "info".to_string();
        }
        self
    }
}

/// Values given on the command line that take precedence over the file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub output_format: Option<String>,
    pub store_path: Option<PathBuf>,
    pub backend: Option<String>,
    pub device_name: Option<String>,
    pub verbose: Option<bool>,
    pub debug: Option<bool>,
}
