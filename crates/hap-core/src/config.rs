//! TOML configuration for the accessory server.
//!
//! Every section is optional; missing keys fall back to defaults, so an empty
//! file (or no file at all) yields a working accessory named "Accessory" with
//! the default setup code.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::setup_code::{SetupCode, DEFAULT_SETUP_CODE};

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Accessory identity and pairing settings.
    pub accessory: AccessoryConfig,

    /// Listener settings.
    pub server: ServerConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AccessoryConfig {
    /// Display name; also the default storage directory.
    pub name: String,

    /// Eight digit setup code, with or without dashes.
    pub setup_code: String,

    /// Directory holding the identity and pairing records.
    /// Defaults to a directory named after the accessory.
    pub storage_path: Option<PathBuf>,

    /// Accessory category advertised to controllers (1 = other).
    pub category: u8,

    /// Optional JSON file with the accessory database served on `/accessories`.
    pub accessories_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind.
    pub bind_address: IpAddr,

    /// TCP port; 0 picks a free port.
    pub port: u16,

    /// Upper bound on simultaneously open connections.
    pub max_connections: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Logging level (trace, debug, info, warn, error).
    pub level: String,

    /// Also write logs to this file.
    pub file: Option<PathBuf>,
}

impl Default for AccessoryConfig {
    fn default() -> Self {
        Self {
            name: "Accessory".to_string(),
            setup_code: DEFAULT_SETUP_CODE.to_string(),
            storage_path: None,
            category: 1,
            accessories_file: None,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::from([0, 0, 0, 0]),
            port: 0,
            max_connections: 16,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.accessory.name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "accessory name must not be empty".to_string(),
            ));
        }
        SetupCode::parse(&self.accessory.setup_code)?;
        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.logging.level.clone()));
        }
        if self.server.max_connections == 0 {
            return Err(ConfigError::Invalid(
                "max_connections must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// The parsed setup code.
    pub fn setup_code(&self) -> Result<SetupCode, ConfigError> {
        SetupCode::parse(&self.accessory.setup_code)
    }

    /// Storage directory, defaulting to the accessory name.
    pub fn storage_path(&self) -> PathBuf {
        self.accessory
            .storage_path
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.accessory.name))
    }
}
