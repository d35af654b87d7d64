//! Configuration management for celljail
//!
//! Handles loading and validation of `celljail.toml` files. Every section is
//! optional; a missing file section falls back to the defaults below.

use crate::error::ConfigError;
use crate::logging::{LogConfig, parse_level};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output for interactive use
    #[default]
    Pretty,
    /// JSON lines for machines
    Json,
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "unknown log format: {s}. Expected one of: pretty, json"
            )),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Logging settings
    #[serde(default)]
    pub logging: LogConfig,

    /// Process-wide bootstrap settings
    #[serde(default)]
    pub bootstrap: BootstrapConfig,

    /// Session registry settings
    #[serde(default)]
    pub sessions: SessionConfig,
}

/// Bootstrap configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BootstrapConfig {
    /// Script run in every newly created cell before user code.
    ///
    /// Relative paths resolve against the directory of the config file.
    #[serde(default)]
    pub script: Option<PathBuf>,
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionConfig {
    /// Whether `send_rpc` creates a cell for an unknown session
    #[serde(default = "default_true")]
    pub auto_create: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { auto_create: true }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        let mut config = Self::from_toml(&text)?;

        if let Some(script) = config.bootstrap.script.as_mut() {
            if script.is_relative() {
                if let Some(dir) = path.parent() {
                    *script = dir.join(&*script);
                }
            }
        }

        Ok(config)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check field values that serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_level(&self.logging.level)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(())
    }

    /// Read the configured bootstrap script, or an empty source when unset
    pub fn bootstrap_source(&self) -> Result<String, ConfigError> {
        match &self.bootstrap.script {
            None => Ok(String::new()),
            Some(path) => std::fs::read_to_string(path)
                .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string())),
        }
    }
}
