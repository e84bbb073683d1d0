//! Configuration management for leakprobe
//!
//! Handles loading of `leakprobe.toml` files and the string key/value
//! [`Properties`] view handed to the storage client collaborator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::harness::HarnessConfig;
use crate::monitor::MonitorConfig;
use crate::registry::TaskPattern;

/// Enables the client-side throttling analyzers (and their timers).
pub const ENABLE_AUTOTHROTTLING: &str = "fs.azure.enable.autothrottling";
/// Analyzer timer period in milliseconds.
pub const ANALYSIS_PERIOD: &str = "fs.azure.analysis.period";
/// Idle time in milliseconds after which an analyzer suspends its analysis.
pub const ACCOUNT_OPERATION_IDLE_TIMEOUT: &str = "fs.azure.account.operation.idle.timeout";
/// Authentication mode of the client library.
pub const SECURITY_AUTHENTICATION: &str = "hadoop.security.authentication";

/// Keys shown in the configuration section of the final report.
pub const REPORTED_KEYS: [&str; 4] = [
    ENABLE_AUTOTHROTTLING,
    ANALYSIS_PERIOD,
    ACCOUNT_OPERATION_IDLE_TIMEOUT,
    SECURITY_AUTHENTICATION,
];

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Repeated open/probe/close cycles
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Broken-vs-fixed comparison
    #[serde(default)]
    pub compare: HarnessConfig,

    /// Task name matching
    #[serde(default)]
    pub pattern: TaskPattern,

    /// Key/value properties passed to the storage client
    #[serde(default)]
    pub properties: Properties,
}

/// General configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,

    /// Optional log file
    #[serde(default)]
    pub log_file: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            log_file: None,
        }
    }
}

fn default_log_level() -> String {
    "warn".to_string()
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-friendly output
    #[default]
    Pretty,
    /// JSON lines
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
            _ => Err(format!("unknown log format: {s}. Expected one of: pretty, json")),
        }
    }
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFailed {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(raw: &str) -> Result<Self, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Serialize the effective configuration back to TOML
    pub fn to_toml_string(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// String key/value lookup with string defaults.
///
/// Read-only from the harness point of view; `set` only touches the
/// in-memory map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Default for Properties {
    fn default() -> Self {
        let mut map = BTreeMap::new();
        map.insert(SECURITY_AUTHENTICATION.to_string(), "simple".to_string());
        Self(map)
    }
}

impl Properties {
    /// An empty property set (no defaults applied).
    #[must_use]
    pub fn empty() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    /// Raw lookup.
    #[must_use]
    pub fn get_opt(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Lookup with a string default.
    #[must_use]
    pub fn get(&self, key: &str, default: &str) -> String {
        self.get_opt(key).unwrap_or(default).to_string()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> Result<bool, ConfigError> {
        match self.get_opt(key) {
            None => Ok(default),
            Some(raw) => match raw.trim().to_lowercase().as_str() {
                "true" => Ok(true),
                "false" => Ok(false),
                _ => Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: raw.to_string(),
                }),
            },
        }
    }

    pub fn get_u64(&self, key: &str, default: u64) -> Result<u64, ConfigError> {
        match self.get_opt(key) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw.to_string(),
            }),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
