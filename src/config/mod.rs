//! Configuration types and loading
//!
//! The configuration file is YAML with three sections: `log` (level,
//! format, outputs, rotation), an optional `allowlist` seed, and an
//! optional `bridge` block enabling the proxy path. Everything has a
//! default, so running without a file is valid.

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::ConfigError;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Logger configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Hosts seeded into the allowlist at startup
    #[serde(default)]
    pub allowlist: Vec<String>,

    /// Bridge transport settings; absent means no proxy path
    #[serde(default)]
    pub bridge: Option<BridgeConfig>,
}

impl AppConfig {
    /// Validate field values
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first
    /// offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        if let Some(bridge) = &self.bridge {
            bridge.validate()?;
        }
        Ok(())
    }
}

/// Logger configuration (`log` section)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    /// Minimum level: debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: json or console
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Output targets: `stdout`, `stderr`, or a file path
    #[serde(default = "default_log_output")]
    pub output: Vec<String>,

    /// File rotation settings (file outputs only)
    #[serde(default)]
    pub rotation: RotationConfig,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            output: default_log_output(),
            rotation: RotationConfig::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> String {
    "console".to_owned()
}

fn default_log_output() -> Vec<String> {
    vec!["stdout".to_owned()]
}

impl LogConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.level.as_str(), "debug" | "info" | "warn" | "error") {
            return Err(ConfigError::validation(format!(
                "log.level must be one of debug/info/warn/error, got {:?}",
                self.level
            )));
        }
        if !matches!(self.format.as_str(), "json" | "console") {
            return Err(ConfigError::validation(format!(
                "log.format must be json or console, got {:?}",
                self.format
            )));
        }
        if self.output.is_empty() {
            return Err(ConfigError::validation("log.output must not be empty"));
        }
        Ok(())
    }
}

/// Log file rotation settings (`log.rotation` section)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RotationConfig {
    /// Rotate once the active file exceeds this many megabytes
    #[serde(default = "default_max_size", rename = "maxSize")]
    pub max_size: u64,

    /// Rotated files to keep
    #[serde(default = "default_max_backups", rename = "maxBackups")]
    pub max_backups: u32,

    /// Rotated files older than this many days are pruned
    #[serde(default = "default_max_age", rename = "maxAge")]
    pub max_age: u32,

    /// Accepted for compatibility; compression is not performed
    #[serde(default)]
    pub compress: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            max_backups: default_max_backups(),
            max_age: default_max_age(),
            compress: false,
        }
    }
}

fn default_max_size() -> u64 {
    100
}

fn default_max_backups() -> u32 {
    7
}

fn default_max_age() -> u32 {
    30
}

/// Bridge transport settings (`bridge` section)
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// `ws://` or `wss://` endpoint of the remote peer
    pub url: String,

    /// Identifier for this proxy instance; a UUID is minted when omitted
    #[serde(default, rename = "clientId")]
    pub client_id: Option<String>,

    /// Remote server class selector carried in every frame
    #[serde(default, rename = "serverType")]
    pub server_type: u8,

    /// Extra headers sent on every WebSocket dial (auth tokens etc.)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl BridgeConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if !self.url.starts_with("ws://") && !self.url.starts_with("wss://") {
            return Err(ConfigError::validation(format!(
                "bridge.url must start with ws:// or wss://, got {:?}",
                self.url
            )));
        }
        Ok(())
    }
}

/// Load configuration from a YAML file
///
/// # Errors
///
/// Returns `ConfigError` if the file is missing, unreadable, unparsable,
/// or fails validation.
pub fn load_config(path: impl AsRef<Path>) -> Result<AppConfig, ConfigError> {
    let path = path.as_ref();
    debug!("loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config = load_config_str(&contents)
        .map_err(|e| match e {
            ConfigError::ParseError(msg) => {
                ConfigError::ParseError(format!("{msg} at {path:?}"))
            }
            other => other,
        })?;

    info!(
        allowlist = config.allowlist.len(),
        bridge = config.bridge.is_some(),
        level = %config.log.level,
        "configuration loaded"
    );
    Ok(config)
}

/// Load configuration from a YAML string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(yaml: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig =
        serde_yaml::from_str(yaml).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    Ok(config)
}
