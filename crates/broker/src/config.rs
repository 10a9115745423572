//! Configuration management for the portal broker.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/portal-broker/config.toml`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transfer::manager::DEFAULT_MAX_KEY_ATTEMPTS;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("max_key_attempts must be between 1 and 64, got {0}")]
    InvalidMaxKeyAttempts(u32),

    #[error("{0} must not be empty")]
    EmptyCommand(&'static str),

    #[error("mount_point must be an absolute path, got {0}")]
    InvalidMountPoint(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the portal broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General broker configuration.
    pub broker: BrokerConfig,

    /// Permission store configuration.
    pub permissions: PermissionsConfig,

    /// Document store configuration.
    pub documents: DocumentsConfig,

    /// Commands used to reach the desktop.
    pub backend: BackendConfig,

    /// File transfer configuration.
    pub transfer: TransferConfig,
}

/// General broker configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BrokerConfig {
    /// Directory for broker state.
    pub data_dir: PathBuf,

    /// Bus socket path. Defaults to the runtime directory location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Permission store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct PermissionsConfig {
    /// Store file. Defaults to `permissions.json` in the data directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_path: Option<PathBuf>,
}

/// Document store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DocumentsConfig {
    /// Where exported documents appear to sandboxed applications.
    pub mount_point: PathBuf,
}

/// External commands driving dialogs, notifications and action activation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Question dialog program (zenity compatible).
    pub dialog_command: String,

    /// Notification program (notify-send compatible).
    pub notify_command: String,

    /// Action activation program (gapplication compatible).
    pub action_command: String,
}

/// File transfer configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TransferConfig {
    /// Attempts at drawing an unused transfer key before giving up.
    pub max_key_attempts: u32,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            socket_path: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            mount_point: dirs::runtime_dir()
                .unwrap_or_else(std::env::temp_dir)
                .join("doc"),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            dialog_command: "zenity".to_string(),
            notify_command: "notify-send".to_string(),
            action_command: "gapplication".to_string(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_key_attempts: DEFAULT_MAX_KEY_ATTEMPTS,
        }
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("portal-broker")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("portal-broker")
}

impl Config {
    /// Bus socket path, falling back to [`crate::bus::get_socket_path`].
    pub fn socket_path(&self) -> PathBuf {
        self.broker
            .socket_path
            .clone()
            .unwrap_or_else(crate::bus::get_socket_path)
    }

    /// Permission store file.
    pub fn permission_store_path(&self) -> PathBuf {
        self.permissions
            .store_path
            .clone()
            .unwrap_or_else(|| self.broker.data_dir.join("permissions.json"))
    }

    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - PORTAL_BROKER_SOCKET: Override the bus socket path
    /// - PORTAL_BROKER_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(socket) = std::env::var("PORTAL_BROKER_SOCKET") {
            if !socket.is_empty() {
                tracing::info!("Overriding socket_path from environment: {}", socket);
                self.broker.socket_path = Some(PathBuf::from(socket));
            }
        }

        if let Ok(level) = std::env::var("PORTAL_BROKER_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.broker.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let attempts = self.transfer.max_key_attempts;
        if !(1..=64).contains(&attempts) {
            return Err(ConfigError::InvalidMaxKeyAttempts(attempts));
        }

        for (name, command) in [
            ("dialog_command", &self.backend.dialog_command),
            ("notify_command", &self.backend.notify_command),
            ("action_command", &self.backend.action_command),
        ] {
            if command.trim().is_empty() {
                return Err(ConfigError::EmptyCommand(name));
            }
        }

        if !self.documents.mount_point.is_absolute() {
            return Err(ConfigError::InvalidMountPoint(
                self.documents.mount_point.display().to_string(),
            ));
        }

        let level = self.broker.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.broker.log_level.clone()));
        }

        Ok(())
    }

    /// Load configuration from a file.
    ///
    /// If the file does not exist, returns the default configuration.
    /// If the file exists but is invalid TOML, returns an error with
    /// a helpful message.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Save configuration to a file.
    ///
    /// Creates parent directories if they don't exist.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    /// Serialize configuration to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

/// Format a TOML deserialization error for user-friendly display.
fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.broker.log_level, "info");
        assert!(config.broker.socket_path.is_none());
        assert!(config.permissions.store_path.is_none());
        assert_eq!(config.backend.dialog_command, "zenity");
        assert_eq!(config.backend.notify_command, "notify-send");
        assert_eq!(config.backend.action_command, "gapplication");
        assert_eq!(config.transfer.max_key_attempts, 16);
        assert!(config.documents.mount_point.ends_with("doc"));
    }

    #[test]
    fn test_default_data_dir() {
        let config = BrokerConfig::default();
        assert!(config.data_dir.to_string_lossy().contains("portal-broker"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[broker]
log_level = "debug"

[transfer]
max_key_attempts = 4
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.broker.log_level, "debug");
        assert_eq!(config.transfer.max_key_attempts, 4);
        assert_eq!(config.backend, BackendConfig::default());
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[broker]
data_dir = "/custom/data"
socket_path = "/run/custom/bus.sock"
log_level = "trace"

[permissions]
store_path = "/custom/perms.json"

[documents]
mount_point = "/run/user/1000/doc"

[backend]
dialog_command = "kdialog-wrapper"
notify_command = "my-notify"
action_command = "my-activate"

[transfer]
max_key_attempts = 32
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.broker.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.socket_path(), PathBuf::from("/run/custom/bus.sock"));
        assert_eq!(config.broker.log_level, "trace");
        assert_eq!(config.permission_store_path(), PathBuf::from("/custom/perms.json"));
        assert_eq!(config.documents.mount_point, PathBuf::from("/run/user/1000/doc"));
        assert_eq!(config.backend.dialog_command, "kdialog-wrapper");
        assert_eq!(config.backend.notify_command, "my-notify");
        assert_eq!(config.backend.action_command, "my-activate");
        assert_eq!(config.transfer.max_key_attempts, 32);
    }

    #[test]
    fn test_permission_store_path_defaults_to_data_dir() {
        let mut config = Config::default();
        config.broker.data_dir = PathBuf::from("/var/lib/broker");
        assert_eq!(
            config.permission_store_path(),
            PathBuf::from("/var/lib/broker/permissions.json")
        );
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[broker
log_level = "debug"
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[transfer]
max_key_attempts = "many"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_to_toml() {
        let toml = Config::default().to_toml().unwrap();

        assert!(toml.contains("[broker]"));
        assert!(toml.contains("[documents]"));
        assert!(toml.contains("[backend]"));
        assert!(toml.contains("[transfer]"));
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.broker.log_level = "warn".to_string();
        original.broker.socket_path = Some(PathBuf::from("/tmp/x.sock"));
        original.permissions.store_path = Some(PathBuf::from("/tmp/p.json"));
        original.transfer.max_key_attempts = 3;

        let loaded = Config::from_toml(&original.to_toml().unwrap()).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_missing_file() {
        let config = Config::load("/nonexistent/path/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.toml");

        let mut original = Config::default();
        original.broker.log_level = "debug".to_string();
        original.save(&config_path).unwrap();

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "invalid [ toml").unwrap();

        let err = Config::load(&config_path).unwrap_err().to_string();
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("portal-broker"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    #[serial]
    fn test_env_override_socket() {
        std::env::set_var("PORTAL_BROKER_SOCKET", "/tmp/override.sock");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/override.sock"));

        std::env::remove_var("PORTAL_BROKER_SOCKET");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("PORTAL_BROKER_SOCKET", "");
        std::env::set_var("PORTAL_BROKER_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert!(config.broker.socket_path.is_none());
        assert_eq!(config.broker.log_level, "info");

        std::env::remove_var("PORTAL_BROKER_SOCKET");
        std::env::remove_var("PORTAL_BROKER_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::set_var("PORTAL_BROKER_LOG_LEVEL", "trace");

        let mut config = Config::default();
        config.apply_env_overrides();
        assert_eq!(config.broker.log_level, "trace");

        std::env::remove_var("PORTAL_BROKER_LOG_LEVEL");
    }

    #[test]
    fn test_validate_default_config() {
        assert_eq!(Config::default().validate(), Ok(()));
    }

    #[test]
    fn test_validate_max_key_attempts() {
        let mut config = Config::default();
        config.transfer.max_key_attempts = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxKeyAttempts(0)));

        config.transfer.max_key_attempts = 65;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxKeyAttempts(65)));

        config.transfer.max_key_attempts = 64;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_empty_command() {
        let mut config = Config::default();
        config.backend.notify_command = "  ".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyCommand("notify_command"))
        );
    }

    #[test]
    fn test_validate_relative_mount_point() {
        let mut config = Config::default();
        config.documents.mount_point = PathBuf::from("doc");
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidMountPoint(_))
        ));
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.broker.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.broker.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
