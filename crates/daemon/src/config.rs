//! Configuration management for the Boxwire daemon.
//!
//! This module provides TOML-based configuration file loading and saving.
//! The default configuration path is `~/.config/boxwire/config.toml`.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use protocol::Endpoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("auth_timeout_ms must be between 1 and 600000, got {0}")]
    InvalidAuthTimeout(u64),

    #[error("session_timeout_ms must be greater than 0, got {0}")]
    InvalidSessionTimeout(u64),

    #[error("stream_timeout_ms must be greater than 0, got {0}")]
    InvalidStreamTimeout(u64),

    #[error("max_read_size must be greater than 0, got {0}")]
    InvalidMaxReadSize(u64),

    #[error("listen must be host:port or unix:<path>, got {0}")]
    InvalidListenAddress(String),

    #[error("auth token must not map to an empty identity: {0}")]
    EmptyIdentity(String),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Valid log level values for tracing configuration.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Main configuration structure for the Boxwire daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// General daemon configuration.
    pub daemon: DaemonConfig,

    /// Listener configuration.
    pub network: NetworkConfig,

    /// Session and connection timing.
    pub session: SessionConfig,

    /// Credential table.
    pub auth: AuthConfig,
}

/// General daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory for daemon data; local sandboxes live under `boxes/`.
    pub data_dir: PathBuf,

    /// Logging level (trace, debug, info, warn, error).
    pub log_level: String,
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// `host:port` for TCP, or `unix:<path>` for a Unix domain socket.
    pub listen: String,
}

/// Session management configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Time a new connection has to authenticate.
    pub auth_timeout_ms: u64,

    /// Idle time after the last connection detaches before the session is
    /// destroyed.
    pub session_timeout_ms: u64,

    /// Grace period for output streams of an exited process.
    pub stream_timeout_ms: u64,

    /// Largest file `readFile` will return, in bytes.
    pub max_read_size: u64,
}

/// Authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct AuthConfig {
    /// Static token to identity table. Empty means every connection is its
    /// own identity.
    pub tokens: HashMap<String, String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8722".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_ms: 10_000,
            session_timeout_ms: 5 * 60 * 1000,
            stream_timeout_ms: 10_000,
            max_read_size: 5 * 1024 * 1024, // 5MB
        }
    }
}

impl NetworkConfig {
    /// Parsed listen address.
    pub fn endpoint(&self) -> Result<Endpoint, ConfigError> {
        self.listen
            .parse()
            .map_err(|_| ConfigError::InvalidListenAddress(self.listen.clone()))
    }
}

impl SessionConfig {
    /// Authentication deadline.
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Idle teardown delay.
    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    /// Output stream grace period after exit.
    pub fn stream_timeout(&self) -> Duration {
        Duration::from_millis(self.stream_timeout_ms)
    }
}

/// Returns the default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("boxwire")
        .join("config.toml")
}

/// Returns the default data directory path.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("boxwire")
}

impl Config {
    /// Apply environment variable overrides to the configuration.
    ///
    /// Environment variables take precedence over config file values.
    /// Supported variables:
    /// - BOXWIRE_LISTEN: Override the listen address
    /// - BOXWIRE_LOG_LEVEL: Override log level (trace, debug, info, warn, error)
    pub fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("BOXWIRE_LISTEN") {
            if !listen.is_empty() {
                tracing::info!("Overriding listen from environment: {}", listen);
                self.network.listen = listen;
            }
        }

        if let Ok(level) = std::env::var("BOXWIRE_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }
    }

    /// Validate the configuration values.
    ///
    /// Returns an error if any configuration value is outside the valid range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.auth_timeout_ms == 0 || session.auth_timeout_ms > 600_000 {
            return Err(ConfigError::InvalidAuthTimeout(session.auth_timeout_ms));
        }
        if session.session_timeout_ms == 0 {
            return Err(ConfigError::InvalidSessionTimeout(session.session_timeout_ms));
        }
        if session.stream_timeout_ms == 0 {
            return Err(ConfigError::InvalidStreamTimeout(session.stream_timeout_ms));
        }
        if session.max_read_size == 0 {
            return Err(ConfigError::InvalidMaxReadSize(session.max_read_size));
        }

        self.network.endpoint()?;

        if let Some((token, _)) = self
            .auth
            .tokens
            .iter()
            .find(|(_, identity)| identity.is_empty())
        {
            return Err(ConfigError::EmptyIdentity(token.clone()));
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
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

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.network.listen, "127.0.0.1:8722");
        assert_eq!(config.session.auth_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.session_timeout(), Duration::from_secs(300));
        assert_eq!(config.session.stream_timeout(), Duration::from_secs(10));
        assert_eq!(config.session.max_read_size, 5 * 1024 * 1024);
        assert!(config.auth.tokens.is_empty());
    }

    #[test]
    fn test_default_daemon_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(config.data_dir.to_string_lossy().contains("boxwire"));
    }

    #[test]
    fn test_from_toml_empty() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_from_toml_partial() {
        let toml = r#"
[daemon]
log_level = "debug"

[session]
stream_timeout_ms = 2500
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.session.stream_timeout_ms, 2500);
        // Other values should be defaults
        assert_eq!(config.session.auth_timeout_ms, 10_000);
        assert_eq!(config.network.listen, "127.0.0.1:8722");
    }

    #[test]
    fn test_from_toml_full() {
        let toml = r#"
[daemon]
data_dir = "/custom/data"
log_level = "trace"

[network]
listen = "unix:/run/boxwire.sock"

[session]
auth_timeout_ms = 2000
session_timeout_ms = 60000
stream_timeout_ms = 500
max_read_size = 1024

[auth.tokens]
secret-one = "alice"
secret-two = "bob"
"#;
        let config = Config::from_toml(toml).unwrap();

        assert_eq!(config.daemon.data_dir, PathBuf::from("/custom/data"));
        assert_eq!(config.daemon.log_level, "trace");
        assert_eq!(config.network.listen, "unix:/run/boxwire.sock");
        assert_eq!(config.session.auth_timeout_ms, 2000);
        assert_eq!(config.session.session_timeout_ms, 60000);
        assert_eq!(config.session.stream_timeout_ms, 500);
        assert_eq!(config.session.max_read_size, 1024);
        assert_eq!(config.auth.tokens.get("secret-one").map(String::as_str), Some("alice"));
        assert_eq!(config.auth.tokens.len(), 2);
    }

    #[test]
    fn test_from_toml_invalid_syntax() {
        let toml = r#"
[daemon
log_level = "debug"
"#;
        let result = Config::from_toml(toml);
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("Invalid TOML"));
    }

    #[test]
    fn test_from_toml_wrong_type() {
        let toml = r#"
[session]
auth_timeout_ms = "soon"
"#;
        assert!(Config::from_toml(toml).is_err());
    }

    #[test]
    fn test_roundtrip_custom() {
        let mut original = Config::default();
        original.daemon.log_level = "warn".to_string();
        original.network.listen = "0.0.0.0:9000".to_string();
        original
            .auth
            .tokens
            .insert("token".to_string(), "identity".to_string());

        let toml = original.to_toml().unwrap();
        let loaded = Config::from_toml(&toml).unwrap();
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

        let mut config = Config::default();
        config.session.max_read_size = 42;
        config.save(&config_path).unwrap();

        assert!(config_path.exists());
        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.session.max_read_size, 42);
    }

    #[test]
    fn test_load_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        fs::write(&config_path, "this is not [valid toml").unwrap();

        let result = Config::load(&config_path);
        assert!(result.is_err());
        let err = format!("{:#}", result.unwrap_err());
        assert!(err.contains("Failed to parse config file"));
    }

    #[test]
    fn test_default_config_path() {
        let path = default_config_path();
        assert!(path.to_string_lossy().contains("boxwire"));
        assert!(path.to_string_lossy().ends_with("config.toml"));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let toml = r#"
[daemon]
log_level = "info"
unknown_field = "ignored"

[unknown_section]
key = "value"
"#;
        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.daemon.log_level, "info");
    }

    #[test]
    #[serial]
    fn test_env_override_listen() {
        std::env::remove_var("BOXWIRE_LOG_LEVEL");
        std::env::set_var("BOXWIRE_LISTEN", "unix:/tmp/test.sock");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.network.listen, "unix:/tmp/test.sock");

        std::env::remove_var("BOXWIRE_LISTEN");
    }

    #[test]
    #[serial]
    fn test_env_override_empty_does_not_override() {
        std::env::set_var("BOXWIRE_LISTEN", "");
        std::env::set_var("BOXWIRE_LOG_LEVEL", "");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.network.listen, "127.0.0.1:8722");
        assert_eq!(config.daemon.log_level, "info");

        std::env::remove_var("BOXWIRE_LISTEN");
        std::env::remove_var("BOXWIRE_LOG_LEVEL");
    }

    #[test]
    #[serial]
    fn test_env_override_log_level() {
        std::env::remove_var("BOXWIRE_LISTEN");
        std::env::set_var("BOXWIRE_LOG_LEVEL", "debug");

        let mut config = Config::default();
        config.apply_env_overrides();

        assert_eq!(config.daemon.log_level, "debug");

        std::env::remove_var("BOXWIRE_LOG_LEVEL");
    }

    #[test]
    fn test_validate_default_config() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_validate_timeouts() {
        let mut config = Config::default();
        config.session.auth_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidAuthTimeout(0)));

        let mut config = Config::default();
        config.session.auth_timeout_ms = 600_001;
        assert_eq!(config.validate(), Err(ConfigError::InvalidAuthTimeout(600_001)));

        let mut config = Config::default();
        config.session.session_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidSessionTimeout(0)));

        let mut config = Config::default();
        config.session.stream_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidStreamTimeout(0)));
    }

    #[test]
    fn test_validate_max_read_size_zero() {
        let mut config = Config::default();
        config.session.max_read_size = 0;
        assert_eq!(config.validate(), Err(ConfigError::InvalidMaxReadSize(0)));
    }

    #[test]
    fn test_validate_listen_addresses() {
        let mut config = Config::default();
        for valid in ["127.0.0.1:1", "[::1]:8722", "localhost:80", "unix:/tmp/b.sock"] {
            config.network.listen = valid.to_string();
            assert!(config.validate().is_ok(), "{} should be valid", valid);
        }
        for invalid in ["", "8722", "host:", "host:99999", "unix:"] {
            config.network.listen = invalid.to_string();
            assert_eq!(
                config.validate(),
                Err(ConfigError::InvalidListenAddress(invalid.to_string()))
            );
        }
    }

    #[test]
    fn test_validate_empty_identity() {
        let mut config = Config::default();
        config.auth.tokens.insert("t".to_string(), String::new());
        assert_eq!(
            config.validate(),
            Err(ConfigError::EmptyIdentity("t".to_string()))
        );
    }

    #[test]
    fn test_validate_log_level() {
        let mut config = Config::default();
        config.daemon.log_level = "WARN".to_string();
        assert!(config.validate().is_ok());

        config.daemon.log_level = "verbose".to_string();
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidLogLevel("verbose".to_string()))
        );
    }
}
