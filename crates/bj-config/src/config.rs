//! Configuration structs with protocol defaults and RON persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use bj_net::{ReconnectConfig, TransportConfig};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

const CONFIG_FILE: &str = "config.ron";

/// Top-level client configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Server endpoint and transport loop settings.
    pub network: NetworkConfig,
    /// Acknowledgement, liveness and failure thresholds.
    pub session: SessionConfig,
    pub debug: DebugConfig,
}

/// Server endpoint and transport loop settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host name or address of the game server.
    pub server_address: String,
    pub server_port: u16,
    /// Upper bound on one readiness wait, in milliseconds.
    pub tick_interval_ms: u64,
    /// Bytes requested per socket read.
    pub read_buffer_size: usize,
    /// First delay before redialling after the link went offline.
    pub reconnect_check_ms: u64,
}

/// Session policy. Mirrors [`bj_net::SessionConfig`] in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    pub ack_timeout_ms: u64,
    pub max_retries: u32,
    pub liveness_window_ms: u64,
    pub max_reconnect_attempts: u32,
    pub max_invalid_messages: u32,
}

/// Debug/development configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DebugConfig {
    /// Log filter (e.g. "debug", "info,bj_net=trace").
    pub log_level: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            server_address: "127.0.0.1".to_string(),
            server_port: 10000,
            tick_interval_ms: 100,
            read_buffer_size: 512,
            reconnect_check_ms: 2000,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 5000,
            max_retries: 3,
            liveness_window_ms: 10_000,
            max_reconnect_attempts: 5,
            max_invalid_messages: 3,
        }
    }
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

// --- Conversions into runtime config ---

impl From<&NetworkConfig> for TransportConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            tick_interval: Duration::from_millis(network.tick_interval_ms),
            read_buffer_size: network.read_buffer_size,
            ..Default::default()
        }
    }
}

impl From<&NetworkConfig> for ReconnectConfig {
    fn from(network: &NetworkConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(network.reconnect_check_ms),
            ..Default::default()
        }
    }
}

impl From<&SessionConfig> for bj_net::SessionConfig {
    fn from(session: &SessionConfig) -> Self {
        Self {
            ack_timeout: Duration::from_millis(session.ack_timeout_ms),
            max_retries: session.max_retries,
            liveness_window: Duration::from_millis(session.liveness_window_ms),
            max_reconnect_attempts: session.max_reconnect_attempts,
            max_invalid_messages: session.max_invalid_messages,
        }
    }
}

/// Per-user config directory, `<config dir>/bj-client`.
pub fn default_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("bj-client"))
}

// --- Load / Save / Reload ---

impl Config {
    /// Load config from the given directory, or create a default config file.
    pub fn load_or_create(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            let config = Self::read(&config_path)?;
            log::info!("Loaded config from {}", config_path.display());
            Ok(config)
        } else {
            let config = Config::default();
            config.save(config_dir)?;
            log::info!("Created default config at {}", config_path.display());
            Ok(config)
        }
    }

    /// Save config to the given directory as `config.ron`.
    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir).map_err(ConfigError::WriteError)?;

        let pretty = ron::ser::PrettyConfig::new()
            .depth_limit(2)
            .enumerate_arrays(false);
        let serialized =
            ron::ser::to_string_pretty(self, pretty).map_err(ConfigError::SerializeError)?;

        std::fs::write(config_dir.join(CONFIG_FILE), serialized).map_err(ConfigError::WriteError)
    }

    /// Re-read the file; `Some` only when it differs from `self`.
    pub fn reload(&self, config_dir: &Path) -> Result<Option<Self>, ConfigError> {
        let new_config = Self::read(&config_dir.join(CONFIG_FILE))?;

        if &new_config != self {
            log::info!("Config reloaded with changes");
            Ok(Some(new_config))
        } else {
            Ok(None)
        }
    }

    /// Reject values the client cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |field, reason| Err(ConfigError::InvalidValue { field, reason });

        if self.network.server_address.trim().is_empty() {
            return invalid("network.server_address", "must not be empty");
        }
        if self.network.server_port == 0 {
            return invalid("network.server_port", "must be in 1..=65535");
        }
        if self.network.tick_interval_ms == 0 {
            return invalid("network.tick_interval_ms", "must be positive");
        }
        if self.network.read_buffer_size == 0 {
            return invalid("network.read_buffer_size", "must be positive");
        }
        if self.session.ack_timeout_ms == 0 {
            return invalid("session.ack_timeout_ms", "must be positive");
        }
        if self.session.liveness_window_ms <= self.network.tick_interval_ms {
            return invalid(
                "session.liveness_window_ms",
                "must be longer than network.tick_interval_ms",
            );
        }
        Ok(())
    }

    fn read(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = ron::from_str(&contents).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_protocol_policy() {
        let config = Config::default();
        let session = bj_net::SessionConfig::from(&config.session);
        assert_eq!(session, bj_net::SessionConfig::default());

        let transport = TransportConfig::from(&config.network);
        assert_eq!(transport.tick_interval, Duration::from_millis(100));
        assert_eq!(transport.read_buffer_size, 512);

        let reconnect = ReconnectConfig::from(&config.network);
        assert_eq!(reconnect.initial_delay, Duration::from_secs(2));
        assert_eq!(config.network.server_port, 10000);
    }

    #[test]
    fn test_default_config_serializes() {
        let ron_str = ron::ser::to_string_pretty(&Config::default(), Default::default()).unwrap();
        assert!(ron_str.contains("server_port: 10000"));
        assert!(ron_str.contains("liveness_window_ms: 10000"));
    }

    #[test]
    fn test_missing_section_uses_default() {
        let config: Config = ron::from_str("(network: (server_port: 4242))").unwrap();
        assert_eq!(config.network.server_port, 4242);
        assert_eq!(config.network.server_address, "127.0.0.1");
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_extra_field_ignored() {
        let result: Result<Config, _> = ron::from_str("(future_setting: true)");
        assert!(result.is_ok());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.network.server_address = "10.0.0.1".to_string();
        config.session.max_retries = 5;

        config.save(dir.path()).unwrap();
        let loaded = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, loaded);
    }

    #[test]
    fn test_load_creates_default_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_create(dir.path()).unwrap();
        assert_eq!(config, Config::default());
        assert!(dir.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_reload_detects_changes() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::default();
        config.save(dir.path()).unwrap();
        assert!(config.reload(dir.path()).unwrap().is_none());

        let mut modified = config.clone();
        modified.session.ack_timeout_ms = 1500;
        modified.save(dir.path()).unwrap();

        let reloaded = config.reload(dir.path()).unwrap().unwrap();
        assert_eq!(reloaded.session.ack_timeout_ms, 1500);
    }

    #[test]
    fn test_invalid_ron_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "{{not valid}}").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_unusable_values_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(CONFIG_FILE), "(network: (server_port: 0))").unwrap();
        assert!(matches!(
            Config::load_or_create(dir.path()),
            Err(ConfigError::InvalidValue {
                field: "network.server_port",
                ..
            })
        ));

        let mut config = Config::default();
        config.session.liveness_window_ms = 50;
        assert!(config.validate().is_err());
    }
}
