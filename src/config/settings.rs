//! Bridge settings

use super::ConfigError;
use crate::core::broker::{NatsOptions, ReconnectPolicy, Subjects};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Broker connection
    pub broker: BrokerSettings,
    /// Serial device handling
    pub device: DeviceSettings,
    /// Logging
    pub logging: LoggingSettings,
}

impl BridgeConfig {
    /// Load config from the default location; a missing file yields defaults
    pub fn load() -> Result<Self, ConfigError> {
        let path = super::config_file().ok_or(ConfigError::NoConfigDir)?;
        Self::load_from(&path)
    }

    /// Load config from `path`; a missing file yields defaults
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Save config to `path`, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Broker settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    /// Server URL
    pub url: String,
    /// User name
    pub username: String,
    /// Password
    pub password: String,
    /// PEM file holding the CA certificate(s) to trust
    pub ca_cert_path: Option<PathBuf>,
    /// Subject device payloads are published to
    pub publish_subject: String,
    /// Subject whose messages are received
    pub subscribe_subject: String,
    /// Timeout of one connection attempt, in seconds
    pub connection_timeout_secs: u64,
    /// Server reconnect attempts
    pub max_reconnects: usize,
    /// Refuse plaintext connections
    pub require_tls: bool,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        let subjects = Subjects::default();
        let policy = ReconnectPolicy::default();
        Self {
            url: "tls://localhost:4222".to_string(),
            username: String::new(),
            password: String::new(),
            ca_cert_path: None,
            publish_subject: subjects.publish,
            subscribe_subject: subjects.subscribe,
            connection_timeout_secs: policy.connection_timeout.as_secs(),
            max_reconnects: policy.max_reconnects,
            require_tls: true,
        }
    }
}

impl BrokerSettings {
    /// Fixed subjects of the bridge
    pub fn subjects(&self) -> Subjects {
        Subjects {
            publish: self.publish_subject.clone(),
            subscribe: self.subscribe_subject.clone(),
        }
    }

    /// Transport options
    pub fn nats_options(&self) -> NatsOptions {
        NatsOptions {
            url: self.url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            policy: ReconnectPolicy {
                max_reconnects: self.max_reconnects,
                connection_timeout: Duration::from_secs(self.connection_timeout_secs),
            },
            require_tls: self.require_tls,
        }
    }

    /// Read the CA PEM once; empty when no path is configured
    pub fn load_trust_material(&self) -> Result<Vec<u8>, ConfigError> {
        match &self.ca_cert_path {
            Some(path) => std::fs::read(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            }),
            None if self.require_tls => Err(ConfigError::TrustMaterial(
                "broker.ca_cert_path is required when broker.require_tls is set".to_string(),
            )),
            None => Ok(Vec::new()),
        }
    }
}

/// Serial device settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Baud rate ports are opened with
    pub baud_rate: u32,
    /// Read/write timeout in milliseconds
    pub io_timeout_ms: u64,
    /// Largest single read
    pub read_buffer_size: usize,
    /// Delay between pump iterations in milliseconds
    pub poll_interval_ms: u64,
    /// Write inbound broker payloads to the device
    pub forward_inbound: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            io_timeout_ms: 2000,
            read_buffer_size: 8192,
            poll_interval_ms: 250,
            forward_inbound: false,
        }
    }
}

impl DeviceSettings {
    /// I/O timeout
    pub fn io_timeout(&self) -> Duration {
        Duration::from_millis(self.io_timeout_ms)
    }

    /// Pump interval
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Directory for daily-rolling log files
    pub directory: Option<PathBuf>,
    /// Emit JSON lines
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: None,
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig::load_from(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, BridgeConfig::default());
        assert_eq!(config.device.baud_rate, 115_200);
        assert_eq!(config.broker.max_reconnects, 5);
        assert_eq!(config.broker.connection_timeout_secs, 600);
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let mut config = BridgeConfig::default();
        config.broker.url = "tls://broker.example.com:4222".to_string();
        config.device.forward_inbound = true;

        config.save_to(&path).unwrap();
        assert_eq!(BridgeConfig::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[device]\nbaud_rate = 9600\n").unwrap();

        let config = BridgeConfig::load_from(&path).unwrap();
        assert_eq!(config.device.baud_rate, 9600);
        assert_eq!(config.device.io_timeout(), Duration::from_millis(2000));
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_trust_material() {
        let dir = TempDir::new().unwrap();
        let mut broker = BrokerSettings::default();
        assert!(matches!(
            broker.load_trust_material(),
            Err(ConfigError::TrustMaterial(_))
        ));

        let pem = dir.path().join("ca.pem");
        std::fs::write(&pem, b"-----BEGIN CERTIFICATE-----\n").unwrap();
        broker.ca_cert_path = Some(pem);
        assert!(!broker.load_trust_material().unwrap().is_empty());

        broker.ca_cert_path = None;
        broker.require_tls = false;
        assert!(broker.load_trust_material().unwrap().is_empty());
    }

    #[test]
    fn test_options_mapping() {
        let mut broker = BrokerSettings::default();
        broker.connection_timeout_secs = 30;
        let options = broker.nats_options();
        assert_eq!(options.policy.connection_timeout, Duration::from_secs(30));
        assert_eq!(broker.subjects(), Subjects::default());
    }
}
