//! Configuration module
//!
//! Handles broker, device and logging settings

mod settings;

pub use settings::{BridgeConfig, BrokerSettings, DeviceSettings, LoggingSettings};

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// I/O error
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Malformed config file
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be serialized
    #[error("Could not serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Trust material missing or unusable
    #[error("Trust material error: {0}")]
    TrustMaterial(String),
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "serialbridge", "SerialNatsBridge")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Default config file location
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Initialize application directories
pub fn init_directories() -> std::io::Result<()> {
    for dir in [config_dir(), data_dir(), log_dir()].into_iter().flatten() {
        std::fs::create_dir_all(&dir)?;
    }
    Ok(())
}
