//! CLI Exit Codes
//!
//! Exit codes for scripted use, one per error kind of the bridge.

use crate::config::ConfigError;
use crate::core::broker::BrokerError;
use crate::core::device::DeviceError;
use std::process::ExitCode;

/// Exit code constants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitCodes;

impl ExitCodes {
    /// Success
    pub const SUCCESS: u8 = 0;

    /// General error
    pub const ERROR: u8 = 1;

    /// Invalid arguments
    pub const INVALID_ARGS: u8 = 2;

    /// Broker connection failed
    pub const BROKER_CONNECT_FAILED: u8 = 3;

    /// Broker not connected
    pub const BROKER_NOT_CONNECTED: u8 = 4;

    /// Trust material unusable
    pub const CERTIFICATE_ERROR: u8 = 5;

    /// Device permission denied
    pub const PERMISSION_DENIED: u8 = 7;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// User cancelled
    pub const CANCELLED: u8 = 11;

    /// Device not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Device port not open
    pub const CONNECTION_CLOSED: u8 = 13;

    /// Hardware failure
    pub const HARDWARE_ERROR: u8 = 14;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;
}

/// CLI operation result
#[derive(Debug)]
pub enum CliResult {
    /// Success with optional message
    Success(Option<String>),

    /// Error with code and message
    Error(u8, String),
}

impl CliResult {
    /// Plain success
    pub fn success() -> Self {
        Self::Success(None)
    }

    /// Success with a message for the user
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Error with an explicit code
    pub fn error(code: u8, msg: impl Into<String>) -> Self {
        Self::Error(code, msg.into())
    }

    /// Get exit code
    pub fn code(&self) -> u8 {
        match self {
            Self::Success(_) => ExitCodes::SUCCESS,
            Self::Error(code, _) => *code,
        }
    }

    /// Get message
    pub fn message(&self) -> Option<&str> {
        match self {
            Self::Success(Some(msg)) | Self::Error(_, msg) => Some(msg),
            Self::Success(None) => None,
        }
    }

    /// Convert to ExitCode
    pub fn to_exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    /// Is success?
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }
}

impl From<&DeviceError> for CliResult {
    fn from(err: &DeviceError) -> Self {
        let code = match err {
            DeviceError::NotFound(_) => ExitCodes::DEVICE_NOT_FOUND,
            DeviceError::PermissionDenied(_) => ExitCodes::PERMISSION_DENIED,
            DeviceError::ConnectionClosed(_) => ExitCodes::CONNECTION_CLOSED,
            DeviceError::Hardware { .. } | DeviceError::Enumeration(_) => ExitCodes::HARDWARE_ERROR,
            DeviceError::Worker(_) => ExitCodes::INTERNAL_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<&BrokerError> for CliResult {
    fn from(err: &BrokerError) -> Self {
        let code = match err {
            BrokerError::NotConnected(_) | BrokerError::Publish(_) => ExitCodes::BROKER_NOT_CONNECTED,
            BrokerError::ConnectFailed(_) | BrokerError::Subscribe(_) => {
                ExitCodes::BROKER_CONNECT_FAILED
            }
            BrokerError::Certificate(_) => ExitCodes::CERTIFICATE_ERROR,
        };
        Self::Error(code, err.to_string())
    }
}

impl From<&ConfigError> for CliResult {
    fn from(err: &ConfigError) -> Self {
        Self::Error(ExitCodes::CONFIG_ERROR, err.to_string())
    }
}

impl From<anyhow::Error> for CliResult {
    fn from(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<DeviceError>() {
            return e.into();
        }
        if let Some(e) = err.downcast_ref::<BrokerError>() {
            return e.into();
        }
        if let Some(e) = err.downcast_ref::<ConfigError>() {
            return e.into();
        }
        Self::Error(ExitCodes::ERROR, format!("{err:#}"))
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Broker connection failed",
        4 => "Broker not connected",
        5 => "Certificate error",
        7 => "Device permission denied",
        8 => "Configuration error",
        11 => "Operation cancelled",
        12 => "Device not found",
        13 => "Device connection closed",
        14 => "Hardware error",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 5, 7, 8, 11, 12, 13, 14, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
