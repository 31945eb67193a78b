//! CLI Exit Codes
//!
//! Standard exit codes for CLI operations and automation.

use crate::config::ConfigError;
use crate::core::error::BusError;
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

    /// Route or link failure
    pub const CONNECTION_FAILED: u8 = 3;

    /// Operation timeout
    pub const TIMEOUT: u8 = 4;

    /// Module refused or awaiting authorization
    pub const AUTH_FAILED: u8 = 5;

    /// File not found
    pub const FILE_NOT_FOUND: u8 = 6;

    /// Configuration error
    pub const CONFIG_ERROR: u8 = 8;

    /// Protocol error
    pub const PROTOCOL_ERROR: u8 = 9;

    /// Operation cancelled
    pub const CANCELLED: u8 = 11;

    /// Interface, route or protocol not found
    pub const DEVICE_NOT_FOUND: u8 = 12;

    /// Resource in use or exhausted
    pub const DEVICE_BUSY: u8 = 13;

    /// Malformed frame or message
    pub const VALIDATION_FAILED: u8 = 17;

    /// One or more modules failed to attach
    pub const ATTACH_FAILED: u8 = 18;

    /// Internal error
    pub const INTERNAL_ERROR: u8 = 127;

    /// Exit code for a bus failure
    pub fn for_bus_error(err: &BusError) -> u8 {
        match err {
            BusError::InvalidMessage(_) => Self::VALIDATION_FAILED,
            BusError::Unsupported(_) | BusError::Remote(_) => Self::PROTOCOL_ERROR,
            BusError::NotFound(_) => Self::DEVICE_NOT_FOUND,
            BusError::AlreadyExists(_) | BusError::InUse(_) | BusError::ResourceExhausted(_) => {
                Self::DEVICE_BUSY
            }
            BusError::Timeout(_) => Self::TIMEOUT,
            BusError::Canceled => Self::CANCELLED,
            BusError::NotConnected | BusError::Transport(_) => Self::CONNECTION_FAILED,
            BusError::InvalidState(_) => Self::ERROR,
        }
    }

    /// Exit code for any error surfaced by the CLI
    pub fn for_error(err: &anyhow::Error) -> u8 {
        if let Some(bus) = err.downcast_ref::<BusError>() {
            return Self::for_bus_error(bus);
        }
        if let Some(config) = err.downcast_ref::<ConfigError>() {
            return match config {
                ConfigError::Io(io) if io.kind() == std::io::ErrorKind::NotFound => Self::FILE_NOT_FOUND,
                _ => Self::CONFIG_ERROR,
            };
        }
        if err.downcast_ref::<hex::FromHexError>().is_some() {
            return Self::INVALID_ARGS;
        }
        Self::ERROR
    }
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

    /// Success with a message
    pub fn success_with_message(msg: impl Into<String>) -> Self {
        Self::Success(Some(msg.into()))
    }

    /// Failure with an explicit code
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
            Self::Success(Some(msg)) => Some(msg),
            Self::Error(_, msg) => Some(msg),
            _ => None,
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

impl From<anyhow::Error> for CliResult {
    fn from(err: anyhow::Error) -> Self {
        Self::Error(ExitCodes::for_error(&err), format!("{:#}", err))
    }
}

/// Exit code description
pub fn exit_code_description(code: u8) -> &'static str {
    match code {
        0 => "Success",
        1 => "General error",
        2 => "Invalid arguments",
        3 => "Connection failed",
        4 => "Operation timeout",
        5 => "Authorization failed",
        6 => "File not found",
        8 => "Configuration error",
        9 => "Protocol error",
        11 => "Operation cancelled",
        12 => "Device not found",
        13 => "Device busy",
        17 => "Validation failed",
        18 => "Attach failed",
        127 => "Internal error",
        _ => "Unknown error",
    }
}

/// Print exit code table
pub fn print_exit_codes() {
    println!("Exit Codes:");
    for code in [0, 1, 2, 3, 4, 5, 6, 8, 9, 11, 12, 13, 17, 18, 127] {
        println!("  {:>3}  {}", code, exit_code_description(code));
    }
}
