//! Bus settings

use crate::core::id_pool::{DEVICE_ID_FIRST, DEVICE_ID_INVALID};
use crate::core::protocol::svc::DEFAULT_ENDO_ID;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// File could not be read or written
    #[error("Config I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// File is not valid TOML for this schema
    #[error("Config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Config could not be serialized
    #[error("Config serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Values are inconsistent
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Module bus configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Deadline for connection operations, in ms
    pub operation_timeout_ms: u64,
    /// Deadline for SVC operations, in ms
    pub svc_timeout_ms: u64,
    /// Cports per interface
    pub cport_count: u16,
    /// Maximum interfaces attached at once
    pub max_interfaces: usize,
    /// First device id handed to modules
    pub device_id_first: u8,
    /// Last device id handed to modules
    pub device_id_last: u8,
    /// Control cport on every interface
    pub control_cport: u16,
    /// Host cport for the SVC link; defaults to the last cport
    pub host_svc_cport: Option<u16>,
    /// Endo id announced by the SVC
    pub endo_id: u16,
    /// Hold back "module available" until authorized
    pub require_authorization: bool,
    /// Logging
    pub logging: LoggingConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            operation_timeout_ms: 1000,
            svc_timeout_ms: 5000,
            cport_count: 32,
            max_interfaces: 6,
            device_id_first: DEVICE_ID_FIRST,
            device_id_last: DEVICE_ID_INVALID - 1,
            control_cport: 2,
            host_svc_cport: None,
            endo_id: DEFAULT_ENDO_ID,
            require_authorization: false,
            logging: LoggingConfig::default(),
        }
    }
}

impl BusConfig {
    /// Default config file location
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        Ok(super::config_dir().ok_or(ConfigError::NoConfigDir)?.join("config.toml"))
    }

    /// Load config from the default location, or defaults if absent
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load and validate config from a file
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<PathBuf, ConfigError> {
        let path = Self::default_path()?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        self.save_to(&path)?;
        Ok(path)
    }

    /// Save config to a file
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        self.validate()?;
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    /// Render as TOML
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Check the values are consistent
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.operation_timeout_ms == 0 || self.svc_timeout_ms == 0 {
            return Err(ConfigError::Invalid("timeouts must be non-zero".into()));
        }
        if self.cport_count < 2 {
            return Err(ConfigError::Invalid(format!(
                "cport_count {} leaves no room for control and svc cports",
                self.cport_count
            )));
        }
        if self.max_interfaces == 0 {
            return Err(ConfigError::Invalid("max_interfaces must be at least 1".into()));
        }
        if self.device_id_first < DEVICE_ID_FIRST
            || self.device_id_last >= DEVICE_ID_INVALID
            || self.device_id_first > self.device_id_last
        {
            return Err(ConfigError::Invalid(format!(
                "device id range {}..={} must lie within {}..={}",
                self.device_id_first,
                self.device_id_last,
                DEVICE_ID_FIRST,
                DEVICE_ID_INVALID - 1
            )));
        }
        if self.control_cport >= self.cport_count {
            return Err(ConfigError::Invalid(format!(
                "control cport {} out of range (cport_count {})",
                self.control_cport, self.cport_count
            )));
        }
        if self.host_svc_cport() >= self.cport_count {
            return Err(ConfigError::Invalid(format!(
                "host svc cport {} out of range (cport_count {})",
                self.host_svc_cport(),
                self.cport_count
            )));
        }
        Ok(())
    }

    /// Connection operation deadline
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    /// SVC operation deadline
    pub fn svc_timeout(&self) -> Duration {
        Duration::from_millis(self.svc_timeout_ms)
    }

    /// Host cport bound to the SVC protocol
    pub fn host_svc_cport(&self) -> u16 {
        self.host_svc_cport
            .unwrap_or_else(|| self.cport_count.saturating_sub(1))
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,
    /// Emit JSON lines
    pub json: bool,
    /// Also write to this file
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: None,
        }
    }
}
