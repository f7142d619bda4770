//! Configuration for the acquisition engine.

use loadcell_common::LoggingConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::decoder::DecodeMode;
use crate::session::ResetPolicy;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] loadcell_common::Error),
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaqConfig {
    /// Serial link settings
    pub serial: SerialConfig,

    /// Polling settings
    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    /// Per-connection session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Spreadsheet export settings
    #[serde(default)]
    pub export: ExportConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Modbus RTU serial link configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0" or "COM3")
    pub port: String,
    /// Baud rate (default: 9600)
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Data bits (default: 8)
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    /// Parity: "none", "even", or "odd" (default: "none")
    #[serde(default = "default_parity")]
    pub parity: String,
    /// Stop bits: 1 or 2 (default: 1)
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    /// Per-transaction timeout in milliseconds (default: 5000)
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_data_bits() -> u8 {
    8
}

fn default_parity() -> String {
    "none".to_string()
}

fn default_stop_bits() -> u8 {
    1
}

fn default_timeout_ms() -> u64 {
    5000
}

impl SerialConfig {
    /// Serial settings for `port` with every other field at its default.
    pub fn with_port(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            parity: default_parity(),
            stop_bits: default_stop_bits(),
            timeout_ms: default_timeout_ms(),
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Polling loop configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Modbus slave ID (1-247)
    #[serde(default = "default_slave_id")]
    pub slave_id: u8,

    /// First holding register to read (0-based)
    #[serde(default)]
    pub start_address: u16,

    /// Number of holding registers per transaction
    #[serde(default = "default_register_count")]
    pub register_count: u16,

    /// Pacing delay between polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Retries of a failed transaction before the run is aborted
    #[serde(default)]
    pub retries: u32,

    /// How the two measurement registers are combined
    #[serde(default)]
    pub decode_mode: DecodeMode,
}

fn default_slave_id() -> u8 {
    1
}

fn default_register_count() -> u16 {
    4
}

fn default_poll_interval_ms() -> u64 {
    200
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            slave_id: default_slave_id(),
            start_address: 0,
            register_count: default_register_count(),
            poll_interval_ms: default_poll_interval_ms(),
            retries: 0,
            decode_mode: DecodeMode::default(),
        }
    }
}

impl AcquisitionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Session configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Initial reference load used to derive the friction ratio
    #[serde(default = "default_reference_load")]
    pub reference_load: f64,

    /// What a restarted run clears
    #[serde(default)]
    pub reset_policy: ResetPolicy,
}

fn default_reference_load() -> f64 {
    1.0
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reference_load: default_reference_load(),
            reset_policy: ResetPolicy::default(),
        }
    }
}

/// Export configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportConfig {
    /// Directory receiving exported tables
    #[serde(default = "default_export_directory")]
    pub directory: PathBuf,

    /// File name prefix, followed by a timestamp
    #[serde(default = "default_file_prefix")]
    pub file_prefix: String,
}

fn default_export_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_file_prefix() -> String {
    "friction_test".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            directory: default_export_directory(),
            file_prefix: default_file_prefix(),
        }
    }
}

impl DaqConfig {
    /// Configuration for `port` with every other section at its default.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self {
            serial: SerialConfig::with_port(port),
            acquisition: AcquisitionConfig::default(),
            session: SessionConfig::default(),
            export: ExportConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Load configuration from a JSON5 file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: DaqConfig = loadcell_common::load_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.serial.port.is_empty() {
            return Err(ConfigError::Validation(
                "Serial port cannot be empty".to_string(),
            ));
        }

        match self.serial.parity.to_lowercase().as_str() {
            "none" | "even" | "odd" => {}
            other => {
                return Err(ConfigError::Validation(format!(
                    "Invalid parity '{}' (use none, even, or odd)",
                    other
                )));
            }
        }

        if !matches!(self.serial.stop_bits, 1 | 2) {
            return Err(ConfigError::Validation(format!(
                "Invalid stop_bits {} (use 1 or 2)",
                self.serial.stop_bits
            )));
        }

        if !(5..=8).contains(&self.serial.data_bits) {
            return Err(ConfigError::Validation(format!(
                "Invalid data_bits {} (use 5-8)",
                self.serial.data_bits
            )));
        }

        if self.serial.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "timeout_ms must be greater than 0".to_string(),
            ));
        }

        if !(1..=247).contains(&self.acquisition.slave_id) {
            return Err(ConfigError::Validation(format!(
                "slave_id must be 1-247, got {}",
                self.acquisition.slave_id
            )));
        }

        if self.acquisition.register_count < 2 {
            return Err(ConfigError::Validation(format!(
                "register_count must be at least 2, got {}",
                self.acquisition.register_count
            )));
        }

        let load = self.session.reference_load;
        if !load.is_finite() || load == 0.0 {
            return Err(ConfigError::Validation(format!(
                "reference_load must be a finite non-zero number, got {}",
                load
            )));
        }

        if self.export.file_prefix.is_empty() {
            return Err(ConfigError::Validation(
                "export file_prefix cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}
