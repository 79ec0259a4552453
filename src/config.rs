//! Configuration System using Figment
//!
//! Configuration is layered, later sources overriding earlier ones:
//! 1. Built-in defaults (`FgenConfig::default()`)
//! 2. `config/fgen.toml` (or an explicit path)
//! 3. Environment variables prefixed with `RUST_FGEN_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use rust_fgen::config::FgenConfig;
//!
//! let config = FgenConfig::load()?;
//! println!("Instrument at {}:{}", config.connection.host, config.connection.port);
//! # Ok::<(), rust_fgen::error::FgenError>(())
//! ```

use crate::error::{AppResult, FgenError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/fgen.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FgenConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Where the instrument lives on the network
    pub connection: ConnectionConfig,
    /// Transport buffer sizing and error-queue limits
    pub buffers: BufferConfig,
    /// Mass-storage layout on the instrument
    pub storage: StorageConfig,
    /// Output amplitude safety limits
    pub safety: SafetyConfig,
    /// Waveform applied by `Session::reset`
    pub defaults: SineDefaults,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Console log format (pretty, compact, json)
    pub log_format: String,
    /// Append-only diagnostics log receiving connection status, identity and
    /// drained instrument errors
    pub diagnostics_file: Option<PathBuf>,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "Rust FGEN".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            diagnostics_file: None,
        }
    }
}

/// Raw-socket connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Hostname or IP address
    pub host: String,
    /// SCPI socket port
    pub port: u16,
    /// Read/write timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5025,
            timeout_ms: 5000,
        }
    }
}

/// Transport buffer sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Capacity the transport is restored to after every widened transfer
    pub default_bytes: usize,
    /// Input capacity used while reading mass-storage catalog listings
    pub catalog_bytes: usize,
    /// Upper bound on `SYST:ERR?` reads per drain
    pub max_error_reads: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            default_bytes: 512,
            catalog_bytes: 64 * 1024,
            max_error_reads: 64,
        }
    }
}

/// Instrument mass-storage layout
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Drive prefix, e.g. `INT:` or `USB:`
    pub drive: String,
    /// Default folder below the drive root (empty for the root)
    pub folder: String,
    /// Extension for stored arbitrary waveforms
    pub waveform_extension: String,
    /// Extension for stored instrument states
    pub state_extension: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            drive: "INT:".to_string(),
            folder: String::new(),
            waveform_extension: "arb".to_string(),
            state_extension: "sta".to_string(),
        }
    }
}

impl StorageConfig {
    /// Folder path on the instrument, e.g. `INT:\stim`.
    pub fn folder_path(&self, folder: &str) -> String {
        if folder.is_empty() {
            format!("{}\\", self.drive)
        } else {
            format!("{}\\{}", self.drive, folder)
        }
    }

    /// Full file path on the instrument, e.g. `INT:\stim\ramp.arb`.
    pub fn file_path(&self, folder: &str, name: &str, extension: &str) -> String {
        if folder.is_empty() {
            format!("{}\\{}.{}", self.drive, name, extension)
        } else {
            format!("{}\\{}\\{}.{}", self.drive, folder, name, extension)
        }
    }
}

/// Amplitude safety limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    /// Full-scale amplitude in volts
    pub full_scale_volts: f64,
    /// Fraction of full scale above which a change needs confirmation
    pub confirm_fraction: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            full_scale_volts: 1.0,
            confirm_fraction: 0.95,
        }
    }
}

impl SafetyConfig {
    /// Amplitude above which `Session::change_voltage` asks for confirmation.
    pub fn threshold_volts(&self) -> f64 {
        self.full_scale_volts * self.confirm_fraction
    }
}

/// Idle sine written by a reset
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SineDefaults {
    /// Frequency in Hz
    pub frequency_hz: f64,
    /// Amplitude in volts peak-to-peak
    pub amplitude_volts: f64,
    /// DC offset in volts
    pub offset_volts: f64,
}

impl Default for SineDefaults {
    fn default() -> Self {
        Self {
            frequency_hz: 1000.0,
            amplitude_volts: 0.1,
            offset_volts: 0.0,
        }
    }
}

impl FgenConfig {
    /// Load configuration from `config/fgen.toml` and environment variables
    ///
    /// Environment variables override file values with prefix `RUST_FGEN_`.
    /// Example: `RUST_FGEN_CONNECTION__HOST=192.168.1.20`
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(Self::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RUST_FGEN_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(FgenError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(FgenError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.buffers.default_bytes == 0 {
            return Err(FgenError::Configuration(
                "buffers.default_bytes must be non-zero".to_string(),
            ));
        }
        if self.buffers.catalog_bytes < self.buffers.default_bytes {
            return Err(FgenError::Configuration(format!(
                "buffers.catalog_bytes ({}) must be at least buffers.default_bytes ({})",
                self.buffers.catalog_bytes, self.buffers.default_bytes
            )));
        }
        if self.buffers.max_error_reads == 0 {
            return Err(FgenError::Configuration(
                "buffers.max_error_reads must be non-zero".to_string(),
            ));
        }

        if self.safety.full_scale_volts.is_nan() || self.safety.full_scale_volts <= 0.0 {
            return Err(FgenError::Configuration(format!(
                "safety.full_scale_volts must be positive, got {}",
                self.safety.full_scale_volts
            )));
        }
        if !(0.0..=1.0).contains(&self.safety.confirm_fraction) || self.safety.confirm_fraction == 0.0 {
            return Err(FgenError::Configuration(format!(
                "safety.confirm_fraction must be in (0, 1], got {}",
                self.safety.confirm_fraction
            )));
        }

        if self.storage.drive.is_empty() || !self.storage.drive.ends_with(':') {
            return Err(FgenError::Configuration(format!(
                "storage.drive must look like 'INT:', got '{}'",
                self.storage.drive
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = FgenConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.buffers.default_bytes, 512);
        assert!((config.safety.threshold_volts() - 0.95).abs() < 1e-12);
    }

    #[test]
    fn file_values_override_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[connection]
host = "10.0.0.7"

[buffers]
default_bytes = 1024
"#
        )
        .unwrap();

        let config = FgenConfig::load_from(file.path()).unwrap();
        assert_eq!(config.connection.host, "10.0.0.7");
        assert_eq!(config.connection.port, 5025);
        assert_eq!(config.buffers.default_bytes, 1024);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = FgenConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.storage.drive, "INT:");
    }

    #[test]
    fn rejects_invalid_log_level() {
        let mut config = FgenConfig::default();
        config.application.log_level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_catalog_buffer_below_default() {
        let mut config = FgenConfig::default();
        config.buffers.catalog_bytes = 16;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("catalog_bytes"));
    }

    #[test]
    fn storage_paths() {
        let storage = StorageConfig::default();
        assert_eq!(storage.folder_path(""), "INT:\\");
        assert_eq!(storage.folder_path("stim"), "INT:\\stim");
        assert_eq!(storage.file_path("stim", "ramp", "arb"), "INT:\\stim\\ramp.arb");
        assert_eq!(storage.file_path("", "setup", "sta"), "INT:\\setup.sta");
    }
}
