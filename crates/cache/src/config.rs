//! Cache configuration for budgets, admission and pacing.
//!
//! Configuration can be loaded from a TOML file, environment variables,
//! or created programmatically.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::memory_budget::Units;

/// Default number of concurrent network transfers.
pub const DEFAULT_MAX_LOADERS: usize = 6;

/// Default number of retries after a transport error or timeout.
pub const DEFAULT_RETRY: u32 = 3;

/// Default transport timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

/// Configuration for the image cache.
///
/// Budgets are expressed in `units`; use [`CacheConfig::ram_budget_bytes`]
/// and [`CacheConfig::video_budget_bytes`] for raw byte values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// RAM budget (compressed payloads plus decoded rasters)
    pub ram_budget: u64,
    /// Video memory budget (GPU-resident rasters)
    pub video_budget: u64,
    /// Unit both budgets are expressed in
    pub units: Units,
    /// Maximum number of transfers in flight
    pub max_loaders: usize,
    /// Device capability in `[0, 1]`; 1 is the fastest device
    pub hw_rank: f64,
    /// Share one full-resolution GPU copy across all sizes of an image
    pub gpu_data_full: bool,
    /// Retries after a transport error or timeout before giving up
    pub retry: u32,
    /// Transport timeout in milliseconds
    pub timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ram_budget: 256,
            video_budget: 512,
            units: Units::Mb,
            max_loaders: DEFAULT_MAX_LOADERS,
            hw_rank: 0.5,
            gpu_data_full: false,
            retry: DEFAULT_RETRY,
            timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with both budgets in the given unit.
    pub fn new(ram_budget: u64, video_budget: u64, units: Units) -> Self {
        Self {
            ram_budget,
            video_budget,
            units,
            ..Self::default()
        }
    }

    /// Sets the RAM budget (in `units`).
    pub fn with_ram_budget(mut self, size: u64) -> Self {
        self.ram_budget = size;
        self
    }

    /// Sets the video budget (in `units`).
    pub fn with_video_budget(mut self, size: u64) -> Self {
        self.video_budget = size;
        self
    }

    /// Sets the budget unit.
    pub fn with_units(mut self, units: Units) -> Self {
        self.units = units;
        self
    }

    /// Sets the maximum number of concurrent transfers.
    pub fn with_max_loaders(mut self, max_loaders: usize) -> Self {
        self.max_loaders = max_loaders;
        self
    }

    /// Sets the device capability factor, clamped to `[0, 1]`.
    pub fn with_hw_rank(mut self, hw_rank: f64) -> Self {
        self.hw_rank = hw_rank.clamp(0.0, 1.0);
        self
    }

    /// Enables or disables shared full-resolution GPU accounting.
    pub fn with_gpu_data_full(mut self, enabled: bool) -> Self {
        self.gpu_data_full = enabled;
        self
    }

    /// Sets the transport retry budget.
    pub fn with_retry(mut self, retry: u32) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the transport timeout in milliseconds.
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    /// Returns the RAM budget in bytes.
    pub fn ram_budget_bytes(&self) -> u64 {
        self.units.to_bytes(self.ram_budget)
    }

    /// Returns the video budget in bytes.
    pub fn video_budget_bytes(&self) -> u64 {
        self.units.to_bytes(self.video_budget)
    }

    /// Checks that every value is within its accepted range.
    ///
    /// # Errors
    /// Returns [`ConfigError::OutOfRange`] for the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_loaders == 0 {
            return Err(ConfigError::OutOfRange {
                key: "max_loaders".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.hw_rank) {
            return Err(ConfigError::OutOfRange {
                key: "hw_rank".to_string(),
                reason: format!("{} is not within [0, 1]", self.hw_rank),
            });
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `IMAGEKEEP_RAM_BUDGET`: RAM budget in `units` (default: 256)
    /// - `IMAGEKEEP_VIDEO_BUDGET`: video budget in `units` (default: 512)
    /// - `IMAGEKEEP_UNITS`: one of BYTE, KB, MB, GB, TB (default: MB)
    /// - `IMAGEKEEP_MAX_LOADERS`: concurrent transfers (default: 6)
    /// - `IMAGEKEEP_HW_RANK`: device capability in [0, 1] (default: 0.5)
    /// - `IMAGEKEEP_GPU_DATA_FULL`: `true` or `false` (default: false)
    /// - `IMAGEKEEP_RETRY`: transport retries (default: 3)
    /// - `IMAGEKEEP_TIMEOUT_MS`: transport timeout (default: 30000)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = env_value("IMAGEKEEP_RAM_BUDGET")? {
            config.ram_budget = value;
        }
        if let Some(value) = env_value("IMAGEKEEP_VIDEO_BUDGET")? {
            config.video_budget = value;
        }
        if let Some(value) = env_value("IMAGEKEEP_UNITS")? {
            config.units = value;
        }
        if let Some(value) = env_value("IMAGEKEEP_MAX_LOADERS")? {
            config.max_loaders = value;
        }
        if let Some(value) = env_value("IMAGEKEEP_HW_RANK")? {
            config.hw_rank = value;
        }
        if let Some(value) = env_value("IMAGEKEEP_GPU_DATA_FULL")? {
            config.gpu_data_full = value;
        }
        if let Some(value) = env_value("IMAGEKEEP_RETRY")? {
            config.retry = value;
        }
        if let Some(value) = env_value("IMAGEKEEP_TIMEOUT_MS")? {
            config.timeout_ms = value;
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Expected file format (every key optional):
    /// ```toml
    /// ram_budget = 256
    /// video_budget = 512
    /// units = "MB"
    /// max_loaders = 6
    /// hw_rank = 0.5
    /// gpu_data_full = false
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, parsed or validated.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    /// Converts configuration to TOML format.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string(self)?)
    }
}

fn env_value<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A value could not be parsed
    #[error("invalid value {value:?} for configuration key {key}")]
    InvalidValue { key: String, value: String },
    /// A value parsed but is outside its accepted range
    #[error("configuration key {key} out of range: {reason}")]
    OutOfRange { key: String, reason: String },
    /// I/O error reading or writing a configuration file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Malformed TOML
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    /// Configuration could not be serialized
    #[error("serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ENV_KEYS: [&str; 8] = [
        "IMAGEKEEP_RAM_BUDGET",
        "IMAGEKEEP_VIDEO_BUDGET",
        "IMAGEKEEP_UNITS",
        "IMAGEKEEP_MAX_LOADERS",
        "IMAGEKEEP_HW_RANK",
        "IMAGEKEEP_GPU_DATA_FULL",
        "IMAGEKEEP_RETRY",
        "IMAGEKEEP_TIMEOUT_MS",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            env::remove_var(key);
        }
    }

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.ram_budget_bytes(), 256 * 1024 * 1024);
        assert_eq!(config.video_budget_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.max_loaders, 6);
        assert_eq!(config.retry, 3);
        assert!(!config.gpu_data_full);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_methods() {
        let config = CacheConfig::new(1_000_000, 2_000_000, Units::Byte)
            .with_max_loaders(2)
            .with_hw_rank(1.7)
            .with_gpu_data_full(true)
            .with_retry(1)
            .with_timeout_ms(500);

        assert_eq!(config.ram_budget_bytes(), 1_000_000);
        assert_eq!(config.video_budget_bytes(), 2_000_000);
        assert_eq!(config.max_loaders, 2);
        assert_eq!(config.hw_rank, 1.0);
        assert!(config.gpu_data_full);
        assert_eq!(config.retry, 1);
        assert_eq!(config.timeout_ms, 500);
    }

    #[test]
    fn test_validate_rejects_zero_loaders() {
        let config = CacheConfig::default().with_max_loaders(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::OutOfRange { key, .. }) if key == "max_loaders"
        ));
    }

    #[test]
    fn test_validate_rejects_hw_rank_out_of_range() {
        let config = CacheConfig {
            hw_rank: -0.1,
            ..CacheConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_toml_partial() {
        let config = CacheConfig::from_toml(
            r#"
            # budgets in kilobytes
            ram_budget = 64
            units = "KB"
            gpu_data_full = true
            "#,
        )
        .unwrap();

        assert_eq!(config.ram_budget_bytes(), 64 * 1024);
        assert_eq!(config.video_budget_bytes(), 512 * 1024);
        assert!(config.gpu_data_full);
        assert_eq!(config.max_loaders, DEFAULT_MAX_LOADERS);
    }

    #[test]
    fn test_from_toml_invalid() {
        assert!(matches!(
            CacheConfig::from_toml("units = \"PB\""),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            CacheConfig::from_toml("hw_rank = 3.0"),
            Err(ConfigError::OutOfRange { .. })
        ));
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("imagekeep.toml");

        let config = CacheConfig::new(10, 20, Units::Gb)
            .with_max_loaders(3)
            .with_hw_rank(0.25);
        config.save_to_file(&path).unwrap();

        let loaded = CacheConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_missing_file() {
        let result = CacheConfig::from_file("/nonexistent/imagekeep.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        env::set_var("IMAGEKEEP_RAM_BUDGET", "128");
        env::set_var("IMAGEKEEP_UNITS", "kb");
        env::set_var("IMAGEKEEP_MAX_LOADERS", "4");
        env::set_var("IMAGEKEEP_GPU_DATA_FULL", "true");

        let config = CacheConfig::from_env().unwrap();
        assert_eq!(config.ram_budget_bytes(), 128 * 1024);
        assert_eq!(config.units, Units::Kb);
        assert_eq!(config.max_loaders, 4);
        assert!(config.gpu_data_full);

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_invalid_value() {
        clear_env();
        env::set_var("IMAGEKEEP_HW_RANK", "fast");

        let result = CacheConfig::from_env();
        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { key, .. }) if key == "IMAGEKEEP_HW_RANK"
        ));

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        assert_eq!(CacheConfig::from_env().unwrap(), CacheConfig::default());
    }
}
