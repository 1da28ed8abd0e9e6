//! Streaming configuration
//!
//! Centralized settings for memory budgets, pressure thresholds, eviction
//! timing, the fast cache and the fetch pipeline. Configuration can be loaded
//! from a TOML file, environment variables, or created programmatically.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::memory_budget::PressureThresholds;

const MB: usize = 1024 * 1024;

/// Configuration for the texture streaming system
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// RAM budget for decoded texture data in megabytes
    pub ram_budget_mb: usize,
    /// VRAM budget for uploaded textures in megabytes
    pub vram_budget_mb: usize,
    /// Utilization at which increases become bounded
    pub allow_increase_threshold: f64,
    /// Utilization at which increases stop entirely
    pub drop_increase_threshold: f64,
    /// Bytes of increases admitted per frame while increases are bounded, in megabytes
    pub increase_allowance_mb: usize,
    /// Seconds an unreferenced, off-screen texture is kept before deletion
    pub retention_secs: u64,
    /// Seconds off-screen before a texture is dropped to its coarsest level
    pub offscreen_downgrade_secs: u64,
    /// Per-texture VRAM cap in megabytes; larger textures are scaled down
    pub max_texture_vram_mb: usize,
    /// Whether the on-disk fast cache is used
    pub fast_cache_enabled: bool,
    /// Fast cache disk limit in megabytes
    pub fast_cache_mb: usize,
    /// Fast cache directory
    pub fast_cache_dir: PathBuf,
    /// Fast cache entries loaded per frame
    pub max_fast_cache_reads: usize,
    /// Longest edge of images written back to the fast cache
    pub fast_cache_max_dimension: u32,
    /// Upper bound on fetches in flight
    pub max_concurrent_fetches: usize,
    /// Fetch worker threads
    pub fetch_workers: usize,
    /// Retries for transient fetch failures before giving up for now
    pub max_retries: u32,
    /// Base backoff between retries in milliseconds (doubles per attempt)
    pub retry_backoff_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ram_budget_mb: 512,
            vram_budget_mb: 512,
            allow_increase_threshold: 0.80,
            drop_increase_threshold: 0.95,
            increase_allowance_mb: 16,
            retention_secs: 30,
            offscreen_downgrade_secs: 5,
            max_texture_vram_mb: 32,
            fast_cache_enabled: true,
            fast_cache_mb: 256,
            fast_cache_dir: Self::default_fast_cache_dir(),
            max_fast_cache_reads: 8,
            fast_cache_max_dimension: 64,
            max_concurrent_fetches: 32,
            fetch_workers: 4,
            max_retries: 3,
            retry_backoff_ms: 250,
        }
    }
}

impl StreamingConfig {
    /// Sets the RAM budget in megabytes.
    pub fn with_ram_mb(mut self, mb: usize) -> Self {
        self.ram_budget_mb = mb;
        self
    }

    /// Sets the VRAM budget in megabytes.
    pub fn with_vram_mb(mut self, mb: usize) -> Self {
        self.vram_budget_mb = mb;
        self
    }

    /// Sets both pressure thresholds.
    pub fn with_thresholds(mut self, allow_increase: f64, drop_increase: f64) -> Self {
        self.allow_increase_threshold = allow_increase;
        self.drop_increase_threshold = drop_increase;
        self
    }

    /// Sets the retention window.
    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention_secs = retention.as_secs();
        self
    }

    /// Sets the off-screen downgrade delay.
    pub fn with_offscreen_downgrade(mut self, delay: Duration) -> Self {
        self.offscreen_downgrade_secs = delay.as_secs();
        self
    }

    /// Enables or disables the fast cache.
    pub fn with_fast_cache(mut self, enabled: bool) -> Self {
        self.fast_cache_enabled = enabled;
        self
    }

    /// Sets the fast cache directory.
    pub fn with_fast_cache_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.fast_cache_dir = path.as_ref().to_path_buf();
        self
    }

    /// Sets the number of fetch worker threads.
    pub fn with_fetch_workers(mut self, workers: usize) -> Self {
        self.fetch_workers = workers;
        self
    }

    /// Sets the maximum number of fetches in flight.
    pub fn with_max_concurrent_fetches(mut self, max: usize) -> Self {
        self.max_concurrent_fetches = max;
        self
    }

    /// Returns the default fast cache directory for the current platform.
    ///
    /// - macOS: ~/Library/Caches/texstream/fast
    /// - Linux: ~/.cache/texstream/fast
    /// - Windows: %LOCALAPPDATA%\texstream\fast
    pub fn default_fast_cache_dir() -> PathBuf {
        if let Some(cache_dir) = dirs::cache_dir() {
            cache_dir.join("texstream").join("fast")
        } else {
            PathBuf::from("cache/texstream")
        }
    }

    /// RAM budget in bytes
    pub fn ram_budget_bytes(&self) -> usize {
        self.ram_budget_mb * MB
    }

    /// VRAM budget in bytes
    pub fn vram_budget_bytes(&self) -> usize {
        self.vram_budget_mb * MB
    }

    /// Per-frame increase allowance in bytes
    pub fn increase_allowance_bytes(&self) -> usize {
        self.increase_allowance_mb * MB
    }

    /// Per-texture VRAM cap in bytes
    pub fn max_texture_vram_bytes(&self) -> usize {
        self.max_texture_vram_mb * MB
    }

    /// Fast cache disk limit in bytes
    pub fn fast_cache_bytes(&self) -> usize {
        self.fast_cache_mb * MB
    }

    /// Pressure thresholds
    pub fn thresholds(&self) -> PressureThresholds {
        PressureThresholds::new(self.allow_increase_threshold, self.drop_increase_threshold)
    }

    /// Retention window
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    /// Off-screen downgrade delay
    pub fn offscreen_downgrade(&self) -> Duration {
        Duration::from_secs(self.offscreen_downgrade_secs)
    }

    /// Base retry backoff
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Checks that values are usable together.
    ///
    /// # Errors
    /// Returns an error naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.allow_increase_threshold) {
            return Err(ConfigError::InvalidValue("allow_increase_threshold".to_string()));
        }
        if !unit.contains(&self.drop_increase_threshold)
            || self.drop_increase_threshold < self.allow_increase_threshold
        {
            return Err(ConfigError::InvalidValue("drop_increase_threshold".to_string()));
        }
        if self.fetch_workers == 0 {
            return Err(ConfigError::InvalidValue("fetch_workers".to_string()));
        }
        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::InvalidValue("max_concurrent_fetches".to_string()));
        }
        if self.fast_cache_enabled && self.max_fast_cache_reads == 0 {
            return Err(ConfigError::InvalidValue("max_fast_cache_reads".to_string()));
        }
        Ok(())
    }

    /// Loads configuration from environment variables.
    ///
    /// Environment variables:
    /// - `TEXSTREAM_RAM_MB`: RAM budget in MB (default: 512)
    /// - `TEXSTREAM_VRAM_MB`: VRAM budget in MB (default: 512)
    /// - `TEXSTREAM_FAST_CACHE`: `1`/`0`, `true`/`false` (default: enabled)
    /// - `TEXSTREAM_FAST_CACHE_MB`: fast cache disk limit in MB (default: 256)
    /// - `TEXSTREAM_FAST_CACHE_DIR`: fast cache directory path
    /// - `TEXSTREAM_FETCH_WORKERS`: fetch worker threads (default: 4)
    /// - `TEXSTREAM_MAX_FETCHES`: fetches in flight (default: 32)
    ///
    /// # Errors
    /// Returns an error if any environment variable contains an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("TEXSTREAM_RAM_MB")? {
            config.ram_budget_mb = v;
        }
        if let Some(v) = env_parse::<usize>("TEXSTREAM_VRAM_MB")? {
            config.vram_budget_mb = v;
        }
        if let Ok(val) = std::env::var("TEXSTREAM_FAST_CACHE") {
            config.fast_cache_enabled = match val.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "on" | "yes" => true,
                "0" | "false" | "off" | "no" => false,
                _ => return Err(ConfigError::InvalidValue("TEXSTREAM_FAST_CACHE".to_string())),
            };
        }
        if let Some(v) = env_parse::<usize>("TEXSTREAM_FAST_CACHE_MB")? {
            config.fast_cache_mb = v;
        }
        if let Ok(val) = std::env::var("TEXSTREAM_FAST_CACHE_DIR") {
            config.fast_cache_dir = PathBuf::from(val);
        }
        if let Some(v) = env_parse::<usize>("TEXSTREAM_FETCH_WORKERS")? {
            config.fetch_workers = v;
        }
        if let Some(v) = env_parse::<usize>("TEXSTREAM_MAX_FETCHES")? {
            config.max_concurrent_fetches = v;
        }

        Ok(config)
    }

    /// Loads configuration from a TOML file.
    ///
    /// Missing keys take their default values:
    /// ```toml
    /// vram_budget_mb = 1024
    /// retention_secs = 60
    /// fast_cache_dir = "/path/to/cache"
    /// ```
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&contents)
    }

    /// Parses configuration from a TOML string.
    pub fn from_toml_str(toml_str: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Converts configuration to TOML.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Saves configuration to a TOML file.
    ///
    /// # Errors
    /// Returns an error if the file cannot be written.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        fs::write(path.as_ref(), self.to_toml_string()?)?;
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue(key.to_string())),
        Err(_) => Ok(None),
    }
}

/// Errors that can occur during configuration operations.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Invalid value for a configuration parameter
    #[error("invalid value for configuration key: {0}")]
    InvalidValue(String),
    /// I/O error reading or writing configuration file
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// Malformed TOML
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// Configuration could not be rendered as TOML
    #[error("failed to serialize configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}
