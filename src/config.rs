//! Configuration management for the data engine
//!
//! This module provides configuration file support with TOML format,
//! environment variable overrides, and sensible defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Cache store configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Memory budget for decoded buffers
    #[serde(default)]
    pub memory: MemoryConfig,

    /// Aggregation settings
    #[serde(default)]
    pub processing: ProcessingConfig,

    /// Streaming pipeline settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Cache store configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Root directory of the bucket files
    #[serde(default = "default_cache_dir")]
    pub directory: PathBuf,

    /// Use the cache for derived representations
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// How long a delete is retried before a clear fails (milliseconds)
    #[serde(default = "default_clear_timeout_ms")]
    pub clear_timeout_ms: u64,

    /// Delay between delete retries (milliseconds)
    #[serde(default = "default_clear_poll_interval_ms")]
    pub clear_poll_interval_ms: u64,
}

/// Memory allocator configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MemoryConfig {
    /// Total bytes of decoded buffers in flight across all requests
    #[serde(default = "default_total_buffer_memory")]
    pub total_buffer_memory: usize,

    /// Remaining budget is divided by this factor before granting
    #[serde(default = "default_fairness_factor")]
    pub fairness_factor: usize,

    /// Parked callers re-evaluate the budget after this long (milliseconds)
    #[serde(default = "default_wait_timeout_ms")]
    pub wait_timeout_ms: u64,

    /// Give up waiting after this long (milliseconds, 0 = wait forever)
    #[serde(default)]
    pub max_wait_ms: u64,
}

/// Aggregation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessingConfig {
    /// Minimum fraction of valid samples for a block to produce a value
    #[serde(default = "default_nan_threshold")]
    pub nan_threshold: f64,
}

/// Streaming pipeline configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PipelineConfig {
    /// Capacity of each per-item pipe in bytes
    #[serde(default = "default_pipe_capacity")]
    pub pipe_capacity: usize,

    /// Maximum samples per item handed to a writer in one call
    #[serde(default = "default_write_buffer_samples")]
    pub write_buffer_samples: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level or filter directive (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

// Default value functions
fn default_cache_dir() -> PathBuf { PathBuf::from("cache") }
fn default_clear_timeout_ms() -> u64 { 60_000 }
fn default_clear_poll_interval_ms() -> u64 { 1_000 }
fn default_total_buffer_memory() -> usize { 1024 * 1024 * 1024 }
fn default_fairness_factor() -> usize { 8 }
fn default_wait_timeout_ms() -> u64 { 60_000 }
fn default_nan_threshold() -> f64 { 0.99 }
fn default_pipe_capacity() -> usize { 64 * 1024 }
fn default_write_buffer_samples() -> usize { 16 * 1024 }
fn default_log_level() -> String { "info".to_string() }
fn default_true() -> bool { true }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            directory: default_cache_dir(),
            enabled: true,
            clear_timeout_ms: default_clear_timeout_ms(),
            clear_poll_interval_ms: default_clear_poll_interval_ms(),
        }
    }
}

impl CacheConfig {
    /// Delete retry window
    pub fn clear_timeout(&self) -> Duration {
        Duration::from_millis(self.clear_timeout_ms)
    }

    /// Delete retry interval
    pub fn clear_poll_interval(&self) -> Duration {
        Duration::from_millis(self.clear_poll_interval_ms)
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            total_buffer_memory: default_total_buffer_memory(),
            fairness_factor: default_fairness_factor(),
            wait_timeout_ms: default_wait_timeout_ms(),
            max_wait_ms: 0,
        }
    }
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            nan_threshold: default_nan_threshold(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: default_pipe_capacity(),
            write_buffer_samples: default_write_buffer_samples(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from TOML file
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path, e))?;

        toml::from_str(&contents)
            .map_err(|e| format!("Failed to parse config file {}: {}", path, e))
    }

    /// Load configuration with environment variable overrides
    pub fn from_file_with_env(path: &str) -> Result<Self, String> {
        let mut config = Self::from_file(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from environment variables only
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        // Cache
        if let Ok(dir) = std::env::var("NEXUS_CACHE_DIR") {
            self.cache.directory = PathBuf::from(dir);
        }

        // Memory
        if let Ok(total) = std::env::var("NEXUS_TOTAL_BUFFER_MEMORY") {
            if let Ok(t) = total.parse() {
                self.memory.total_buffer_memory = t;
            }
        }
        if let Ok(factor) = std::env::var("NEXUS_FAIRNESS_FACTOR") {
            if let Ok(f) = factor.parse() {
                self.memory.fairness_factor = f;
            }
        }

        // Processing
        if let Ok(threshold) = std::env::var("NEXUS_NAN_THRESHOLD") {
            if let Ok(t) = threshold.parse() {
                self.processing.nan_threshold = t;
            }
        }

        // Logging
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.logging.level = level;
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.directory.as_os_str().is_empty() {
            return Err("Cache directory cannot be empty".to_string());
        }
        if self.cache.clear_poll_interval_ms == 0 {
            return Err("Cache clear poll interval must be > 0".to_string());
        }

        if self.memory.total_buffer_memory == 0 {
            return Err("Total buffer memory must be > 0".to_string());
        }
        if self.memory.fairness_factor == 0 {
            return Err("Fairness factor must be >= 1".to_string());
        }
        if self.memory.wait_timeout_ms == 0 {
            return Err("Allocator wait timeout must be > 0".to_string());
        }

        let threshold = self.processing.nan_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(format!("NaN threshold must be within [0, 1], got {}", threshold));
        }

        if self.pipeline.pipe_capacity < 8 {
            return Err("Pipe capacity must hold at least one sample (8 bytes)".to_string());
        }
        if self.pipeline.write_buffer_samples == 0 {
            return Err("Write buffer samples must be > 0".to_string());
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn save_to_file(&self, path: &str) -> Result<(), String> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        std::fs::write(path, contents)
            .map_err(|e| format!("Failed to write config file {}: {}", path, e))
    }
}
