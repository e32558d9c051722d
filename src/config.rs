//! Configuration system using TOML files.
//!
//! Config is stored in the OS-standard config directory:
//! - Windows: %APPDATA%\ringplay\config.toml
//! - macOS: ~/Library/Application Support/ringplay/config.toml
//! - Linux: ~/.config/ringplay/config.toml
//!
//! Every buffering threshold is a policy value rather than a derived
//! invariant, so they all live here. Whatever the values, growth should stay
//! fast and shrinking slow.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Output device and volume settings
    pub audio: AudioConfig,

    /// Ring buffer sizing and underrun policy
    pub buffer: BufferConfig,
}

/// Audio output settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Selected output device name (empty = system default)
    pub output_device: String,

    /// Last volume level (0.0 - 1.0)
    pub volume: f32,

    /// Step used by volume up/down
    pub volume_step: f32,

    /// Requested device block size in frames (0 = device default)
    pub block_size: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_device: String::new(),
            volume: 1.0,
            volume_step: 0.05,
            block_size: 0,
        }
    }
}

/// Ring buffer sizing and underrun/resize policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Active capacity a fresh buffer starts with
    pub default_secs: f32,
    /// Lower bound for the target capacity
    pub min_secs: f32,
    /// Upper bound for the target capacity; the backing array is allocated at this size
    pub max_secs: f32,
    /// Target growth per grow trigger
    pub grow_secs: f32,
    /// Target reduction per shrink trigger
    pub shrink_secs: f32,
    /// Underruns closer together than this count as consecutive
    pub underrun_window_ms: u64,
    /// Minimum time between two growth steps
    pub grow_cooldown_ms: u64,
    /// Underrun-free time required before shrinking
    pub stable_period_secs: u64,
    /// Playback time required before shrinking when no underrun ever happened
    pub warmup_secs: u64,
    /// Fill ratio above which the buffer counts as oversized
    pub high_fullness_ratio: f32,
    /// Fill ratio the first read waits for
    pub initial_fill_ratio: f32,
    /// Upper bound on the initial fill wait
    pub initial_fill_timeout_ms: u64,
    /// Frames requested from the decoder per fill iteration
    pub chunk_frames: usize,
    /// Interval between stability checks
    pub health_interval_secs: u64,
    /// Delay between incremental capacity steps
    pub resize_step_delay_ms: u64,
    /// Smallest capacity step, in milliseconds of audio
    pub min_resize_step_ms: u32,
    /// Pause after a seek before playback resumes
    pub seek_grace_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            default_secs: 4.0,
            min_secs: 2.0,
            max_secs: 20.0,
            grow_secs: 0.5,
            shrink_secs: 0.25,
            underrun_window_ms: 2_000,
            grow_cooldown_ms: 1_000,
            stable_period_secs: 60,
            warmup_secs: 10,
            high_fullness_ratio: 0.9,
            initial_fill_ratio: 0.75,
            initial_fill_timeout_ms: 2_000,
            chunk_frames: 4096,
            health_interval_secs: 5,
            resize_step_delay_ms: 20,
            min_resize_step_ms: 50,
            seek_grace_ms: 50,
        }
    }
}

impl BufferConfig {
    /// Check that the limits are consistent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.min_secs <= 0.0 {
            return invalid("buffer.min_secs must be positive");
        }
        if !(self.min_secs <= self.default_secs && self.default_secs <= self.max_secs) {
            return invalid("buffer sizes must satisfy min_secs <= default_secs <= max_secs");
        }
        if self.grow_secs <= 0.0 || self.shrink_secs <= 0.0 {
            return invalid("buffer.grow_secs and buffer.shrink_secs must be positive");
        }
        for (name, ratio) in [
            ("high_fullness_ratio", self.high_fullness_ratio),
            ("initial_fill_ratio", self.initial_fill_ratio),
        ] {
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ConfigError::Invalid(format!("buffer.{name} must be in (0, 1]")));
            }
        }
        if self.chunk_frames == 0 {
            return invalid("buffer.chunk_frames must be at least 1");
        }
        Ok(())
    }
}

// ============================================================================
// Config File Operations
// ============================================================================

/// Get the config directory path
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("ringplay"))
}

/// Get the full path to the config file
pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}

/// Load configuration from disk
///
/// Returns default config if file doesn't exist or can't be parsed.
/// Logs warnings but doesn't fail - we always return a usable config.
pub fn load() -> Config {
    let Some(path) = config_path() else {
        tracing::warn!("Could not determine config directory, using defaults");
        return Config::default();
    };

    if !path.exists() {
        tracing::info!("No config file found at {:?}, using defaults", path);
        return Config::default();
    }

    match load_from(&path) {
        Ok(config) => {
            tracing::info!("Loaded config from {:?}", path);
            config
        }
        Err(e) => {
            tracing::error!("{}", e);
            tracing::warn!("Using default configuration");
            Config::default()
        }
    }
}

/// Load and validate configuration from a specific file.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let contents =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
    let config: Config =
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
    config.buffer.validate()?;
    Ok(config)
}

/// Save configuration to a specific file, atomically.
pub fn save_to(config: &Config, path: &Path) -> Result<PathBuf, ConfigError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| ConfigError::CreateDir(dir.to_path_buf(), e))?;
    }

    let contents = toml::to_string_pretty(config).map_err(ConfigError::Serialize)?;

    // Write atomically (write to temp, then rename)
    let temp_path = path.with_extension("toml.tmp");
    std::fs::write(&temp_path, &contents).map_err(|e| ConfigError::Write(temp_path.clone(), e))?;
    std::fs::rename(&temp_path, path)
        .map_err(|e| ConfigError::Rename(temp_path, path.to_path_buf(), e))?;

    tracing::info!("Saved config to {:?}", path);
    Ok(path.to_path_buf())
}

// ============================================================================
// Error Types
// ============================================================================

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not determine config directory")]
    NoConfigDir,

    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to parse config file {0}: {1}")]
    Parse(PathBuf, toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Failed to create config directory {0}: {1}")]
    CreateDir(PathBuf, std::io::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),

    #[error("Failed to write config to {0}: {1}")]
    Write(PathBuf, std::io::Error),

    #[error("Failed to rename temp file {0} to {1}: {2}")]
    Rename(PathBuf, PathBuf, std::io::Error),
}

// ============================================================================
// Tests
// ============================================================================
