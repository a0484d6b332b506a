//! Configuration loading and validation.
//!
//! Settings live in a TOML file under the platform config directory and
//! every field has a sensible default, so a missing file is not an error.
//! Geometry-level validation (ring vs. gap sizing) happens when the
//! buffer is constructed; this module rejects values that are wrong on
//! their face.

use crate::timebase::FrameClock;
use chrono::TimeDelta;
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to find config directory")]
    NoConfigDir,

    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    SerializeError(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Geometry override for tests and dry runs.
///
/// Production uses `None` and derives the ring geometry from the
/// configured durations; tests pin exact frame counts so scenarios are
/// reproducible at any frame rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Simulating {
    #[default]
    None,
    /// Explicit frame counts for the retained-data and gap regions.
    Frames { n_data: usize, n_gap: usize },
    /// Durations overriding the configured ones.
    Durations { audio: TimeDelta, gap: TimeDelta },
}

/// Construction inputs for the history ring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Target retained history in seconds.
    pub buffer_duration_secs: f64,
    /// Minimum grace period for readers in seconds.
    pub gap_duration_secs: f64,
    /// Bytes per sample; the ring stores `f32`, so this must be 4.
    pub sample_size_bytes: usize,
    pub channel_count: usize,
    /// Frames (samples per channel) per second.
    pub frame_rate: u32,
    #[serde(skip)]
    pub simulating: Simulating,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_duration_secs: 60.0,
            gap_duration_secs: 2.0,
            sample_size_bytes: std::mem::size_of::<f32>(),
            channel_count: 2,
            frame_rate: 48_000,
            simulating: Simulating::None,
        }
    }
}

impl BufferConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_duration_secs <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "buffer_duration_secs must be positive, got {}",
                self.buffer_duration_secs
            )));
        }
        if self.gap_duration_secs <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "gap_duration_secs must be positive, got {}",
                self.gap_duration_secs
            )));
        }
        if self.sample_size_bytes != std::mem::size_of::<f32>() {
            return Err(ConfigError::ValidationError(format!(
                "sample_size_bytes must be {} (f32 samples), got {}",
                std::mem::size_of::<f32>(),
                self.sample_size_bytes
            )));
        }
        if self.channel_count == 0 {
            return Err(ConfigError::ValidationError(
                "channel_count must be at least 1".to_string(),
            ));
        }
        if self.frame_rate == 0 {
            return Err(ConfigError::ValidationError(
                "frame_rate must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn frame_clock(&self) -> FrameClock {
        FrameClock::new(self.frame_rate)
    }

    /// Resolve the retained-data and gap sizes in frames, honoring any
    /// simulation override.
    pub fn data_and_gap_frames(&self) -> Result<(usize, usize), ConfigError> {
        let clock = self.frame_clock();
        let (n_data, n_gap) = match self.simulating {
            Simulating::None => (
                (self.buffer_duration_secs * f64::from(self.frame_rate)).round() as usize,
                (self.gap_duration_secs * f64::from(self.frame_rate)).round() as usize,
            ),
            Simulating::Frames { n_data, n_gap } => (n_data, n_gap),
            Simulating::Durations { audio, gap } => (
                clock.n_frames_of(audio).max(0) as usize,
                clock.n_frames_of(gap).max(0) as usize,
            ),
        };
        if n_data == 0 || n_gap == 0 {
            return Err(ConfigError::ValidationError(format!(
                "ring geometry must be non-empty, got {n_data} data frames and {n_gap} gap frames"
            )));
        }
        Ok((n_data, n_gap))
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Input device name; `None` selects the system default.
    pub device: Option<String>,

    pub buffer: BufferConfig,
}

impl Config {
    /// Path of the config file under the platform config directory.
    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let dirs =
            ProjectDirs::from("io", "sondeworks", "audiosonde").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("config.toml"))
    }

    /// Load the config file, falling back to defaults when it is missing.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        config.buffer.validate()?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        Ok(())
    }
}
