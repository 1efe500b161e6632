//! Engine settings and their persistence

use crate::player::state::RepressMode;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Smallest accepted per-channel buffer size in bytes.
pub const MIN_BUFFER_SIZE: usize = 1024;
/// Largest accepted per-channel buffer size in bytes.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Where decoded audio goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputBackend {
    /// Discards audio at real-time rate.
    #[default]
    Null,
    Alsa,
}

impl fmt::Display for OutputBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputBackend::Null => f.write_str("null"),
            OutputBackend::Alsa => f.write_str("alsa"),
        }
    }
}

impl FromStr for OutputBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "null" => Ok(OutputBackend::Null),
            "alsa" => Ok(OutputBackend::Alsa),
            other => Err(format!("unknown output backend '{}' (expected null or alsa)", other)),
        }
    }
}

/// Engine settings
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Output buffer size in bytes per channel
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// What pressing a playing sound does
    #[serde(default)]
    pub repress_mode: RepressMode,
    /// How long a play request may wait for its sound to become ready
    #[serde(default = "default_play_timeout_ms")]
    pub play_timeout_ms: u64,
    #[serde(default)]
    pub output_backend: OutputBackend,
    /// ALSA device to use when the ALSA backend is selected
    #[serde(default = "default_alsa_device")]
    pub alsa_device: String,
}

fn default_buffer_size() -> usize {
    44_100
}

fn default_play_timeout_ms() -> u64 {
    500
}

fn default_alsa_device() -> String {
    "default".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            buffer_size: default_buffer_size(),
            repress_mode: RepressMode::default(),
            play_timeout_ms: default_play_timeout_ms(),
            output_backend: OutputBackend::default(),
            alsa_device: default_alsa_device(),
        }
    }
}

/// Error types for configuration operations
#[derive(Debug)]
pub enum ConfigError {
    IoError(io::Error),
    ParseError(String),
    ValidationError(String),
}

impl From<io::Error> for ConfigError {
    fn from(err: io::Error) -> Self {
        ConfigError::IoError(err)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::ParseError(err.to_string())
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::IoError(e) => write!(f, "I/O error: {}", e),
            ConfigError::ParseError(s) => write!(f, "Parse error: {}", s),
            ConfigError::ValidationError(s) => write!(f, "Validation error: {}", s),
        }
    }
}

impl Error for ConfigError {}

impl Settings {
    /// Load settings from a file; a missing file yields the defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        Ok(settings)
    }

    /// Save settings to a file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(&self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, content)?;
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> PathBuf {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".config").join("soundboard-engine").join("config.json")
    }

    /// Validate settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(MIN_BUFFER_SIZE..=MAX_BUFFER_SIZE).contains(&self.buffer_size) {
            return Err(ConfigError::ValidationError(format!(
                "Buffer size {} is outside {}..={} bytes",
                self.buffer_size, MIN_BUFFER_SIZE, MAX_BUFFER_SIZE
            )));
        }

        if self.play_timeout_ms == 0 {
            return Err(ConfigError::ValidationError("Play timeout must be positive".to_string()));
        }

        if self.output_backend == OutputBackend::Alsa && self.alsa_device.trim().is_empty() {
            return Err(ConfigError::ValidationError("ALSA device cannot be empty".to_string()));
        }

        Ok(())
    }
}
