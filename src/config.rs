// Configuration management for asrec

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};

use crate::output::filename::DEFAULT_FILENAME_FORMAT;

/// Error type for loading and saving configuration files
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Recorder configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordConfig {
    /// Directory recordings are written to
    #[serde(default = "default_directory")]
    pub directory: PathBuf,

    /// Filename template (see [`crate::output::filename`])
    #[serde(default = "default_filename_format")]
    pub filename_format: String,

    /// File extension without the leading dot
    #[serde(default = "default_extension")]
    pub extension: String,

    /// Replace every frame timestamp with the host clock instead of trusting
    /// the source. Applies from the next frame, no restart needed.
    #[serde(default)]
    pub overwrite_timestamp: bool,

    /// Target video bitrate in kbps
    #[serde(default = "default_video_bitrate")]
    pub video_bitrate_kbps: u32,

    /// Target audio bitrate in kbps
    #[serde(default = "default_audio_bitrate")]
    pub audio_bitrate_kbps: u32,

    /// Number of host audio mixes bound to the recording
    #[serde(default = "default_audio_mixers")]
    pub audio_mixers: u32,

    /// Frames the backend may keep queued for the video stream
    #[serde(default = "default_cache_size")]
    pub cache_size: usize,

    /// Backend-specific key/value overrides, applied last
    #[serde(default)]
    pub output_settings: Map<String, Value>,
}

impl Default for RecordConfig {
    fn default() -> Self {
        Self {
            directory: default_directory(),
            filename_format: default_filename_format(),
            extension: default_extension(),
            overwrite_timestamp: false,
            video_bitrate_kbps: default_video_bitrate(),
            audio_bitrate_kbps: default_audio_bitrate(),
            audio_mixers: default_audio_mixers(),
            cache_size: default_cache_size(),
            output_settings: Map::new(),
        }
    }
}

impl RecordConfig {
    /// Load config from `path` or return default
    pub fn load_or_default(path: &Path) -> Self {
        if path.exists() {
            match Self::load(path) {
                Ok(config) => return config,
                Err(e) => {
                    log::warn!("Failed to load config {:?}: {}", path, e);
                }
            }
        }

        Self::default()
    }

    /// Load config from `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Save config to `path`
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self).map_err(ConfigError::from)?;
        std::fs::write(path, contents)?;

        Ok(())
    }

    /// Whether `other` writes to a different destination. Only these fields
    /// force a running recording to restart.
    pub fn destination_differs(&self, other: &RecordConfig) -> bool {
        self.directory != other.directory
            || self.filename_format != other.filename_format
            || self.extension != other.extension
    }
}

/// Get the default directory for recordings
fn default_directory() -> PathBuf {
    dirs::video_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Videos")))
        .unwrap_or_else(|| PathBuf::from("."))
}

fn default_filename_format() -> String {
    DEFAULT_FILENAME_FORMAT.to_string()
}

fn default_extension() -> String {
    "mkv".to_string()
}

fn default_video_bitrate() -> u32 {
    2500
}

fn default_audio_bitrate() -> u32 {
    320
}

fn default_audio_mixers() -> u32 {
    1
}

fn default_cache_size() -> usize {
    16
}
