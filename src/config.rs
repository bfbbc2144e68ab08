use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::core::hash::{DEFAULT_DHASH_SIZE, MAX_DHASH_SIZE};

#[derive(Error, Debug, PartialEq)]
pub enum ConfigError {
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    pub storage_root: PathBuf,
    pub batch_threshold: usize,
    pub dhash_size: u32,
    pub dhash_max_distance: u32,
    pub temp_dir: Option<PathBuf>,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("."),
            batch_threshold: 10,
            dhash_size: DEFAULT_DHASH_SIZE,
            dhash_max_distance: 10,
            temp_dir: None,
            ffmpeg_path: "ffmpeg".to_string(),
            ffprobe_path: "ffprobe".to_string(),
        }
    }
}

impl AppConfig {
    pub const KEYS: [&'static str; 7] = [
        "storage_root",
        "batch_threshold",
        "dhash_size",
        "dhash_max_distance",
        "temp_dir",
        "ffmpeg_path",
        "ffprobe_path",
    ];

    /// Parent directory for per-run frame extraction directories.
    pub fn temp_root(&self) -> PathBuf {
        self.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    /// Apply one `key = value` pair. `temp_dir` accepts `null` or an empty
    /// string to fall back to the system temp directory.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "storage_root" => self.storage_root = PathBuf::from(value),
            "batch_threshold" => {
                let threshold = value.parse::<usize>().map_err(|_| invalid())?;
                if threshold == 0 {
                    return Err(invalid());
                }
                self.batch_threshold = threshold;
            }
            "dhash_size" => {
                let size = value.parse::<u32>().map_err(|_| invalid())?;
                if size == 0 || size > MAX_DHASH_SIZE {
                    return Err(invalid());
                }
                self.dhash_size = size;
            }
            "dhash_max_distance" => {
                self.dhash_max_distance = value.parse().map_err(|_| invalid())?;
            }
            "temp_dir" => {
                self.temp_dir = match value {
                    "" | "null" => None,
                    dir => Some(PathBuf::from(dir)),
                };
            }
            "ffmpeg_path" => self.ffmpeg_path = value.to_string(),
            "ffprobe_path" => self.ffprobe_path = value.to_string(),
            _ => return Err(ConfigError::UnknownKey(key.to_string())),
        }
        Ok(())
    }

    /// Every key with its value rendered the way it is stored.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("storage_root", self.storage_root.display().to_string()),
            ("batch_threshold", self.batch_threshold.to_string()),
            ("dhash_size", self.dhash_size.to_string()),
            ("dhash_max_distance", self.dhash_max_distance.to_string()),
            (
                "temp_dir",
                self.temp_dir
                    .as_ref()
                    .map_or("null".to_string(), |d| d.display().to_string()),
            ),
            ("ffmpeg_path", self.ffmpeg_path.clone()),
            ("ffprobe_path", self.ffprobe_path.clone()),
        ]
    }
}
