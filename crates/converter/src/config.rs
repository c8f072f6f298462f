use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use crate::error::ConvertError;

/// Upper bound for `copy_timeout_secs` (one week)
pub const MAX_COPY_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;

/// Configuration for the conversion daemon
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConverterConfig {
    /// Directory polled for newly-arrived media files (not recursive)
    pub watch_dir: PathBuf,
    /// Directory the transcoder writes converted files into
    pub output_dir: PathBuf,
    /// Video encoder passed to ffmpeg as `-c:v`; audio and subtitles are copied
    pub video_codec: String,
    /// Delay between directory scans in milliseconds
    pub poll_interval_ms: u64,
    /// Delay between file size samples while waiting for a copy to finish
    pub stable_check_interval_ms: u64,
    /// Give up on a file whose size is still changing after this many seconds
    pub copy_timeout_secs: u64,
    /// Maximum number of jobs waiting for the dispatcher
    pub queue_capacity: usize,
    /// Address the progress endpoint listens on
    pub http_addr: SocketAddr,
    /// Seconds to wait for the progress endpoint to shut down
    pub shutdown_timeout_secs: u64,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl ConverterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            watch_dir: PathBuf::from("/Conversions"),
            output_dir: PathBuf::from("/Conversions/Converted"),
            video_codec: "libx264".to_string(),
            poll_interval_ms: 100,
            stable_check_interval_ms: 1000,
            copy_timeout_secs: 300,
            queue_capacity: 100,
            http_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            shutdown_timeout_secs: 5,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                // TOML by extension, JSON otherwise
                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }

    /// Reject settings the daemon cannot run with
    pub fn validate(&self) -> std::result::Result<(), ConvertError> {
        if self.poll_interval_ms == 0 {
            return Err(ConvertError::Config("poll_interval_ms must be greater than zero".into()));
        }
        if self.stable_check_interval_ms == 0 {
            return Err(ConvertError::Config(
                "stable_check_interval_ms must be greater than zero".into(),
            ));
        }
        if self.copy_timeout_secs == 0 || self.copy_timeout_secs > MAX_COPY_TIMEOUT_SECS {
            return Err(ConvertError::Config(format!(
                "copy_timeout_secs must be between 1 and {}",
                MAX_COPY_TIMEOUT_SECS
            )));
        }
        if self.queue_capacity == 0 {
            return Err(ConvertError::Config("queue_capacity must be greater than zero".into()));
        }
        if self.video_codec.trim().is_empty() {
            return Err(ConvertError::Config("video_codec must not be empty".into()));
        }
        // Converted files would be rediscovered and converted again
        if self.output_dir == self.watch_dir {
            return Err(ConvertError::Config(format!(
                "output_dir must differ from watch_dir ({})",
                self.watch_dir.display()
            )));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stable_check_interval(&self) -> Duration {
        Duration::from_millis(self.stable_check_interval_ms)
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Codec policy: re-encode video, pass audio and subtitles through
    pub fn codec_args(&self) -> Vec<String> {
        vec![
            "-c:v".to_string(),
            self.video_codec.clone(),
            "-c:a".to_string(),
            "copy".to_string(),
            "-c:s".to_string(),
            "copy".to_string(),
        ]
    }
}
