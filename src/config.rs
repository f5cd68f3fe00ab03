/*
 * parafetch - Resumable segmented download engine.
 * Copyright (C) 2025  parafetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Configuration management with validation and defaults.

use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Segment count bounds enforced everywhere a count is accepted
pub const MIN_SEGMENTS: usize = 1;
pub const MAX_SEGMENTS: usize = 16;

/// Main configuration structure for parafetch
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum number of concurrently active downloads
    pub max_active_downloads: usize,

    /// Default number of segments per download (clamped to 1..=16)
    pub default_segments: usize,

    /// Global speed limit in bytes/sec (0 = unlimited)
    pub global_speed_limit: u64,

    /// Connection timeout in seconds
    pub connect_timeout_secs: u64,

    /// Request timeout in seconds
    pub request_timeout_secs: u64,

    /// Stall timeout: abort a segment read that makes no progress for this long
    pub stall_timeout_secs: u64,

    /// Retry attempts per segment on the same mirror before failover
    pub max_segment_retries: u32,

    /// Mirror switches allowed per segment before the segment fails
    pub max_mirror_switches: u32,

    /// Full restarts allowed after a checksum mismatch before failing
    pub max_checksum_restarts: u32,

    /// How often segment progress is flushed to the repository, in milliseconds
    pub flush_interval_ms: u64,

    /// Working directory for partial (.part) files; empty = destination directory
    pub work_dir: Option<PathBuf>,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_active_downloads: 3,
            default_segments: 4,
            global_speed_limit: 0,
            connect_timeout_secs: 5,
            request_timeout_secs: 300,
            stall_timeout_secs: 30,
            max_segment_retries: 3,
            max_mirror_switches: 3,
            max_checksum_restarts: 1,
            flush_interval_ms: 500,
            work_dir: None,
            logging: LoggingConfig::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = no file logging)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration with precedence:
    /// 1. /etc/parafetch/parafetch.toml (system-wide)
    /// 2. ~/.config/parafetch/config.toml (user)
    /// 3. Environment variables (PARAFETCH_*)
    pub fn load() -> Self {
        let mut config = Config::default();

        let system_config = Path::new("/etc/parafetch/parafetch.toml");
        if system_config.exists() {
            if let Ok(content) = fs::read_to_string(system_config) {
                if let Ok(parsed) = toml::from_str::<Config>(&content) {
                    config = parsed;
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("parafetch").join("config.toml");
            if user_config.exists() {
                if let Ok(content) = fs::read_to_string(&user_config) {
                    if let Ok(parsed) = toml::from_str::<Config>(&content) {
                        config = parsed;
                    }
                }
            }
        }

        config.apply_env_overrides()
    }

    /// Parse a config from TOML text
    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut self) -> Self {
        if let Ok(val) = std::env::var("PARAFETCH_MAX_ACTIVE") {
            if let Ok(n) = val.parse() {
                self.max_active_downloads = n;
            }
        }

        if let Ok(val) = std::env::var("PARAFETCH_SEGMENTS") {
            if let Ok(n) = val.parse() {
                self.default_segments = n;
            }
        }

        if let Ok(val) = std::env::var("PARAFETCH_SPEED_LIMIT") {
            if let Ok(n) = val.parse() {
                self.global_speed_limit = n;
            }
        }

        if let Ok(val) = std::env::var("PARAFETCH_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.max_active_downloads == 0 {
            return Err("max_active_downloads must be at least 1".to_string());
        }
        if self.max_active_downloads > 16 {
            return Err("max_active_downloads must be at most 16".to_string());
        }
        if !(MIN_SEGMENTS..=MAX_SEGMENTS).contains(&self.default_segments) {
            return Err(format!(
                "default_segments must be between {} and {}",
                MIN_SEGMENTS, MAX_SEGMENTS
            ));
        }
        if self.flush_interval_ms == 0 {
            return Err("flush_interval_ms must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
