//! Configuration management for castmedia
//!
//! This module handles loading the pipeline tunables (clock update period,
//! statistics throttling, buffering watermarks per load type) from config
//! files and environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use crate::pipeline::{BufferingConfig, LoadType};
use crate::utils::error::{IntoPipelineError, PipelineError, Result};

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Period of the media-time update task in milliseconds
    pub time_update_interval_ms: u64,

    /// Statistics are pulled from the sub-pipelines every N time updates
    pub statistics_interval_ticks: u32,

    /// Watermarks for URL loads
    pub url_buffering: BufferingThresholds,

    /// Watermarks for source-buffer (MSE) loads
    pub media_source_buffering: BufferingThresholds,

    /// Also report the "buffering started" edge to the client.
    /// Off by default: clients only understand "have enough".
    pub report_buffering_started: bool,
}

/// Buffered-duration watermarks in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferingThresholds {
    /// Re-enter buffering below this much data past the media time
    pub low_threshold_ms: u64,

    /// Leave buffering once every stream has this much data
    pub high_threshold_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            time_update_interval_ms: 250,
            statistics_interval_ticks: 4,
            url_buffering: BufferingThresholds {
                low_threshold_ms: 2000,
                high_threshold_ms: 6000,
            },
            media_source_buffering: BufferingThresholds {
                low_threshold_ms: 0,
                high_threshold_ms: 300,
            },
            report_buffering_started: false,
        }
    }
}

impl BufferingThresholds {
    /// Convert to the controller's configuration
    pub fn to_buffering_config(self) -> BufferingConfig {
        BufferingConfig::new(
            Duration::from_millis(self.low_threshold_ms),
            Duration::from_millis(self.high_threshold_ms),
        )
    }
}

impl PipelineConfig {
    /// Time-update period as a Duration, never shorter than 1 ms
    pub fn time_update_interval(&self) -> Duration {
        Duration::from_millis(self.time_update_interval_ms.max(1))
    }

    /// Buffering configuration for a load type, `None` when the load type
    /// runs without a buffering controller
    pub fn buffering_for(&self, load_type: LoadType) -> Option<BufferingConfig> {
        match load_type {
            LoadType::Url => Some(self.url_buffering.to_buffering_config()),
            LoadType::MediaSource => Some(self.media_source_buffering.to_buffering_config()),
            LoadType::Other => None,
        }
    }

    /// Load configuration from various sources
    ///
    /// Configuration is loaded in the following order (later sources override earlier):
    /// 1. Default values
    /// 2. User config file (~/.config/castmedia/pipeline.toml on Linux)
    /// 3. Environment variables (CASTMEDIA_* prefix)
    pub fn load() -> Result<Self> {
        let mut config = match Self::user_config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };

        config.apply_env_overrides()?;
        config.validate()?;

        Ok(config)
    }

    /// Load and validate configuration from an explicit TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .config_err("Failed to read config file")?;

        let config: PipelineConfig = toml::from_str(&contents)
            .config_err("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file, creating parent directories
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let toml = toml::to_string_pretty(self)
            .config_err("Failed to serialize config")?;

        std::fs::write(path, toml)?;
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(interval) = std::env::var("CASTMEDIA_TIME_UPDATE_INTERVAL_MS") {
            self.time_update_interval_ms = interval.parse()
                .map_err(|_| PipelineError::Config("Invalid CASTMEDIA_TIME_UPDATE_INTERVAL_MS".to_string()))?;
        }

        if let Ok(ticks) = std::env::var("CASTMEDIA_STATISTICS_INTERVAL_TICKS") {
            self.statistics_interval_ticks = ticks.parse()
                .map_err(|_| PipelineError::Config("Invalid CASTMEDIA_STATISTICS_INTERVAL_TICKS".to_string()))?;
        }

        if let Ok(flag) = std::env::var("CASTMEDIA_REPORT_BUFFERING_STARTED") {
            self.report_buffering_started = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.time_update_interval_ms == 0 {
            return Err(PipelineError::Config("time_update_interval_ms must be non-zero".to_string()));
        }

        if self.statistics_interval_ticks == 0 {
            return Err(PipelineError::Config("statistics_interval_ticks must be non-zero".to_string()));
        }

        for (name, thresholds) in [
            ("url_buffering", &self.url_buffering),
            ("media_source_buffering", &self.media_source_buffering),
        ] {
            if thresholds.low_threshold_ms > thresholds.high_threshold_ms {
                return Err(PipelineError::Config(format!(
                    "{}: low threshold {}ms exceeds high threshold {}ms",
                    name, thresholds.low_threshold_ms, thresholds.high_threshold_ms
                )));
            }
        }

        Ok(())
    }

    /// Get user config file path
    fn user_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("castmedia").join("pipeline.toml"))
    }
}
