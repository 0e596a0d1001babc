//! Utility module for castmedia
//!
//! This module provides common utilities used throughout the crate:
//! - Error handling with custom error types
//! - Configuration management
//! - Formatting helpers for log output

pub mod config;
pub mod error;

// Re-export commonly used items
pub use config::{BufferingThresholds, PipelineConfig};
pub use error::{IntoPipelineError, PipelineError, Result};

/// Format a media timestamp for log output
///
/// Returns "MM:SS.mmm", or "HH:MM:SS.mmm" for timestamps of an hour or more
pub fn format_timestamp(timestamp: std::time::Duration) -> String {
    let total_secs = timestamp.as_secs();
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    let millis = timestamp.subsec_millis();

    if hours > 0 {
        format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
    } else {
        format!("{:02}:{:02}.{:03}", minutes, seconds, millis)
    }
}
