//! Infrastructure configuration - where things live and how we report.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Filesystem locations for recordings and logs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Root directory holding one `{label}_{date}` directory per session.
    /// Default: ~/.local/share/tapedeck/recordings
    #[serde(default = "PathsConfig::default_recordings_dir")]
    pub recordings_dir: PathBuf,

    /// Directory for rolling log files.
    /// Default: ~/.local/share/tapedeck/logs
    #[serde(default = "PathsConfig::default_log_dir")]
    pub log_dir: PathBuf,
}

impl PathsConfig {
    fn default_recordings_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/tapedeck/recordings"))
            .unwrap_or_else(|| PathBuf::from(".local/share/tapedeck/recordings"))
    }

    fn default_log_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/tapedeck/logs"))
            .unwrap_or_else(|| PathBuf::from(".local/share/tapedeck/logs"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            recordings_dir: Self::default_recordings_dir(),
            log_dir: Self::default_log_dir(),
        }
    }
}

/// Telemetry and observability configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// OTLP gRPC endpoint for OpenTelemetry. Empty disables export.
    /// Default: "" (console and file logging only)
    #[serde(default)]
    pub otlp_endpoint: String,

    /// Log level or filter directive (trace, debug, info, warn, error).
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// True when traces and logs should be shipped over OTLP.
    pub fn otlp_enabled(&self) -> bool {
        !self.otlp_endpoint.trim().is_empty()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            otlp_endpoint: String::new(),
            log_level: Self::default_log_level(),
        }
    }
}
