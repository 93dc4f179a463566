//! Configuration loading for tapedeck.
//!
//! Kept free of async and logging dependencies so both the recorder library
//! and its binary can import it.
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/tapedeck/config.toml` (system)
//! 2. `~/.config/tapedeck/config.toml` (user)
//! 3. `./tapedeck.toml` (local override), or the `--config` path if given
//! 4. Environment variables (`TAPEDECK_*`)
//!
//! Files are merged key-by-key, so a local override that only sets
//! `pipeline.max_restarts` keeps everything else from the user file.
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! recordings_dir = "/srv/recordings"
//! log_dir = "~/.local/share/tapedeck/logs"
//!
//! [telemetry]
//! log_level = "info,tapedeck=debug"
//! otlp_endpoint = "127.0.0.1:4317"
//!
//! [capture]
//! quality = "1080p,best"
//!
//! [pipeline]
//! max_restarts = 20
//! stability_window_ms = 500
//!
//! [disk_guard]
//! min_free_bytes = 5368709120
//! safety_age_hours = 72
//! ```

pub mod infra;
pub mod loader;
pub mod pipeline;

pub use infra::{PathsConfig, TelemetryConfig};
pub use loader::{discover_config_files_with_override, expand_path, ConfigSources};
pub use pipeline::{
    render_args, CaptureConfig, DiskGuardConfig, DownscaleConfig, PipelineConfig, RelocateConfig,
    RetentionConfig, TranscodeConfig,
};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to render config: {0}")]
    Render(String),

    #[error("Invalid config value {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Complete tapedeck configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct TapeConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub capture: CaptureConfig,

    #[serde(default)]
    pub transcode: TranscodeConfig,

    #[serde(default)]
    pub relocate: RelocateConfig,

    #[serde(default)]
    pub downscale: DownscaleConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub disk_guard: DiskGuardConfig,

    #[serde(default)]
    pub retention: RetentionConfig,
}

impl TapeConfig {
    /// Load configuration from all standard sources.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration, letting `config_path` replace `./tapedeck.toml`.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and report which files and env vars contributed.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in loader::discover_config_files_with_override(config_path) {
            let table = loader::read_table(&path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path);
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;
        config.expand_paths();

        loader::apply_env_overrides(&mut config, &mut sources);
        config.validate()?;

        Ok((config, sources))
    }

    /// Parse a single TOML document on top of compiled defaults.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let origin = Path::new("<inline>");
        let table = loader::parse_table(contents, origin)?;
        let mut config = loader::from_table(table, origin)?;
        config.expand_paths();
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would stall a poll loop or panic a timer.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("pipeline.poll_interval_ms", self.pipeline.poll_interval_ms),
            ("pipeline.stability_window_ms", self.pipeline.stability_window_ms),
            ("pipeline.read_chunk_bytes", self.pipeline.read_chunk_bytes as u64),
            ("disk_guard.poll_interval_secs", self.disk_guard.poll_interval_secs),
            ("retention.buffer_interval_secs", self.retention.buffer_interval_secs),
            ("retention.result_interval_secs", self.retention.result_interval_secs),
            ("retention.downscaled_interval_secs", self.retention.downscaled_interval_secs),
            ("retention.log_interval_secs", self.retention.log_interval_secs),
            ("retention.empty_dir_interval_secs", self.retention.empty_dir_interval_secs),
            ("downscale.max_height", u64::from(self.downscale.max_height)),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key: key.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.downscale.subdir.is_empty() || self.downscale.subdir.contains(['/', '\\']) {
            return Err(ConfigError::Invalid {
                key: "downscale.subdir".to_string(),
                reason: "must be a single directory name".to_string(),
            });
        }
        Ok(())
    }

    /// Serialize the effective config to TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        let body = toml::to_string_pretty(self).map_err(|e| ConfigError::Render(e.to_string()))?;
        Ok(format!("# tapedeck configuration\n\n{}", body))
    }

    fn expand_paths(&mut self) {
        self.paths.recordings_dir = expand_path(&self.paths.recordings_dir.to_string_lossy());
        self.paths.log_dir = expand_path(&self.paths.log_dir.to_string_lossy());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TapeConfig::default();
        assert_eq!(config.capture.program, "streamlink");
        assert_eq!(config.transcode.program, "ffmpeg");
        assert_eq!(config.pipeline.max_restarts, 20);
    }

    #[test]
    fn test_to_toml_round_trips() {
        let config = TapeConfig::default();
        let toml = config.to_toml().unwrap();
        assert!(toml.contains("[paths]"));
        assert!(toml.contains("[disk_guard]"));

        let parsed = TapeConfig::from_toml_str(&toml).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let config = TapeConfig::from_toml_str(
            r#"
[pipeline]
max_restarts = 3

[capture]
clean_exit_codes = [0]
"#,
        )
        .unwrap();

        assert_eq!(config.pipeline.max_restarts, 3);
        assert_eq!(config.pipeline.stability_window_ms, 500);
        assert_eq!(config.capture.clean_exit_codes, vec![0]);
        assert_eq!(config.capture.program, "streamlink");
    }

    #[test]
    fn test_bad_toml_is_parse_error() {
        let err = TapeConfig::from_toml_str("[pipeline\nmax_restarts = ").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_zero_intervals_are_rejected() {
        for doc in [
            "[pipeline]\npoll_interval_ms = 0",
            "[pipeline]\nstability_window_ms = 0",
            "[pipeline]\nread_chunk_bytes = 0",
            "[disk_guard]\npoll_interval_secs = 0",
            "[retention]\nbuffer_interval_secs = 0",
            "[retention]\nresult_interval_secs = 0",
            "[retention]\ndownscaled_interval_secs = 0",
            "[retention]\nlog_interval_secs = 0",
            "[retention]\nempty_dir_interval_secs = 0",
        ] {
            let err = TapeConfig::from_toml_str(doc).unwrap_err();
            assert!(matches!(err, ConfigError::Invalid { .. }), "{doc} accepted");
        }
    }

    #[test]
    fn test_zero_interval_in_file_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("tapedeck.toml");
        std::fs::write(&path, "[disk_guard]\npoll_interval_secs = 0\n").unwrap();

        match TapeConfig::load_from(Some(&path)) {
            Err(ConfigError::Invalid { key, .. }) => assert_eq!(key, "disk_guard.poll_interval_secs"),
            other => panic!("expected invalid config, got {other:?}"),
        }
    }

    #[test]
    fn test_nested_downscale_subdir_is_rejected() {
        let err = TapeConfig::from_toml_str("[downscale]\nsubdir = \"a/b\"").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn test_zero_restarts_is_allowed() {
        let config = TapeConfig::from_toml_str("[pipeline]\nmax_restarts = 0").unwrap();
        assert_eq!(config.pipeline.max_restarts, 0);
    }

    #[test]
    fn test_wrong_type_is_parse_error() {
        let err = TapeConfig::from_toml_str("[pipeline]\nmax_restarts = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }
}
