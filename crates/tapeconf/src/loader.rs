//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, TapeConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided and exists, it replaces the local override.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/tapedeck/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("tapedeck/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        if path.exists() {
            files.push(path.to_path_buf());
            return files;
        }
    }

    let local = PathBuf::from("tapedeck.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a TOML file into a raw table.
pub fn read_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

pub(crate) fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    contents
        .parse()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
}

/// Deserialize a merged table; missing keys fall back to compiled defaults.
pub(crate) fn from_table(table: toml::Table, origin: &Path) -> Result<TapeConfig, ConfigError> {
    toml::Value::Table(table)
        .try_into()
        .map_err(|e: toml::de::Error| ConfigError::Parse {
            path: origin.to_path_buf(),
            message: e.to_string(),
        })
}

/// Merge `overlay` into `base`, recursing into nested tables.
///
/// Scalars and arrays in `overlay` replace those in `base` wholesale.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(base_child)), toml::Value::Table(overlay_child)) => {
                merge_tables(base_child, overlay_child);
            }
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}

/// Apply environment variable overrides to config.
pub fn apply_env_overrides(config: &mut TapeConfig, sources: &mut ConfigSources) {
    if let Ok(v) = env::var("TAPEDECK_RECORDINGS_DIR") {
        config.paths.recordings_dir = expand_path(&v);
        sources.env_overrides.push("TAPEDECK_RECORDINGS_DIR".to_string());
    }
    if let Ok(v) = env::var("TAPEDECK_LOG_DIR") {
        config.paths.log_dir = expand_path(&v);
        sources.env_overrides.push("TAPEDECK_LOG_DIR".to_string());
    }

    // Telemetry
    if let Ok(v) = env::var("TAPEDECK_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = v;
        sources.env_overrides.push("TAPEDECK_OTLP_ENDPOINT".to_string());
    }
    // Also support standard OTEL env var
    if let Ok(v) = env::var("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = v;
        sources.env_overrides.push("OTEL_EXPORTER_OTLP_ENDPOINT".to_string());
    }
    if let Ok(v) = env::var("TAPEDECK_LOG_LEVEL") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("TAPEDECK_LOG_LEVEL".to_string());
    }
    if let Ok(v) = env::var("RUST_LOG") {
        config.telemetry.log_level = v;
        sources.env_overrides.push("RUST_LOG".to_string());
    }

    // Tool locations
    if let Ok(v) = env::var("TAPEDECK_CAPTURE_PROGRAM") {
        config.capture.program = v;
        sources.env_overrides.push("TAPEDECK_CAPTURE_PROGRAM".to_string());
    }
    if let Ok(v) = env::var("TAPEDECK_TRANSCODE_PROGRAM") {
        config.transcode.program = v.clone();
        config.relocate.program = v;
        sources.env_overrides.push("TAPEDECK_TRANSCODE_PROGRAM".to_string());
    }

    if let Ok(v) = env::var("TAPEDECK_MIN_FREE_BYTES") {
        if let Ok(bytes) = v.parse() {
            config.disk_guard.min_free_bytes = bytes;
            sources.env_overrides.push("TAPEDECK_MIN_FREE_BYTES".to_string());
        }
    }
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // Handle $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_expand_path_tilde() {
        let expanded = expand_path("~/test/path");
        assert!(!expanded.to_string_lossy().starts_with('~'));
        assert!(expanded.to_string_lossy().contains("test/path"));
    }

    #[test]
    fn test_expand_path_absolute() {
        let expanded = expand_path("/absolute/path");
        assert_eq!(expanded, PathBuf::from("/absolute/path"));
    }

    #[test]
    fn test_discover_config_files() {
        // Just verify it doesn't panic
        let _files = discover_config_files();
    }

    #[test]
    fn test_cli_override_is_discovered_last() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"[pipeline]\nmax_restarts = 2\n")
            .unwrap();

        let files = discover_config_files_with_override(Some(&path));
        assert_eq!(files.last(), Some(&path));
    }

    #[test]
    fn test_merge_tables_is_deep() {
        let mut base = parse_table(
            r#"
[pipeline]
max_restarts = 5
poll_interval_ms = 50

[paths]
recordings_dir = "/data/rec"
"#,
            Path::new("base.toml"),
        )
        .unwrap();
        let overlay = parse_table(
            r#"
[pipeline]
max_restarts = 9
"#,
            Path::new("overlay.toml"),
        )
        .unwrap();

        merge_tables(&mut base, overlay);
        let config = from_table(base, Path::new("merged")).unwrap();

        assert_eq!(config.pipeline.max_restarts, 9);
        assert_eq!(config.pipeline.poll_interval_ms, 50);
        assert_eq!(config.paths.recordings_dir, PathBuf::from("/data/rec"));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = read_table(Path::new("/nonexistent/tapedeck.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::FileRead { .. }));
    }
}
