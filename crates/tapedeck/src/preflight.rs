//! Startup check that every configured tool can be launched.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tapeconf::TapeConfig;
use tracing::{debug, error};

use crate::error::{PipelineError, Result};
use crate::supervisor::Stage;

/// A tool that resolved to an executable file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTool {
    pub stage: Stage,
    pub program: String,
    pub path: PathBuf,
}

/// Resolve every program the pipeline will launch.
///
/// The downscale tools are only checked when that pass is enabled. Every
/// tool is checked so the log lists all of the missing ones.
pub fn check(config: &TapeConfig) -> Result<Vec<ResolvedTool>> {
    let path_var = std::env::var_os("PATH");
    let mut tools = vec![
        (Stage::Capture, &config.capture.program),
        (Stage::Transcode, &config.transcode.program),
        (Stage::Relocate, &config.relocate.program),
    ];
    if config.downscale.enabled {
        tools.push((Stage::Downscale, &config.downscale.inspect_program));
        tools.push((Stage::Downscale, &config.downscale.program));
    }

    let mut resolved = Vec::new();
    let mut missing = Vec::new();
    for (stage, program) in tools {
        match resolve_program(program, path_var.as_deref()) {
            Ok(path) => {
                debug!(%stage, program = %program, path = %path.display(), "Tool resolved");
                resolved.push(ResolvedTool {
                    stage,
                    program: program.clone(),
                    path,
                });
            }
            Err(reason) => {
                error!(%stage, program = %program, %reason, "Tool not available");
                missing.push((stage, reason));
            }
        }
    }

    match missing.into_iter().next() {
        None => Ok(resolved),
        Some((stage, reason)) => Err(PipelineError::FatalProcessFailure { stage, reason }),
    }
}

/// Find `program` as a path or a name on `path_var`.
pub fn resolve_program(program: &str, path_var: Option<&OsStr>) -> std::result::Result<PathBuf, String> {
    if program.is_empty() {
        return Err("no program configured".to_string());
    }

    let as_path = Path::new(program);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        return if is_executable(as_path) {
            Ok(as_path.to_path_buf())
        } else {
            Err(format!("{} is not an executable file", as_path.display()))
        };
    }

    let Some(path_var) = path_var else {
        return Err(format!("{program} not found: PATH is unset"));
    };
    std::env::split_paths(path_var)
        .map(|dir| dir.join(program))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| format!("{program} not found on PATH"))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
