//! Post-pass over a completed result directory.
//!
//! Each segment is rewritten by the relocate tool (container metadata moved
//! to the front for progressive playback) into a temporary sibling, which
//! then replaces the original. A segment the tool chokes on is left as-is
//! and flagged. The directory is renamed to `..._FINISHED` next.
//!
//! Recordings taller than the downscale target then get a reduced copy of
//! every segment in a subdirectory of the finished directory. Failures there
//! are flagged separately and never touch the full-quality segments.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use tapeconf::{render_args, DownscaleConfig, RelocateConfig};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};
use crate::layout;
use crate::supervisor::{ExitClass, ProcessSpec, Stage, SupervisedProcess};

const TEMP_MARKER: &str = ".relocating.";

#[derive(Debug, Clone, Serialize)]
pub struct FinishedRecording {
    /// The renamed, stable result directory.
    pub dir: PathBuf,
    /// Every output segment, in name order.
    pub segments: Vec<PathBuf>,
    /// Segments whose relocation pass failed; they are kept unmodified.
    pub flagged: Vec<PathBuf>,
    /// Reduced-resolution copies, in segment order.
    pub downscaled: Vec<PathBuf>,
    /// Segments whose reduced copy could not be made.
    pub downscale_flagged: Vec<PathBuf>,
}

/// Segment files in `dir` with the given extension, sorted by name.
pub fn list_segments(dir: &Path, extension: &str) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir).map_err(|e| PipelineError::io(dir, e))?;
    let mut segments: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| path.extension().is_some_and(|ext| ext == extension))
        .filter(|path| {
            !path
                .file_name()
                .is_some_and(|n| n.to_string_lossy().contains(TEMP_MARKER))
        })
        .collect();
    segments.sort();
    Ok(segments)
}

pub async fn finalize(
    result_dir: &Path,
    extension: &str,
    relocate: &RelocateConfig,
    downscale: &DownscaleConfig,
    cancel: &CancellationToken,
) -> Result<FinishedRecording> {
    let segments = list_segments(result_dir, extension)?;
    info!(result.dir = %result_dir.display(), segments = segments.len(), "Finalizing recording");

    let mut flagged = Vec::new();
    for (n, segment) in segments.iter().enumerate() {
        if cancel.is_cancelled() {
            warn!(segment = %segment.display(), "Shutdown during finalize, relocation skipped");
            flagged.push(segment.clone());
            continue;
        }
        if let Err(e) = relocate_segment(segment, extension, relocate, n as u32 + 1, cancel).await {
            warn!(error = %e, "Segment left unmodified");
            flagged.push(segment.clone());
        }
    }

    let finished_dir = layout::mark_finished(result_dir)?;
    let rebase = |p: &PathBuf| match p.file_name() {
        Some(name) => finished_dir.join(name),
        None => p.clone(),
    };

    let mut recording = FinishedRecording {
        segments: segments.iter().map(rebase).collect(),
        flagged: flagged.iter().map(rebase).collect(),
        dir: finished_dir.clone(),
        downscaled: Vec::new(),
        downscale_flagged: Vec::new(),
    };

    if downscale.enabled && !recording.segments.is_empty() {
        if cancel.is_cancelled() {
            warn!("Shutdown during finalize, reduced copy skipped");
        } else {
            downscale_recording(&mut recording, downscale, cancel).await;
        }
    }

    info!(
        result.dir = %recording.dir.display(),
        segments = recording.segments.len(),
        flagged = recording.flagged.len(),
        downscaled = recording.downscaled.len(),
        "Recording finished"
    );
    Ok(recording)
}

async fn relocate_segment(
    segment: &Path,
    extension: &str,
    relocate: &RelocateConfig,
    attempt: u32,
    cancel: &CancellationToken,
) -> Result<()> {
    let temp = temp_path(segment, extension);
    let input = segment.to_string_lossy();
    let output = temp.to_string_lossy();
    let args = render_args(
        &relocate.args,
        &[("input", input.as_ref()), ("output", output.as_ref())],
    );
    let spec = ProcessSpec::new(Stage::Relocate, &relocate.program, args);

    let fail = |reason: String| {
        let _ = std::fs::remove_file(&temp);
        PipelineError::Finalize {
            path: segment.to_path_buf(),
            reason,
        }
    };

    run_to_completion(&spec, attempt, relocate.timeout(), cancel)
        .await
        .map_err(fail)?;

    if !temp.is_file() {
        return Err(fail("tool produced no output".to_string()));
    }
    std::fs::rename(&temp, segment).map_err(|e| fail(format!("replace failed: {}", e)))?;
    Ok(())
}

/// Make the reduced copies when the recording is taller than the target.
async fn downscale_recording(
    recording: &mut FinishedRecording,
    downscale: &DownscaleConfig,
    cancel: &CancellationToken,
) {
    let first = recording.segments[0].clone();
    let height = match read_height(&first, downscale, cancel).await {
        Ok(height) => height,
        Err(e) => {
            warn!(error = %e, "Could not read recording height, reduced copy skipped");
            return;
        }
    };
    if height <= downscale.max_height {
        info!(height, max_height = downscale.max_height, "Recording already small enough, no reduced copy");
        return;
    }

    let out_dir = recording.dir.join(&downscale.subdir);
    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        warn!(dir = %out_dir.display(), error = %e, "Cannot create reduced copy directory");
        recording.downscale_flagged = recording.segments.clone();
        return;
    }
    info!(height, target = downscale.max_height, dir = %out_dir.display(), "Making reduced copy");

    let segments = recording.segments.clone();
    for (n, segment) in segments.iter().enumerate() {
        if cancel.is_cancelled() {
            recording.downscale_flagged.push(segment.clone());
            continue;
        }
        match downscale_segment(segment, &out_dir, downscale, n as u32 + 1, cancel).await {
            Ok(output) => recording.downscaled.push(output),
            Err(e) => {
                warn!(error = %e, "Reduced copy failed");
                recording.downscale_flagged.push(segment.clone());
            }
        }
    }
}

async fn downscale_segment(
    segment: &Path,
    out_dir: &Path,
    downscale: &DownscaleConfig,
    attempt: u32,
    cancel: &CancellationToken,
) -> Result<PathBuf> {
    let name = segment
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let output = out_dir.join(format!("{}{}", downscale.file_prefix, name));
    let height = downscale.max_height.to_string();
    let input = segment.to_string_lossy();
    let output_arg = output.to_string_lossy();
    let args = render_args(
        &downscale.args,
        &[
            ("input", input.as_ref()),
            ("output", output_arg.as_ref()),
            ("height", height.as_str()),
        ],
    );
    let spec = ProcessSpec::new(Stage::Downscale, &downscale.program, args);

    let fail = |reason: String| {
        let _ = std::fs::remove_file(&output);
        PipelineError::Finalize {
            path: segment.to_path_buf(),
            reason,
        }
    };

    run_to_completion(&spec, attempt, downscale.timeout(), cancel)
        .await
        .map_err(fail)?;
    if !output.is_file() {
        return Err(fail("tool produced no output".to_string()));
    }
    Ok(output)
}

/// Ask the inspect tool for the video height of `segment`.
async fn read_height(
    segment: &Path,
    downscale: &DownscaleConfig,
    cancel: &CancellationToken,
) -> Result<u32> {
    let input = segment.to_string_lossy();
    let args = render_args(&downscale.inspect_args, &[("input", input.as_ref())]);
    let spec = ProcessSpec::new(Stage::Downscale, &downscale.inspect_program, args).pipe_stdout();
    let fail = |reason: String| PipelineError::Finalize {
        path: segment.to_path_buf(),
        reason,
    };

    let mut process = SupervisedProcess::spawn(&spec, 1).map_err(|e| fail(e.to_string()))?;
    let mut stdout = process
        .take_stdout()
        .ok_or_else(|| fail("stdout was not piped".to_string()))?;

    let mut out = String::new();
    let read = tokio::select! {
        read = tokio::time::timeout(INSPECT_TIMEOUT, stdout.read_to_string(&mut out)) => read,
        _ = cancel.cancelled() => {
            process.terminate(TOOL_GRACE).await;
            return Err(fail("interrupted by shutdown".to_string()));
        }
    };
    match read {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => {
            process.terminate(TOOL_GRACE).await;
            return Err(fail(format!("reading output failed: {}", e)));
        }
        Err(_) => {
            process.terminate(TOOL_GRACE).await;
            return Err(fail(format!("timed out after {}s", INSPECT_TIMEOUT.as_secs())));
        }
    }

    match process.wait(cancel, TOOL_GRACE).await {
        ExitClass::CleanExit { .. } => {}
        ExitClass::CrashExit { reason, .. } => return Err(fail(reason)),
        ExitClass::Killed => return Err(fail("interrupted by shutdown".to_string())),
    }

    let height = parse_height(&out).ok_or_else(|| fail(format!("unexpected output {:?}", out.trim())))?;
    debug!(segment = %segment.display(), height, "Recording height");
    Ok(height)
}

/// First line of `out` that holds a bare integer, tolerating csv trailers.
fn parse_height(out: &str) -> Option<u32> {
    out.lines()
        .map(|line| line.trim().trim_end_matches(','))
        .find_map(|line| line.parse().ok())
}

const TOOL_GRACE: Duration = Duration::from_secs(5);
const INSPECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Run a one-shot tool, bounded by `timeout` and `cancel`.
async fn run_to_completion(
    spec: &ProcessSpec,
    attempt: u32,
    timeout: Duration,
    cancel: &CancellationToken,
) -> std::result::Result<(), String> {
    let mut process = SupervisedProcess::spawn(spec, attempt).map_err(|e| e.to_string())?;
    let exit = match tokio::time::timeout(timeout, process.wait(cancel, TOOL_GRACE)).await {
        Ok(exit) => exit,
        Err(_) => {
            process.terminate(TOOL_GRACE).await;
            return Err(format!("timed out after {}s", timeout.as_secs()));
        }
    };
    match exit {
        ExitClass::CleanExit { .. } => Ok(()),
        ExitClass::CrashExit { reason, .. } => Err(reason),
        ExitClass::Killed => Err("interrupted by shutdown".to_string()),
    }
}

fn temp_path(segment: &Path, extension: &str) -> PathBuf {
    let stem = segment
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    segment.with_file_name(format!("{}{}{}", stem, TEMP_MARKER, extension))
}
