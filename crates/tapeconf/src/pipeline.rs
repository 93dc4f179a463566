//! Pipeline configuration - external tools, timing windows, and janitors.
//!
//! Tool invocations are argument templates. Each element may contain
//! `{name}` placeholders filled in by [`render_args`] at spawn time, so the
//! recorder never hard-codes a tool's command line.

use serde::{Deserialize, Serialize};
use std::time::Duration;

const KIB: u64 = 1024;
const GIB: u64 = 1024 * 1024 * 1024;

/// Capture tool invocation. The tool writes raw media to stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Default: streamlink
    #[serde(default = "CaptureConfig::default_program")]
    pub program: String,

    /// Placeholders: `{target}`, `{quality}`, `{auth_token}`.
    #[serde(default = "CaptureConfig::default_args")]
    pub args: Vec<String>,

    /// Quality/format preference list passed as `{quality}`.
    /// Default: 1080p,best,720p
    #[serde(default = "CaptureConfig::default_quality")]
    pub quality: String,

    /// Exit codes meaning "the stream ended", not "the tool crashed".
    /// Default: [0, 1]
    #[serde(default = "CaptureConfig::default_clean_exit_codes")]
    pub clean_exit_codes: Vec<i32>,

    /// Extension for buffer files.
    /// Default: ts
    #[serde(default = "CaptureConfig::default_buffer_extension")]
    pub buffer_extension: String,
}

impl CaptureConfig {
    fn default_program() -> String {
        "streamlink".to_string()
    }

    fn default_args() -> Vec<String> {
        [
            "--stdout",
            "--twitch-disable-ads",
            "--retry-streams",
            "3",
            "--retry-max",
            "3",
            "--retry-open",
            "10",
            "--stream-segment-attempts",
            "10",
            "--stream-segment-threads",
            "2",
            "--stream-timeout",
            "180",
            "--hls-playlist-reload-attempts",
            "10",
            "--default-stream",
            "{quality}",
            "--twitch-api-header",
            "Authorization=Bearer {auth_token}",
            "{target}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_quality() -> String {
        "1080p,best,720p".to_string()
    }

    fn default_clean_exit_codes() -> Vec<i32> {
        vec![0, 1]
    }

    fn default_buffer_extension() -> String {
        "ts".to_string()
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            args: Self::default_args(),
            quality: Self::default_quality(),
            clean_exit_codes: Self::default_clean_exit_codes(),
            buffer_extension: Self::default_buffer_extension(),
        }
    }
}

/// Transcode tool invocation. Media arrives on stdin, segments land in the
/// working directory (the session's result directory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Default: ffmpeg
    #[serde(default = "TranscodeConfig::default_program")]
    pub program: String,

    /// Placeholders: `{segment_seconds}`, `{output}`.
    #[serde(default = "TranscodeConfig::default_args")]
    pub args: Vec<String>,

    /// Default: [0]
    #[serde(default = "TranscodeConfig::default_clean_exit_codes")]
    pub clean_exit_codes: Vec<i32>,

    /// Segment duration in seconds.
    /// Default: 3600
    #[serde(default = "TranscodeConfig::default_segment_seconds")]
    pub segment_seconds: u64,

    /// Output naming pattern passed as `{output}`. `{attempt}` is replaced
    /// with the transcode attempt number; strftime escapes are left to the tool.
    #[serde(default = "TranscodeConfig::default_output_pattern")]
    pub output_pattern: String,

    /// Extension identifying finished segments in the result directory.
    /// Default: mp4
    #[serde(default = "TranscodeConfig::default_segment_extension")]
    pub segment_extension: String,
}

impl TranscodeConfig {
    fn default_program() -> String {
        "ffmpeg".to_string()
    }

    fn default_args() -> Vec<String> {
        [
            "-hide_banner",
            "-y",
            "-i",
            "pipe:0",
            "-c:v",
            "libx264",
            "-preset",
            "veryslow",
            "-crf",
            "20",
            "-c:a",
            "copy",
            "-f",
            "segment",
            "-segment_time",
            "{segment_seconds}",
            "-reset_timestamps",
            "1",
            "-segment_format",
            "mp4",
            "-strftime",
            "1",
            "{output}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_clean_exit_codes() -> Vec<i32> {
        vec![0]
    }

    fn default_segment_seconds() -> u64 {
        3600
    }

    fn default_output_pattern() -> String {
        "rec{attempt}_%Y-%m-%d_%H-%M-%S.mp4".to_string()
    }

    fn default_segment_extension() -> String {
        "mp4".to_string()
    }
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            args: Self::default_args(),
            clean_exit_codes: Self::default_clean_exit_codes(),
            segment_seconds: Self::default_segment_seconds(),
            output_pattern: Self::default_output_pattern(),
            segment_extension: Self::default_segment_extension(),
        }
    }
}

/// Metadata relocation pass, run once per finished segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelocateConfig {
    /// Default: ffmpeg
    #[serde(default = "RelocateConfig::default_program")]
    pub program: String,

    /// Placeholders: `{input}`, `{output}`.
    #[serde(default = "RelocateConfig::default_args")]
    pub args: Vec<String>,

    /// Upper bound for one relocation run.
    /// Default: 1800
    #[serde(default = "RelocateConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl RelocateConfig {
    fn default_program() -> String {
        "ffmpeg".to_string()
    }

    fn default_args() -> Vec<String> {
        [
            "-hide_banner",
            "-y",
            "-i",
            "{input}",
            "-c",
            "copy",
            "-movflags",
            "+faststart",
            "{output}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_timeout_secs() -> u64 {
        1800
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for RelocateConfig {
    fn default() -> Self {
        Self {
            program: Self::default_program(),
            args: Self::default_args(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

/// Reduced-resolution copy of a finished recording.
///
/// The height of the first segment is read with `inspect_program`, whose
/// stdout must be the height as a bare integer. Recordings taller than
/// `max_height` get every segment re-encoded into `subdir`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownscaleConfig {
    /// Default: true
    #[serde(default = "DownscaleConfig::default_enabled")]
    pub enabled: bool,

    /// Default: ffprobe
    #[serde(default = "DownscaleConfig::default_inspect_program")]
    pub inspect_program: String,

    /// Placeholders: `{input}`.
    #[serde(default = "DownscaleConfig::default_inspect_args")]
    pub inspect_args: Vec<String>,

    /// Default: ffmpeg
    #[serde(default = "DownscaleConfig::default_program")]
    pub program: String,

    /// Placeholders: `{input}`, `{output}`, `{height}`.
    #[serde(default = "DownscaleConfig::default_args")]
    pub args: Vec<String>,

    /// Target height; shorter recordings are left alone.
    /// Default: 720
    #[serde(default = "DownscaleConfig::default_max_height")]
    pub max_height: u32,

    /// Output directory inside the finished result directory.
    /// Default: 720p
    #[serde(default = "DownscaleConfig::default_subdir")]
    pub subdir: String,

    /// Prefix added to each segment's file name in `subdir`.
    /// Default: 720
    #[serde(default = "DownscaleConfig::default_file_prefix")]
    pub file_prefix: String,

    /// Upper bound for one segment's encode.
    /// Default: 21600
    #[serde(default = "DownscaleConfig::default_timeout_secs")]
    pub timeout_secs: u64,
}

impl DownscaleConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_inspect_program() -> String {
        "ffprobe".to_string()
    }

    fn default_inspect_args() -> Vec<String> {
        [
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=height",
            "-of",
            "csv=p=0",
            "{input}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_program() -> String {
        "ffmpeg".to_string()
    }

    fn default_args() -> Vec<String> {
        [
            "-hide_banner",
            "-y",
            "-i",
            "{input}",
            "-vf",
            "scale=-2:{height}",
            "-c:v",
            "libx264",
            "-preset",
            "veryslow",
            "-crf",
            "20",
            "-c:a",
            "copy",
            "-movflags",
            "+faststart",
            "{output}",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_max_height() -> u32 {
        720
    }

    fn default_subdir() -> String {
        "720p".to_string()
    }

    fn default_file_prefix() -> String {
        "720".to_string()
    }

    fn default_timeout_secs() -> u64 {
        6 * 3600
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for DownscaleConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            inspect_program: Self::default_inspect_program(),
            inspect_args: Self::default_inspect_args(),
            program: Self::default_program(),
            args: Self::default_args(),
            max_height: Self::default_max_height(),
            subdir: Self::default_subdir(),
            file_prefix: Self::default_file_prefix(),
            timeout_secs: Self::default_timeout_secs(),
        }
    }
}

/// Restart policy and timing windows shared by both stages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Crashes tolerated per stage per session before escalating to fatal.
    /// Default: 20
    #[serde(default = "PipelineConfig::default_max_restarts")]
    pub max_restarts: u32,

    /// Tail poll interval while a buffer file is not growing.
    /// Default: 100
    #[serde(default = "PipelineConfig::default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// No-growth duration before a buffer file may be treated as done.
    /// Default: 500
    #[serde(default = "PipelineConfig::default_stability_window_ms")]
    pub stability_window_ms: u64,

    /// SIGTERM-to-SIGKILL grace for the tool's process group.
    /// Default: 5
    #[serde(default = "PipelineConfig::default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,

    /// How long a stop request waits for a natural drain before hard cancel.
    /// Default: 600
    #[serde(default = "PipelineConfig::default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// How long an abrupt shutdown waits for in-flight buffer copies.
    /// Default: 2
    #[serde(default = "PipelineConfig::default_copy_flush_grace_secs")]
    pub copy_flush_grace_secs: u64,

    /// Read size when forwarding buffer bytes to the transcode tool.
    /// Default: 524288
    #[serde(default = "PipelineConfig::default_read_chunk_bytes")]
    pub read_chunk_bytes: usize,
}

impl PipelineConfig {
    fn default_max_restarts() -> u32 {
        20
    }

    fn default_poll_interval_ms() -> u64 {
        100
    }

    fn default_stability_window_ms() -> u64 {
        500
    }

    fn default_shutdown_grace_secs() -> u64 {
        5
    }

    fn default_drain_timeout_secs() -> u64 {
        600
    }

    fn default_copy_flush_grace_secs() -> u64 {
        2
    }

    fn default_read_chunk_bytes() -> usize {
        (512 * KIB) as usize
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn copy_flush_grace(&self) -> Duration {
        Duration::from_secs(self.copy_flush_grace_secs)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_restarts: Self::default_max_restarts(),
            poll_interval_ms: Self::default_poll_interval_ms(),
            stability_window_ms: Self::default_stability_window_ms(),
            shutdown_grace_secs: Self::default_shutdown_grace_secs(),
            drain_timeout_secs: Self::default_drain_timeout_secs(),
            copy_flush_grace_secs: Self::default_copy_flush_grace_secs(),
            read_chunk_bytes: Self::default_read_chunk_bytes(),
        }
    }
}

/// Free-space monitor for the recordings root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiskGuardConfig {
    /// Default: 5 GiB
    #[serde(default = "DiskGuardConfig::default_min_free_bytes")]
    pub min_free_bytes: u64,

    /// Default: 900 (15 minutes)
    #[serde(default = "DiskGuardConfig::default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Buffer directories younger than this are never evicted.
    /// Default: 72
    #[serde(default = "DiskGuardConfig::default_safety_age_hours")]
    pub safety_age_hours: u64,
}

impl DiskGuardConfig {
    fn default_min_free_bytes() -> u64 {
        5 * GIB
    }

    fn default_poll_interval_secs() -> u64 {
        900
    }

    fn default_safety_age_hours() -> u64 {
        72
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn safety_age(&self) -> Duration {
        Duration::from_secs(self.safety_age_hours * 3600)
    }
}

impl Default for DiskGuardConfig {
    fn default() -> Self {
        Self {
            min_free_bytes: Self::default_min_free_bytes(),
            poll_interval_secs: Self::default_poll_interval_secs(),
            safety_age_hours: Self::default_safety_age_hours(),
        }
    }
}

/// Periodic janitors for old buffers, results, downscaled copies, logs, and
/// empty directories.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "RetentionConfig::default_day_hours")]
    pub buffer_max_age_hours: u64,
    #[serde(default = "RetentionConfig::default_day_secs")]
    pub buffer_interval_secs: u64,

    #[serde(default = "RetentionConfig::default_day_hours")]
    pub result_max_age_hours: u64,
    #[serde(default = "RetentionConfig::default_result_interval_secs")]
    pub result_interval_secs: u64,

    #[serde(default = "RetentionConfig::default_day_hours")]
    pub log_max_age_hours: u64,
    #[serde(default = "RetentionConfig::default_log_interval_secs")]
    pub log_interval_secs: u64,

    #[serde(default = "RetentionConfig::default_downscaled_max_age_hours")]
    pub downscaled_max_age_hours: u64,
    #[serde(default = "RetentionConfig::default_result_interval_secs")]
    pub downscaled_interval_secs: u64,

    #[serde(default = "RetentionConfig::default_empty_dir_max_age_days")]
    pub empty_dir_max_age_days: u64,
    #[serde(default = "RetentionConfig::default_day_secs")]
    pub empty_dir_interval_secs: u64,
}

impl RetentionConfig {
    fn default_day_hours() -> u64 {
        24
    }

    fn default_day_secs() -> u64 {
        86_400
    }

    fn default_result_interval_secs() -> u64 {
        5 * 3600
    }

    // A day plus five minutes, so the log sweep lands after the daily rollover.
    fn default_log_interval_secs() -> u64 {
        86_400 + 300
    }

    fn default_downscaled_max_age_hours() -> u64 {
        5
    }

    fn default_empty_dir_max_age_days() -> u64 {
        30
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            buffer_max_age_hours: Self::default_day_hours(),
            buffer_interval_secs: Self::default_day_secs(),
            result_max_age_hours: Self::default_day_hours(),
            result_interval_secs: Self::default_result_interval_secs(),
            log_max_age_hours: Self::default_day_hours(),
            log_interval_secs: Self::default_log_interval_secs(),
            downscaled_max_age_hours: Self::default_downscaled_max_age_hours(),
            downscaled_interval_secs: Self::default_result_interval_secs(),
            empty_dir_max_age_days: Self::default_empty_dir_max_age_days(),
            empty_dir_interval_secs: Self::default_day_secs(),
        }
    }
}

/// Substitute `{key}` placeholders in every argument.
///
/// Each argument is scanned once, left to right, so a substituted value is
/// never itself searched for placeholders. Unknown placeholders are left
/// verbatim, which keeps strftime-style patterns and literal braces intact.
pub fn render_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template.iter().map(|arg| render_one(arg, vars)).collect()
}

fn render_one(arg: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(arg.len());
    let mut rest = arg;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let value = tail[1..].find('}').and_then(|close| {
            let key = &tail[1..1 + close];
            vars.iter()
                .find(|(k, _)| *k == key)
                .map(|(_, v)| (*v, close + 2))
        });
        match value {
            Some((value, consumed)) => {
                out.push_str(value);
                rest = &tail[consumed..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
