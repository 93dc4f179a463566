//! On-disk layout of a recording session.
//!
//! ```text
//! {root}/{label}_{YYYY-MM-DD}/
//!     buffer_{HH_MM}/buffer0.ts
//!     buffer_{HH_MM}/buffer1.ts
//!     result_{HH_MM}_FINISHED/rec1_2026-01-01_20-00-00.mp4
//! ```

use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};

use crate::error::{PipelineError, Result};

pub const BUFFER_DIR_PREFIX: &str = "buffer_";
pub const RESULT_DIR_PREFIX: &str = "result_";
pub const FINISHED_SUFFIX: &str = "_FINISHED";

/// Replace characters that would escape or split a path component.
pub fn sanitize_label(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();

    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "session".to_string()
    } else {
        cleaned
    }
}

pub fn session_dir_name(label: &str, now: DateTime<Local>) -> String {
    format!("{}_{}", sanitize_label(label), now.format("%Y-%m-%d"))
}

pub fn buffer_file_name(index: u64, extension: &str) -> String {
    format!("buffer{}.{}", index, extension)
}

/// Create `{root}/{label}_{date}`, reusing it if a same-day session exists.
pub fn create_session_dir(root: &Path, label: &str, now: DateTime<Local>) -> Result<PathBuf> {
    let dir = root.join(session_dir_name(label, now));
    std::fs::create_dir_all(&dir).map_err(|e| PipelineError::io(&dir, e))?;
    Ok(dir)
}

pub fn create_buffer_dir(session: &Path, now: DateTime<Local>) -> Result<PathBuf> {
    create_unique_child(session, BUFFER_DIR_PREFIX, now)
}

pub fn create_result_dir(session: &Path, now: DateTime<Local>) -> Result<PathBuf> {
    create_unique_child(session, RESULT_DIR_PREFIX, now)
}

fn create_unique_child(parent: &Path, prefix: &str, now: DateTime<Local>) -> Result<PathBuf> {
    let base = format!("{}{}", prefix, now.format("%H_%M"));
    let mut n = 1u32;
    loop {
        let name = if n == 1 {
            base.clone()
        } else {
            format!("{}_{}", base, n)
        };
        let candidate = parent.join(name);
        match std::fs::create_dir(&candidate) {
            Ok(()) => return Ok(candidate),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
            }
            Err(e) => return Err(PipelineError::io(candidate, e)),
        }
    }
}

/// First free `{dir}_FINISHED`, `{dir}_FINISHED_2`, ... sibling path.
pub fn finished_path(dir: &Path) -> PathBuf {
    let name = dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = dir.parent().unwrap_or_else(|| Path::new("."));

    let first = parent.join(format!("{}{}", name, FINISHED_SUFFIX));
    if !first.exists() {
        return first;
    }

    let mut n = 2u32;
    loop {
        let candidate = parent.join(format!("{}{}_{}", name, FINISHED_SUFFIX, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

/// Rename a completed result directory so downstream consumers see it as stable.
pub fn mark_finished(dir: &Path) -> Result<PathBuf> {
    let target = finished_path(dir);
    std::fs::rename(dir, &target).map_err(|e| PipelineError::Finalize {
        path: dir.to_path_buf(),
        reason: format!("rename to {} failed: {}", target.display(), e),
    })?;
    Ok(target)
}

pub fn is_buffer_dir_name(name: &str) -> bool {
    name.starts_with(BUFFER_DIR_PREFIX)
}

pub fn is_result_dir_name(name: &str) -> bool {
    name.starts_with(RESULT_DIR_PREFIX)
}

/// Session directories are `{label}_{date}`; anything without `_` is not ours.
pub fn is_session_dir_name(name: &str) -> bool {
    name.contains('_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    #[test]
    fn test_sanitize_label() {
        assert_eq!(sanitize_label("some channel"), "some_channel");
        assert_eq!(sanitize_label("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_label("   "), "session");
    }

    #[test]
    fn test_session_and_buffer_names() {
        let tmp = tempfile::tempdir().unwrap();
        let session = create_session_dir(tmp.path(), "streamer", at(20, 5)).unwrap();
        assert_eq!(session.file_name().unwrap(), "streamer_2026-03-14");

        let first = create_buffer_dir(&session, at(20, 5)).unwrap();
        let second = create_buffer_dir(&session, at(20, 5)).unwrap();
        assert_eq!(first.file_name().unwrap(), "buffer_20_05");
        assert_eq!(second.file_name().unwrap(), "buffer_20_05_2");

        assert_eq!(buffer_file_name(3, "ts"), "buffer3.ts");
    }

    #[test]
    fn test_mark_finished_collision_suffix() {
        let tmp = tempfile::tempdir().unwrap();
        let session = tmp.path().join("streamer_2026-03-14");

        let first = create_result_dir(&session, at(21, 0)).unwrap();
        let done = mark_finished(&first).unwrap();
        assert_eq!(done.file_name().unwrap(), "result_21_00_FINISHED");

        let again = create_result_dir(&session, at(21, 0)).unwrap();
        assert_eq!(again.file_name().unwrap(), "result_21_00");
        let done = mark_finished(&again).unwrap();
        assert_eq!(done.file_name().unwrap(), "result_21_00_FINISHED_2");

        let third = create_result_dir(&session, at(21, 0)).unwrap();
        let done = mark_finished(&third).unwrap();
        assert_eq!(done.file_name().unwrap(), "result_21_00_FINISHED_3");
    }
}
