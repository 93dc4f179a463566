//! Periodic janitors for old recordings, reduced copies, and logs.
//!
//! Each sweeper owns one kind of debris and runs on its own interval. None
//! of them touch the live session directory.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tapeconf::TapeConfig;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::layout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepKind {
    /// `{session}/buffer_*` directories.
    Buffers,
    /// `{session}/result_*` directories, finished or not.
    Results,
    /// `{session}/result_*/{subdir}` reduced-resolution copies.
    Downscaled,
    /// Files in the log directory.
    Logs,
    /// Empty directories anywhere under the recordings root.
    EmptyDirs,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: Vec<PathBuf>,
    pub failed: usize,
}

pub struct Sweeper {
    kind: SweepKind,
    root: PathBuf,
    max_age: Duration,
    interval: Duration,
    active: watch::Receiver<Option<PathBuf>>,
    subdir: Option<String>,
}

/// Shortest tick a sweeper accepts.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

impl Sweeper {
    pub fn new(
        kind: SweepKind,
        root: PathBuf,
        max_age: Duration,
        interval: Duration,
        active: watch::Receiver<Option<PathBuf>>,
    ) -> Self {
        Self {
            kind,
            root,
            max_age,
            interval,
            active,
            subdir: None,
        }
    }

    /// Directory name a [`SweepKind::Downscaled`] sweeper looks for.
    pub fn subdir(mut self, name: impl Into<String>) -> Self {
        self.subdir = Some(name.into());
        self
    }

    /// The standard set of sweepers for a configuration.
    pub fn all(config: &TapeConfig, active: watch::Receiver<Option<PathBuf>>) -> Vec<Sweeper> {
        let r = &config.retention;
        let hours = |h: u64| Duration::from_secs(h * 3600);
        let secs = Duration::from_secs;
        let recordings = config.paths.recordings_dir.clone();

        vec![
            Sweeper::new(
                SweepKind::Buffers,
                recordings.clone(),
                hours(r.buffer_max_age_hours),
                secs(r.buffer_interval_secs),
                active.clone(),
            ),
            Sweeper::new(
                SweepKind::Results,
                recordings.clone(),
                hours(r.result_max_age_hours),
                secs(r.result_interval_secs),
                active.clone(),
            ),
            Sweeper::new(
                SweepKind::Downscaled,
                recordings.clone(),
                hours(r.downscaled_max_age_hours),
                secs(r.downscaled_interval_secs),
                active.clone(),
            )
            .subdir(config.downscale.subdir.clone()),
            Sweeper::new(
                SweepKind::Logs,
                config.paths.log_dir.clone(),
                hours(r.log_max_age_hours),
                secs(r.log_interval_secs),
                active.clone(),
            ),
            Sweeper::new(
                SweepKind::EmptyDirs,
                recordings,
                hours(r.empty_dir_max_age_days * 24),
                secs(r.empty_dir_interval_secs),
                active,
            ),
        ]
    }

    pub fn kind(&self) -> SweepKind {
        self.kind
    }

    pub async fn run(self, cancel: CancellationToken) {
        debug!(kind = ?self.kind, root = %self.root.display(), "Sweeper started");
        let mut ticker = tokio::time::interval(self.interval.max(MIN_INTERVAL));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let report = self.sweep_once(SystemTime::now());
            if !report.removed.is_empty() || report.failed > 0 {
                info!(
                    kind = ?self.kind,
                    removed = report.removed.len(),
                    failed = report.failed,
                    "Sweep finished"
                );
            }
        }
    }

    pub fn sweep_once(&self, now: SystemTime) -> SweepReport {
        let active = self.active.borrow().clone();
        let protected = |path: &Path| active.as_deref().is_some_and(|dir| path.starts_with(dir));
        let expired = |path: &Path| {
            modified(path)
                .map(|t| now.duration_since(t).unwrap_or_default() >= self.max_age)
                .unwrap_or(false)
        };

        let candidates: Vec<PathBuf> = match self.kind {
            SweepKind::Buffers => session_children(&self.root, layout::is_buffer_dir_name),
            SweepKind::Results => session_children(&self.root, layout::is_result_dir_name),
            SweepKind::Downscaled => match &self.subdir {
                Some(name) => session_children(&self.root, layout::is_result_dir_name)
                    .into_iter()
                    .map(|result| result.join(name))
                    .filter(|dir| dir.is_dir())
                    .collect(),
                None => Vec::new(),
            },
            SweepKind::Logs => files_in(&self.root),
            SweepKind::EmptyDirs => empty_dirs(&self.root),
        };

        let mut report = SweepReport::default();
        for path in candidates {
            if protected(&path) || !expired(&path) {
                continue;
            }
            let removed = match self.kind {
                SweepKind::Buffers | SweepKind::Results | SweepKind::Downscaled => {
                    std::fs::remove_dir_all(&path)
                }
                SweepKind::Logs => std::fs::remove_file(&path),
                // Something may have landed in it since the walk.
                SweepKind::EmptyDirs => std::fs::remove_dir(&path),
            };
            match removed {
                Ok(()) => {
                    debug!(kind = ?self.kind, path = %path.display(), "Removed");
                    report.removed.push(path);
                }
                Err(e) => {
                    warn!(kind = ?self.kind, path = %path.display(), error = %e, "Removal failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::symlink_metadata(path).ok()?.modified().ok()
}

/// `{root}/{session}/{child}` directories whose name passes `matches`.
fn session_children(root: &Path, matches: fn(&str) -> bool) -> Vec<PathBuf> {
    WalkDir::new(root)
        .min_depth(2)
        .max_depth(2)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| matches(&e.file_name().to_string_lossy()))
        .filter(|e| {
            e.path()
                .parent()
                .and_then(|p| p.file_name())
                .is_some_and(|n| layout::is_session_dir_name(&n.to_string_lossy()))
        })
        .map(|e| e.into_path())
        .collect()
}

fn files_in(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .collect()
}

/// Empty directories below `root`, deepest first.
fn empty_dirs(root: &Path) -> Vec<PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .contents_first(true)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| {
            std::fs::read_dir(e.path())
                .map(|mut entries| entries.next().is_none())
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn age(path: &Path, by: Duration, now: SystemTime) {
        std::fs::File::open(path)
            .unwrap()
            .set_modified(now - by)
            .unwrap();
    }

    fn sweeper(kind: SweepKind, root: &Path, max_age: Duration, active: Option<PathBuf>) -> Sweeper {
        let (_tx, rx) = watch::channel(active);
        Sweeper::new(kind, root.to_path_buf(), max_age, HOUR, rx)
    }

    #[test]
    fn test_buffer_sweep_respects_age_and_active_session() {
        let tmp = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let old_session = tmp.path().join("chan_2026-01-01");
        let live_session = tmp.path().join("chan_2026-01-02");
        let old = old_session.join("buffer_10_00");
        let fresh = old_session.join("buffer_23_00");
        let live = live_session.join("buffer_09_00");
        let result = old_session.join("result_10_00_FINISHED");
        for dir in [&old, &fresh, &live, &result] {
            std::fs::create_dir_all(dir).unwrap();
        }
        age(&old, 48 * HOUR, now);
        age(&live, 48 * HOUR, now);
        age(&result, 48 * HOUR, now);

        let report = sweeper(SweepKind::Buffers, tmp.path(), 24 * HOUR, Some(live_session))
            .sweep_once(now);

        assert_eq!(report.removed, vec![old.clone()]);
        assert!(fresh.exists());
        assert!(live.exists(), "live session is never swept");
        assert!(result.exists(), "buffer sweeper leaves results alone");
    }

    #[test]
    fn test_result_sweep() {
        let tmp = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let result = tmp.path().join("chan_2026-01-01").join("result_10_00_FINISHED");
        std::fs::create_dir_all(&result).unwrap();
        std::fs::write(result.join("rec1.mp4"), b"x").unwrap();
        age(&result, 30 * HOUR, now);

        let report = sweeper(SweepKind::Results, tmp.path(), 24 * HOUR, None).sweep_once(now);
        assert_eq!(report.removed, vec![result.clone()]);
        assert!(!result.exists());
    }

    #[test]
    fn test_downscaled_sweep_removes_only_the_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let session = tmp.path().join("chan_2026-01-01");
        let result = session.join("result_10_00_FINISHED");
        let stale = result.join("720p");
        let fresh = session.join("result_22_00_FINISHED").join("720p");
        let stray = session.join("buffer_10_00").join("720p");
        for dir in [&stale, &fresh, &stray] {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(result.join("rec1.mp4"), b"full").unwrap();
        std::fs::write(stale.join("720rec1.mp4"), b"small").unwrap();
        for dir in [&stale, &stray] {
            age(dir, 6 * HOUR, now);
        }

        let report = sweeper(SweepKind::Downscaled, tmp.path(), 5 * HOUR, None)
            .subdir("720p")
            .sweep_once(now);

        assert_eq!(report.removed, vec![stale.clone()]);
        assert!(result.join("rec1.mp4").exists());
        assert!(fresh.exists());
        assert!(stray.exists(), "only result directories hold reduced copies");
    }

    #[test]
    fn test_downscaled_sweep_without_subdir_is_inert() {
        let tmp = tempfile::tempdir().unwrap();
        let copy = tmp.path().join("chan_2026-01-01/result_10_00_FINISHED/720p");
        std::fs::create_dir_all(&copy).unwrap();
        let now = SystemTime::now();
        age(&copy, 10 * HOUR, now);

        let report = sweeper(SweepKind::Downscaled, tmp.path(), HOUR, None).sweep_once(now);
        assert!(report.removed.is_empty());
        assert!(copy.exists());
    }

    #[tokio::test]
    async fn test_zero_interval_does_not_panic() {
        let tmp = tempfile::tempdir().unwrap();
        let (_tx, rx) = watch::channel(None);
        let sweeper = Sweeper::new(SweepKind::Logs, tmp.path().to_path_buf(), HOUR, Duration::ZERO, rx);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(sweeper.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        task.await.unwrap();
    }

    #[test]
    fn test_log_sweep_keeps_recent() {
        let tmp = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let stale = tmp.path().join("tapedeck.log.2026-01-01");
        let current = tmp.path().join("tapedeck.log.2026-01-03");
        std::fs::write(&stale, b"old").unwrap();
        std::fs::write(&current, b"new").unwrap();
        age(&stale, 50 * HOUR, now);

        let report = sweeper(SweepKind::Logs, tmp.path(), 24 * HOUR, None).sweep_once(now);
        assert_eq!(report.removed, vec![stale]);
        assert!(current.exists());
    }

    #[test]
    fn test_empty_dir_sweep_only_old_and_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let month = 24 * 30 * HOUR;

        let empty_old = tmp.path().join("chan_2025-11-01");
        let empty_new = tmp.path().join("chan_2026-01-01");
        let non_empty = tmp.path().join("chan_2025-10-01");
        std::fs::create_dir_all(&empty_old).unwrap();
        std::fs::create_dir_all(&empty_new).unwrap();
        std::fs::create_dir_all(&non_empty).unwrap();
        std::fs::write(non_empty.join("keep.txt"), b"k").unwrap();
        age(&empty_old, month + HOUR, now);
        age(&non_empty, month + HOUR, now);

        let report = sweeper(SweepKind::EmptyDirs, tmp.path(), month, None).sweep_once(now);
        assert_eq!(report.removed, vec![empty_old.clone()]);
        assert!(empty_new.exists());
        assert!(non_empty.exists());
    }

    #[test]
    fn test_missing_root_is_harmless() {
        let tmp = tempfile::tempdir().unwrap();
        let gone = tmp.path().join("nope");
        for kind in [
            SweepKind::Buffers,
            SweepKind::Results,
            SweepKind::Downscaled,
            SweepKind::Logs,
            SweepKind::EmptyDirs,
        ] {
            let report = sweeper(kind, &gone, HOUR, None).sweep_once(SystemTime::now());
            assert_eq!(report, SweepReport::default());
        }
    }

    #[test]
    fn test_all_builds_every_kind() {
        let (_tx, rx) = watch::channel(None);
        let kinds: Vec<_> = Sweeper::all(&TapeConfig::default(), rx)
            .iter()
            .map(|s| s.kind())
            .collect();
        assert_eq!(
            kinds,
            vec![
                SweepKind::Buffers,
                SweepKind::Results,
                SweepKind::Downscaled,
                SweepKind::Logs,
                SweepKind::EmptyDirs
            ]
        );
    }
}
