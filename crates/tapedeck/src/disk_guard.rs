//! Free-space monitor for the recordings root.
//!
//! Under pressure, evicts whole buffer directories oldest first. Anything
//! younger than the safety age is assumed to belong to the live session and
//! is never touched, even if that leaves the disk below the minimum.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tapeconf::DiskGuardConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{PipelineError, Result};
use crate::layout;

/// Source of free-space readings, swappable for tests.
pub trait SpaceProbe: Send + Sync + 'static {
    fn available(&self, path: &Path) -> std::io::Result<u64>;
}

/// Reads free space for the filesystem holding `path`.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsSpaceProbe;

impl SpaceProbe for FsSpaceProbe {
    fn available(&self, path: &Path) -> std::io::Result<u64> {
        fs2::available_space(path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardReport {
    Healthy {
        free: u64,
    },
    Recovered {
        free: u64,
        evicted: Vec<PathBuf>,
    },
    /// Every eligible directory is gone and space is still short.
    Insufficient {
        free: u64,
        required: u64,
        evicted: Vec<PathBuf>,
    },
}

pub struct DiskSpaceGuard<P: SpaceProbe = FsSpaceProbe> {
    root: PathBuf,
    min_free_bytes: u64,
    poll_interval: Duration,
    safety_age: Duration,
    probe: P,
}

impl DiskSpaceGuard<FsSpaceProbe> {
    pub fn new(root: PathBuf, config: &DiskGuardConfig) -> Self {
        Self::with_probe(root, config, FsSpaceProbe)
    }
}

impl<P: SpaceProbe> DiskSpaceGuard<P> {
    pub fn with_probe(root: PathBuf, config: &DiskGuardConfig, probe: P) -> Self {
        Self {
            root,
            min_free_bytes: config.min_free_bytes,
            poll_interval: config.poll_interval().max(Duration::from_secs(1)),
            safety_age: config.safety_age(),
            probe,
        }
    }

    /// Poll until cancelled. The first check runs immediately.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            root = %self.root.display(),
            min_free_bytes = self.min_free_bytes,
            poll_secs = self.poll_interval.as_secs(),
            safety_age_hours = self.safety_age.as_secs() / 3600,
            "Disk space guard started"
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let guard = self.clone();
            let outcome =
                tokio::task::spawn_blocking(move || guard.check_once_at(SystemTime::now())).await;
            match outcome {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!(error = %e, "Disk space check failed"),
                Err(e) => error!(error = %e, "Disk space check panicked"),
            }
        }

        debug!("Disk space guard stopped");
    }

    /// One check, treating `now` as the current time for age decisions.
    pub fn check_once_at(&self, now: SystemTime) -> Result<GuardReport> {
        let mut free = self.free()?;
        if free >= self.min_free_bytes {
            debug!(free, "Disk space healthy");
            return Ok(GuardReport::Healthy { free });
        }

        warn!(
            free,
            required = self.min_free_bytes,
            "Low disk space, looking for old buffers"
        );

        let mut evicted = Vec::new();
        for (dir, modified) in self.buffer_dirs_oldest_first()? {
            let age = now.duration_since(modified).unwrap_or_default();
            if age < self.safety_age {
                // Sorted ascending by mtime: everything after is younger still.
                debug!(dir = %dir.display(), age_secs = age.as_secs(), "Buffer too young to evict");
                break;
            }

            match std::fs::remove_dir_all(&dir) {
                Ok(()) => {
                    info!(dir = %dir.display(), age_hours = age.as_secs() / 3600, "Evicted buffer directory");
                    evicted.push(dir);
                }
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Failed to evict buffer directory");
                    continue;
                }
            }

            free = self.free()?;
            if free >= self.min_free_bytes {
                info!(free, evicted = evicted.len(), "Disk space recovered");
                return Ok(GuardReport::Recovered { free, evicted });
            }
        }

        let shortage = PipelineError::DiskExhaustion {
            free,
            required: self.min_free_bytes,
        };
        error!(
            error = %shortage,
            evicted = evicted.len(),
            "Nothing left to evict, operator attention required"
        );
        Ok(GuardReport::Insufficient {
            free,
            required: self.min_free_bytes,
            evicted,
        })
    }

    fn free(&self) -> Result<u64> {
        self.probe
            .available(&self.root)
            .map_err(|e| PipelineError::io(&self.root, e))
    }

    /// `{root}/{session}/buffer_*` directories, oldest modification first.
    fn buffer_dirs_oldest_first(&self) -> Result<Vec<(PathBuf, SystemTime)>> {
        let mut found = Vec::new();
        let sessions = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(PipelineError::io(&self.root, e)),
        };

        for session in sessions.filter_map(|e| e.ok()) {
            let session_path = session.path();
            let is_session = session.file_type().map(|t| t.is_dir()).unwrap_or(false)
                && layout::is_session_dir_name(&session.file_name().to_string_lossy());
            if !is_session {
                continue;
            }

            let Ok(children) = std::fs::read_dir(&session_path) else {
                continue;
            };
            for child in children.filter_map(|e| e.ok()) {
                let name = child.file_name();
                if !layout::is_buffer_dir_name(&name.to_string_lossy()) {
                    continue;
                }
                let Ok(meta) = child.metadata() else { continue };
                if !meta.is_dir() {
                    continue;
                }
                if let Ok(modified) = meta.modified() {
                    let path = child.path();
                    let latest = latest_write(&path, modified);
                    found.push((path, latest));
                }
            }
        }

        found.sort_by_key(|(_, modified)| *modified);
        Ok(found)
    }
}

/// Newest mtime of a buffer directory and the files directly inside it.
///
/// Appending to a buffer file does not touch the directory's own mtime, so
/// a long-lived capture would otherwise look as old as its first file.
fn latest_write(dir: &Path, dir_modified: SystemTime) -> SystemTime {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return dir_modified;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter_map(|m| m.modified().ok())
        .fold(dir_modified, |latest, t| latest.max(t))
}
