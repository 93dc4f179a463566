use std::path::PathBuf;
use thiserror::Error;

use crate::supervisor::Stage;

/// Failures surfaced by the recording pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A tool exited unexpectedly; the owning stage retries.
    #[error("{stage} crashed on attempt {attempt}: {reason}")]
    TransientProcessCrash {
        stage: Stage,
        attempt: u32,
        reason: String,
    },

    /// Restart bound exceeded or the tool cannot be launched at all.
    #[error("{stage} failed fatally: {reason}")]
    FatalProcessFailure { stage: Stage, reason: String },

    /// No eligible buffer directory left to evict.
    #[error("disk exhausted: {free} bytes free, {required} required")]
    DiskExhaustion { free: u64, required: u64 },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("finalize failed for {path}: {reason}")]
    Finalize { path: PathBuf, reason: String },

    #[error("buffer queue is closed for adding")]
    QueueClosed,

    #[error("a session is already {0}")]
    SessionBusy(&'static str),
}

impl PipelineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PipelineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error ends the session rather than being retried.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            PipelineError::TransientProcessCrash { .. }
                | PipelineError::DiskExhaustion { .. }
                | PipelineError::Finalize { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
