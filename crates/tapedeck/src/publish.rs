//! Hand-off point to whatever announces finished recordings.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Local};
use serde::Serialize;
use uuid::Uuid;

use crate::finalize::FinishedRecording;

/// How a session came to an end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// Stream ended and both stages drained.
    Completed,
    /// Hard shutdown before drain finished.
    Aborted,
    /// A stage hit a fatal error.
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub id: Uuid,
    pub label: String,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub session_dir: PathBuf,
    pub buffers: u64,
    pub end: SessionEnd,
}

/// Events emitted over a session's lifetime.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    RecordingFinished(FinishedRecording),
    SessionEnded(SessionSummary),
}

/// Receives session output once it is stable on disk.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn recording_finished(&self, recording: &FinishedRecording);

    async fn session_ended(&self, summary: &SessionSummary);
}

/// Publisher that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPublisher;

#[async_trait]
impl Publisher for LogPublisher {
    async fn recording_finished(&self, recording: &FinishedRecording) {
        tracing::info!(
            result.dir = %recording.dir.display(),
            segments = recording.segments.len(),
            flagged = recording.flagged.len(),
            downscaled = recording.downscaled.len(),
            "Recording ready"
        );
        for segment in &recording.flagged {
            tracing::warn!(segment = %segment.display(), "Segment needs manual metadata relocation");
        }
        for segment in &recording.downscale_flagged {
            tracing::warn!(segment = %segment.display(), "Segment has no reduced copy");
        }
    }

    async fn session_ended(&self, summary: &SessionSummary) {
        match serde_json::to_string(summary) {
            Ok(json) => tracing::info!(session.id = %summary.id, summary = %json, "Session ended"),
            Err(e) => tracing::warn!(session.id = %summary.id, error = %e, "Session ended (summary not serializable)"),
        }
    }
}
