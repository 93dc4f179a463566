//! Session lifecycle: `Idle -> Live -> Draining -> Idle`.
//!
//! A session owns one buffer queue, one capture stage and one transcode
//! stage. Stopping a session is a drain, not a kill: capture stops
//! restarting, its last attempt ends, the queue closes, transcode consumes
//! what is left and finalizes. Only if the drain overruns its timeout (or a
//! hard shutdown is requested) are the tools terminated.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::Serialize;
use tapeconf::TapeConfig;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Instrument};
use uuid::Uuid;

use crate::buffer_queue::BufferQueue;
use crate::capture::{CaptureOutcome, CaptureStage, CaptureTarget};
use crate::error::{PipelineError, Result};
use crate::layout;
use crate::publish::{Publisher, SessionEnd, SessionEvent, SessionSummary};
use crate::supervisor::Stage;
use crate::transcode::{TranscodeOutcome, TranscodeStage};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Live,
    Draining,
}

/// Stream-start notification payload.
#[derive(Debug, Clone)]
pub struct StartSession {
    pub label: String,
    pub target: String,
    pub auth_token: String,
}

#[derive(Debug, Clone)]
struct SessionTokens {
    id: Uuid,
    /// Soft stop: no more capture restarts, let everything drain.
    stream_ended: CancellationToken,
    /// Hard stop: terminate the tools now.
    shutdown: CancellationToken,
}

struct Inner {
    config: TapeConfig,
    publisher: Arc<dyn Publisher>,
    state: watch::Sender<SessionState>,
    active_dir: watch::Sender<Option<PathBuf>>,
    active: Mutex<Option<SessionTokens>>,
    last_summary: Mutex<Option<SessionSummary>>,
}

/// Starts and stops sessions. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(config: TapeConfig, publisher: Arc<dyn Publisher>) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        let (active_dir, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                config,
                publisher,
                state,
                active_dir,
                active: Mutex::new(None),
                last_summary: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Directory of the live session, `None` when idle. Janitors must skip it.
    pub fn active_dir(&self) -> watch::Receiver<Option<PathBuf>> {
        self.inner.active_dir.subscribe()
    }

    pub fn last_summary(&self) -> Option<SessionSummary> {
        lock(&self.inner.last_summary).clone()
    }

    /// `Idle -> Live`: lay out the session on disk and start both stages.
    pub fn start_session(&self, request: StartSession) -> Result<Uuid> {
        let mut active = lock(&self.inner.active);
        if active.is_some() || self.state() != SessionState::Idle {
            return Err(PipelineError::SessionBusy("live"));
        }

        let now = Local::now();
        let root = &self.inner.config.paths.recordings_dir;
        let session_dir = layout::create_session_dir(root, &request.label, now)?;
        let buffer_dir = layout::create_buffer_dir(&session_dir, now)?;

        let tokens = SessionTokens {
            id: Uuid::new_v4(),
            stream_ended: CancellationToken::new(),
            shutdown: CancellationToken::new(),
        };
        let id = tokens.id;
        *active = Some(tokens.clone());
        drop(active);

        self.inner.active_dir.send_replace(Some(session_dir.clone()));
        self.inner.state.send_replace(SessionState::Live);

        let span = tracing::info_span!("session", session.id = %id, session.label = %request.label);
        info!(
            parent: &span,
            session.dir = %session_dir.display(),
            buffer.dir = %buffer_dir.display(),
            target = %request.target,
            "Session started"
        );

        let run = SessionRun {
            inner: self.inner.clone(),
            tokens,
            label: request.label,
            session_dir,
            buffer_dir,
            target: CaptureTarget {
                target: request.target,
                auth_token: request.auth_token,
            },
            started_at: now,
        };
        tokio::spawn(run.run().instrument(span));

        Ok(id)
    }

    /// `Live -> Draining -> Idle`. Returns the ended session's summary.
    ///
    /// Waits up to the drain timeout for a natural end, then hard-stops.
    pub async fn stop_session(&self) -> Option<SessionSummary> {
        let tokens = lock(&self.inner.active).clone()?;

        self.inner.state.send_if_modified(|state| {
            if *state == SessionState::Live {
                *state = SessionState::Draining;
                true
            } else {
                false
            }
        });
        info!(session.id = %tokens.id, "Stream ended, draining session");
        tokens.stream_ended.cancel();

        let drain = self.inner.config.pipeline.drain_timeout();
        if tokio::time::timeout(drain, self.wait_for_idle()).await.is_err() {
            warn!(
                session.id = %tokens.id,
                drain_secs = drain.as_secs(),
                "Drain timed out, terminating session"
            );
            tokens.shutdown.cancel();
            self.wait_for_idle().await;
        }

        self.last_summary()
    }

    /// Terminate the live session without draining.
    pub async fn shutdown(&self) -> Option<SessionSummary> {
        let tokens = lock(&self.inner.active).clone()?;
        warn!(session.id = %tokens.id, "Hard shutdown of session");
        tokens.stream_ended.cancel();
        tokens.shutdown.cancel();
        self.wait_for_idle().await;
        self.last_summary()
    }

    /// Resolve once no session is running.
    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.state.subscribe();
        // The sender lives in `inner`, so this only ends by matching.
        let _ = rx.wait_for(|state| *state == SessionState::Idle).await;
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Everything one session's orchestration task owns.
struct SessionRun {
    inner: Arc<Inner>,
    tokens: SessionTokens,
    label: String,
    session_dir: PathBuf,
    buffer_dir: PathBuf,
    target: CaptureTarget,
    started_at: chrono::DateTime<Local>,
}

impl SessionRun {
    async fn run(self) {
        let config = &self.inner.config;

        // Events for this session only; the forwarder is joined before Idle.
        let (events, mut events_rx) = mpsc::channel::<SessionEvent>(16);
        let publisher = self.inner.publisher.clone();
        let forwarder = tokio::spawn(
            async move {
                while let Some(event) = events_rx.recv().await {
                    match event {
                        SessionEvent::RecordingFinished(rec) => publisher.recording_finished(&rec).await,
                        SessionEvent::SessionEnded(summary) => publisher.session_ended(&summary).await,
                    }
                }
            }
            .in_current_span(),
        );

        let queue = Arc::new(BufferQueue::new());
        let capture_cancel = self.tokens.shutdown.child_token();
        let transcode_cancel = self.tokens.shutdown.child_token();

        let capture = CaptureStage::new(
            config.capture.clone(),
            config.pipeline.clone(),
            self.buffer_dir.clone(),
            queue.clone(),
            self.target.clone(),
        );
        let transcode = TranscodeStage::new(
            config.transcode.clone(),
            config.relocate.clone(),
            config.downscale.clone(),
            config.pipeline.clone(),
            self.session_dir.clone(),
            queue.clone(),
        );

        let mut capture_task = tokio::spawn(
            capture
                .run(capture_cancel.clone(), self.tokens.stream_ended.clone())
                .in_current_span(),
        );
        let mut transcode_task =
            tokio::spawn(transcode.run(transcode_cancel.clone()).in_current_span());

        let mut capture_result: Option<Result<CaptureOutcome>> = None;
        let mut transcode_result: Option<Result<TranscodeOutcome>> = None;

        while capture_result.is_none() || transcode_result.is_none() {
            tokio::select! {
                joined = &mut capture_task, if capture_result.is_none() => {
                    let result = flatten(joined, Stage::Capture);
                    if let Err(e) = &result {
                        // Queue is closed; transcode drains what was captured.
                        error!(error = %e, "Capture stage failed, draining what was recorded");
                    }
                    self.inner.state.send_if_modified(|state| {
                        if *state == SessionState::Live {
                            *state = SessionState::Draining;
                            true
                        } else {
                            false
                        }
                    });
                    capture_result = Some(result);
                }
                joined = &mut transcode_task, if transcode_result.is_none() => {
                    let result = flatten(joined, Stage::Transcode);
                    if let Err(e) = &result {
                        if e.is_fatal() && capture_result.is_none() {
                            error!(error = %e, "Transcode stage failed, stopping capture");
                            capture_cancel.cancel();
                        }
                    }
                    transcode_result = Some(result);
                }
            }
        }

        let leftover = queue.drain();
        if !leftover.is_empty() {
            warn!(
                count = leftover.len(),
                first = %leftover[0].path.display(),
                "Buffer files were never transcoded, kept for manual recovery"
            );
        }

        let (capture_result, transcode_result) = match (capture_result, transcode_result) {
            (Some(c), Some(t)) => (c, t),
            _ => return,
        };
        let summary = self.summarize(&capture_result, &transcode_result);

        if let Ok(TranscodeOutcome::Finished(recording)) = transcode_result {
            let _ = events.send(SessionEvent::RecordingFinished(recording)).await;
        }
        let _ = events.send(SessionEvent::SessionEnded(summary.clone())).await;
        drop(events);
        if let Err(e) = forwarder.await {
            error!(error = %e, "Publisher task panicked");
        }

        info!(end = ?summary.end, buffers = summary.buffers, "Session over");

        *lock(&self.inner.last_summary) = Some(summary);
        *lock(&self.inner.active) = None;
        self.inner.active_dir.send_replace(None);
        self.inner.state.send_replace(SessionState::Idle);
    }

    fn summarize(
        &self,
        capture: &Result<CaptureOutcome>,
        transcode: &Result<TranscodeOutcome>,
    ) -> SessionSummary {
        let buffers = match capture {
            Ok(CaptureOutcome::Ended { buffers }) | Ok(CaptureOutcome::Cancelled { buffers }) => {
                *buffers
            }
            Err(_) => std::fs::read_dir(&self.buffer_dir)
                .map(|entries| entries.count() as u64)
                .unwrap_or(0),
        };

        let fatal = [
            capture.as_ref().err(),
            transcode.as_ref().err().filter(|e| e.is_fatal()),
        ]
        .into_iter()
        .flatten()
        .map(|e| e.to_string())
        .collect::<Vec<_>>();

        let end = if !fatal.is_empty() {
            SessionEnd::Failed {
                reason: fatal.join("; "),
            }
        } else if matches!(transcode, Ok(TranscodeOutcome::Cancelled { .. }))
            || matches!(capture, Ok(CaptureOutcome::Cancelled { .. }))
        {
            SessionEnd::Aborted
        } else {
            if let Err(e) = transcode {
                error!(error = %e, "Finalize failed, result left in place");
            }
            SessionEnd::Completed
        };

        SessionSummary {
            id: self.tokens.id,
            label: self.label.clone(),
            started_at: self.started_at,
            ended_at: Local::now(),
            session_dir: self.session_dir.clone(),
            buffers,
            end,
        }
    }
}

fn flatten<T>(
    joined: std::result::Result<Result<T>, tokio::task::JoinError>,
    stage: Stage,
) -> Result<T> {
    match joined {
        Ok(result) => result,
        Err(e) => Err(PipelineError::FatalProcessFailure {
            stage,
            reason: format!("stage task panicked: {}", e),
        }),
    }
}
