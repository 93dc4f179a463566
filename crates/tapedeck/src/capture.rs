//! Capture stage: runs the capture tool and spools its stdout to disk.
//!
//! Every attempt gets a fresh `buffer{N}` file, enqueued before the tool
//! starts so the transcode stage can begin tailing immediately. A file is
//! sealed (copy finished, fsynced) before its successor is created.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tapeconf::{render_args, CaptureConfig, PipelineConfig};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdout;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::buffer_queue::{BufferFile, BufferQueue};
use crate::error::{PipelineError, Result};
use crate::layout;
use crate::supervisor::{
    ExitClass, ProcessSpec, RestartDecision, RestartTracker, Stage, SupervisedProcess,
};

/// What the capture tool is pointed at for this session.
#[derive(Debug, Clone)]
pub struct CaptureTarget {
    pub target: String,
    pub auth_token: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// The tool reported a normal end of stream, or the stream was declared over.
    Ended { buffers: u64 },
    /// Hard shutdown interrupted the capture.
    Cancelled { buffers: u64 },
}

pub struct CaptureStage {
    config: CaptureConfig,
    pipeline: PipelineConfig,
    buffer_dir: PathBuf,
    queue: Arc<BufferQueue>,
    target: CaptureTarget,
    next_index: u64,
}

type CopyTask = JoinHandle<Result<u64>>;

impl CaptureStage {
    pub fn new(
        config: CaptureConfig,
        pipeline: PipelineConfig,
        buffer_dir: PathBuf,
        queue: Arc<BufferQueue>,
        target: CaptureTarget,
    ) -> Self {
        Self {
            config,
            pipeline,
            buffer_dir,
            queue,
            target,
            next_index: 0,
        }
    }

    /// Run until the stream ends, the restart bound is hit, or `shutdown` fires.
    ///
    /// `stream_ended` stops further restarts but lets the running attempt
    /// finish on its own. The queue is always closed for adding on return.
    pub async fn run(
        mut self,
        shutdown: CancellationToken,
        stream_ended: CancellationToken,
    ) -> Result<CaptureOutcome> {
        let mut pending: Option<CopyTask> = None;
        let result = self.attempts(&shutdown, &stream_ended, &mut pending).await;

        self.queue.close_for_adding();

        // Only reached with a copy in flight after a hard shutdown.
        if let Some(task) = pending.take() {
            let grace = self.pipeline.copy_flush_grace();
            match tokio::time::timeout(grace, task).await {
                Ok(Ok(Ok(bytes))) => info!(bytes, "Final buffer flushed after shutdown"),
                Ok(Ok(Err(e))) => error!(error = %e, "Final buffer copy failed"),
                Ok(Err(e)) => error!(error = %e, "Final buffer copy task panicked"),
                Err(_) => warn!(
                    grace_secs = grace.as_secs(),
                    "Final buffer copy did not finish in time, tail of capture dropped"
                ),
            }
        }

        match &result {
            Ok(outcome) => info!(outcome = ?outcome, "Capture finished"),
            Err(e) => error!(error = %e, "Capture failed"),
        }
        result
    }

    async fn attempts(
        &mut self,
        shutdown: &CancellationToken,
        stream_ended: &CancellationToken,
        pending: &mut Option<CopyTask>,
    ) -> Result<CaptureOutcome> {
        let mut tracker = RestartTracker::new(Stage::Capture, self.pipeline.max_restarts);
        let grace = self.pipeline.shutdown_grace();

        loop {
            if shutdown.is_cancelled() {
                return Ok(CaptureOutcome::Cancelled {
                    buffers: self.next_index,
                });
            }
            if stream_ended.is_cancelled() {
                return Ok(CaptureOutcome::Ended {
                    buffers: self.next_index,
                });
            }
            if tracker.exhausted() {
                return Err(tracker.fatal_error());
            }

            let buffer = self.open_next_buffer().await?;
            let attempt = tracker.crashes() + 1;

            let spec = self.process_spec();
            let mut process = match SupervisedProcess::spawn(&spec, attempt) {
                Ok(process) => process,
                Err(PipelineError::TransientProcessCrash { reason, .. }) => {
                    if tracker.record_crash(&reason) == RestartDecision::Fatal {
                        return Err(tracker.fatal_error());
                    }
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Some(stdout) = process.take_stdout() {
                let path = buffer.path.clone();
                let chunk = self.pipeline.read_chunk_bytes;
                *pending = Some(tokio::spawn(async move {
                    spool_to_file(stdout, &path, chunk).await
                }));
            }

            let exit = process.wait(shutdown, grace).await;

            // A killed attempt leaves its copy pending for the shutdown grace in `run`.
            if exit != ExitClass::Killed {
                let bytes = self.seal(pending, &buffer).await?;
                info!(
                    buffer.index = buffer.index,
                    buffer.path = %buffer.path.display(),
                    bytes,
                    exit = ?exit,
                    "Buffer sealed"
                );
            }

            match exit {
                ExitClass::Killed => {
                    return Ok(CaptureOutcome::Cancelled {
                        buffers: self.next_index,
                    });
                }
                ExitClass::CleanExit { code } => {
                    info!(exit.code = code, "Capture tool reported end of stream");
                    return Ok(CaptureOutcome::Ended {
                        buffers: self.next_index,
                    });
                }
                ExitClass::CrashExit { code, reason } => {
                    if stream_ended.is_cancelled() {
                        info!(exit.code = code, "Capture tool exited after stream end, not restarting");
                        return Ok(CaptureOutcome::Ended {
                            buffers: self.next_index,
                        });
                    }
                    warn!(
                        attempt,
                        exit.code = code,
                        buffer.index = buffer.index,
                        %reason,
                        "Capture tool crashed"
                    );
                    if tracker.record_crash(&reason) == RestartDecision::Fatal {
                        return Err(tracker.fatal_error());
                    }
                }
            }
        }
    }

    /// Create the next empty buffer file and publish it to the consumer.
    async fn open_next_buffer(&mut self) -> Result<BufferFile> {
        let index = self.next_index;
        let path = self
            .buffer_dir
            .join(layout::buffer_file_name(index, &self.config.buffer_extension));

        File::create(&path)
            .await
            .map_err(|e| PipelineError::io(&path, e))?;

        let buffer = BufferFile { index, path };
        self.queue.enqueue(buffer.clone())?;
        self.next_index += 1;

        info!(buffer.index = index, buffer.path = %buffer.path.display(), "Buffer opened");
        Ok(buffer)
    }

    /// Wait for the attempt's copy task so the file is complete before the next one exists.
    async fn seal(&self, pending: &mut Option<CopyTask>, buffer: &BufferFile) -> Result<u64> {
        let Some(mut task) = pending.take() else {
            return Ok(0);
        };

        // Stdout closes once every process in the group is gone; a straggler
        // holding it open gets the shutdown grace and is then abandoned.
        let grace = self.pipeline.shutdown_grace();
        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(PipelineError::io(
                &buffer.path,
                std::io::Error::other(format!("copy task failed: {}", e)),
            )),
            Err(_) => {
                warn!(
                    buffer.path = %buffer.path.display(),
                    "Capture output still open after exit, abandoning copy"
                );
                task.abort();
                Ok(0)
            }
        }
    }

    fn process_spec(&self) -> ProcessSpec {
        let args = render_args(
            &self.config.args,
            &[
                ("target", self.target.target.as_str()),
                ("quality", self.config.quality.as_str()),
                ("auth_token", self.target.auth_token.as_str()),
            ],
        );
        ProcessSpec::new(Stage::Capture, &self.config.program, args)
            .clean_exit_codes(&self.config.clean_exit_codes)
            .pipe_stdout()
    }
}

/// Copy the tool's stdout into `path` until EOF, then flush and fsync.
///
/// Write failures are fatal. A read failure on the pipe ends the copy; the
/// process exit decides what happens next.
async fn spool_to_file(mut stdout: ChildStdout, path: &Path, chunk: usize) -> Result<u64> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .await
        .map_err(|e| PipelineError::io(path, e))?;

    let mut buf = vec![0u8; chunk.max(4096)];
    let mut total = 0u64;

    loop {
        let n = match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!(buffer.path = %path.display(), error = %e, "Capture pipe read failed");
                break;
            }
        };
        file.write_all(&buf[..n])
            .await
            .map_err(|e| PipelineError::io(path, e))?;
        // Push each chunk through so the tail reader sees it promptly.
        file.flush().await.map_err(|e| PipelineError::io(path, e))?;
        total += n as u64;
    }

    file.sync_all()
        .await
        .map_err(|e| PipelineError::io(path, e))?;
    Ok(total)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::buffer_queue::Dequeue;

    fn stage(dir: &Path, script: &str, max_restarts: u32) -> (CaptureStage, Arc<BufferQueue>) {
        let queue = Arc::new(BufferQueue::new());
        let config = CaptureConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            clean_exit_codes: vec![0],
            ..Default::default()
        };
        let pipeline = PipelineConfig {
            max_restarts,
            shutdown_grace_secs: 1,
            ..Default::default()
        };
        let target = CaptureTarget {
            target: "https://example.test/live".to_string(),
            auth_token: "token".to_string(),
        };
        let stage = CaptureStage::new(config, pipeline, dir.to_path_buf(), queue.clone(), target);
        (stage, queue)
    }

    fn drain_indices(queue: &BufferQueue) -> Vec<u64> {
        let mut out = Vec::new();
        while let Dequeue::Item(file) = queue.try_dequeue() {
            out.push(file.index);
        }
        out
    }

    #[tokio::test]
    async fn test_clean_exit_single_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, queue) = stage(tmp.path(), "printf 'abc'; exit 0", 5);

        let outcome = stage
            .run(CancellationToken::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, CaptureOutcome::Ended { buffers: 1 });
        assert!(queue.is_closed());
        assert_eq!(drain_indices(&queue), vec![0]);
        assert_eq!(std::fs::read(tmp.path().join("buffer0.ts")).unwrap(), b"abc");
    }

    #[tokio::test]
    async fn test_crashes_produce_consecutive_buffers() {
        let tmp = tempfile::tempdir().unwrap();
        let counter = tmp.path().join("count");
        let script = format!(
            "n=$(cat {c} 2>/dev/null || echo 0); echo $((n+1)) > {c}; printf \"part$n\"; [ $n -ge 2 ] && exit 0; exit 7",
            c = counter.display()
        );
        let (stage, queue) = stage(tmp.path(), &script, 5);

        let outcome = stage
            .run(CancellationToken::new(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, CaptureOutcome::Ended { buffers: 3 });
        assert_eq!(drain_indices(&queue), vec![0, 1, 2]);
        for i in 0..3 {
            let body = std::fs::read_to_string(tmp.path().join(format!("buffer{}.ts", i))).unwrap();
            assert_eq!(body, format!("part{}", i));
        }
    }

    #[tokio::test]
    async fn test_restart_bound_is_fatal_and_closes_queue() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, queue) = stage(tmp.path(), "exit 9", 3);

        let err = stage
            .run(CancellationToken::new(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::FatalProcessFailure { stage: Stage::Capture, .. }
        ));
        assert!(queue.is_closed());
        assert_eq!(drain_indices(&queue), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_stream_ended_stops_restarts() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, queue) = stage(tmp.path(), "sleep 0.2; exit 9", 20);
        let stream_ended = CancellationToken::new();
        stream_ended.cancel();

        // Already ended before the first attempt: nothing is spawned.
        let outcome = stage
            .run(CancellationToken::new(), stream_ended)
            .await
            .unwrap();
        assert_eq!(outcome, CaptureOutcome::Ended { buffers: 0 });
        assert!(queue.is_closed());
    }

    #[tokio::test]
    async fn test_shutdown_kills_and_closes() {
        let tmp = tempfile::tempdir().unwrap();
        let (stage, queue) = stage(tmp.path(), "printf x; exec sleep 30", 5);
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(stage.run(shutdown.clone(), CancellationToken::new()));
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        shutdown.cancel();

        let outcome = handle.await.unwrap().unwrap();
        assert_eq!(outcome, CaptureOutcome::Cancelled { buffers: 1 });
        assert!(queue.is_closed());
    }
}
