//! Transcode stage: tails buffer files in order into the transcode tool.
//!
//! The [`ReadCursor`] is the only state that survives a tool restart. It
//! counts bytes written into the tool's stdin pipe. Bytes the pipe accepted
//! but the tool never read are still sitting in the kernel when the tool
//! dies; on Linux the stage asks the pipe how many there are and rewinds the
//! cursor over them, so the next attempt starts with them. Elsewhere they are
//! reported as lost. Bytes the tool did read before dying are gone with the
//! tool's own state and are not replayed.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tapeconf::{render_args, DownscaleConfig, PipelineConfig, RelocateConfig, TranscodeConfig};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::buffer_queue::{BufferFile, BufferQueue, Dequeue};
use crate::error::{PipelineError, Result};
use crate::finalize::{self, FinishedRecording};
use crate::layout;
use crate::supervisor::{
    ExitClass, ProcessSpec, RestartDecision, RestartTracker, Stage, SupervisedProcess,
};

/// Most recent bytes remembered for rewinding. Larger than any pipe buffer
/// the kernel hands out by default.
const IN_FLIGHT_LIMIT: u64 = 1024 * 1024;

/// A contiguous run of bytes written from one buffer file.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Span {
    file: BufferFile,
    start: u64,
    len: u64,
}

/// How far into the buffer sequence the transcode tool has been fed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadCursor {
    pub file: Option<BufferFile>,
    /// Bytes of `file` written to the tool.
    pub offset: u64,
    /// Bytes written across all files this session, net of rewinds.
    pub forwarded: u64,
    /// Files already taken off the queue that come after `file`.
    ahead: VecDeque<BufferFile>,
    /// Tail of what the current attempt was sent, oldest first.
    in_flight: VecDeque<Span>,
    in_flight_bytes: u64,
}

impl ReadCursor {
    fn advance_to(&mut self, file: BufferFile) {
        debug!(buffer.index = file.index, buffer.path = %file.path.display(), "Cursor advanced");
        self.file = Some(file);
        self.offset = 0;
    }

    fn index(&self) -> Option<u64> {
        self.file.as_ref().map(|f| f.index)
    }

    /// Forget what earlier attempts were sent.
    fn begin_attempt(&mut self) {
        self.in_flight.clear();
        self.in_flight_bytes = 0;
    }

    /// Bytes the current attempt was sent that [`rewind`](Self::rewind) can
    /// still take back.
    pub fn in_flight_bytes(&self) -> u64 {
        self.in_flight_bytes
    }

    fn record_write(&mut self, accepted: u64) {
        let Some(file) = &self.file else { return };
        let start = self.offset;
        self.offset += accepted;
        self.forwarded += accepted;

        match self.in_flight.back_mut() {
            Some(last) if last.file.index == file.index && last.start + last.len == start => {
                last.len += accepted;
            }
            _ => self.in_flight.push_back(Span {
                file: file.clone(),
                start,
                len: accepted,
            }),
        }
        self.in_flight_bytes += accepted;

        while self.in_flight_bytes > IN_FLIGHT_LIMIT {
            let Some(front) = self.in_flight.front_mut() else { break };
            let excess = (self.in_flight_bytes - IN_FLIGHT_LIMIT).min(front.len);
            front.start += excess;
            front.len -= excess;
            self.in_flight_bytes -= excess;
            if front.len == 0 {
                self.in_flight.pop_front();
            }
        }
    }

    /// Move the cursor back over the last `bytes` written, possibly into
    /// earlier files. Returns how many bytes were actually taken back, which
    /// is less than asked only when the history does not reach that far.
    pub fn rewind(&mut self, bytes: u64) -> u64 {
        let mut left = bytes;
        while left > 0 {
            let Some(span) = self.in_flight.back_mut() else { break };
            if self.file.as_ref().map(|f| f.index) != Some(span.file.index) {
                if let Some(current) = self.file.take() {
                    self.ahead.push_front(current);
                }
                self.file = Some(span.file.clone());
                self.offset = span.start + span.len;
            }
            let take = span.len.min(left);
            span.len -= take;
            self.offset -= take;
            left -= take;
            if span.len == 0 {
                self.in_flight.pop_back();
            }
        }
        let rewound = bytes - left;
        self.in_flight_bytes -= rewound;
        self.forwarded -= rewound;
        rewound
    }
}

/// Timing for the tail loop.
#[derive(Debug, Clone, Copy)]
pub struct TailSettings {
    pub poll_interval: Duration,
    pub stability_window: Duration,
    pub chunk_bytes: usize,
}

impl From<&PipelineConfig> for TailSettings {
    fn from(cfg: &PipelineConfig) -> Self {
        Self {
            poll_interval: cfg.poll_interval(),
            stability_window: cfg.stability_window(),
            chunk_bytes: cfg.read_chunk_bytes.max(4096),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum FeedEnd {
    /// Queue closed, last file stable, nothing left to forward.
    Exhausted,
    Cancelled,
}

#[derive(Debug)]
pub enum FeedError {
    /// Reading a buffer file failed. Fatal for the session.
    Source(PipelineError),
    /// The tool stopped accepting input; it has most likely died.
    Sink(std::io::Error),
}

/// Forward buffer bytes from `cursor` into `sink` until the input is exhausted.
///
/// Cancel safe with respect to the cursor: it only moves after a write
/// completes, so dropping this future at any await leaves it matching what
/// the sink accepted.
pub async fn feed<W>(
    cursor: &mut ReadCursor,
    queue: &BufferQueue,
    sink: &mut W,
    settings: TailSettings,
    cancel: &CancellationToken,
) -> std::result::Result<FeedEnd, FeedError>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; settings.chunk_bytes];
    let mut reader: Option<File> = None;
    let mut last_growth = Instant::now();
    let mut closed_seen = false;

    loop {
        let Some(file) = cursor.file.clone() else {
            match queue.dequeue(settings.poll_interval, cancel).await {
                Dequeue::Item(next) => {
                    cursor.advance_to(next);
                    reader = None;
                    last_growth = Instant::now();
                }
                Dequeue::Empty => {}
                Dequeue::Closed => return Ok(FeedEnd::Exhausted),
                Dequeue::Cancelled => return Ok(FeedEnd::Cancelled),
            }
            continue;
        };

        if reader.is_none() {
            reader = open_at(&file, cursor.offset).await.map_err(FeedError::Source)?;
        }

        let n = match reader.as_mut() {
            Some(r) => r
                .read(&mut buf)
                .await
                .map_err(|e| FeedError::Source(PipelineError::io(&file.path, e)))?,
            // Not on disk yet: the capture side has not written anything.
            None => 0,
        };

        if n > 0 {
            last_growth = Instant::now();
            let mut written = 0;
            while written < n {
                let accepted = sink
                    .write(&buf[written..n])
                    .await
                    .map_err(FeedError::Sink)?;
                if accepted == 0 {
                    return Err(FeedError::Sink(std::io::ErrorKind::WriteZero.into()));
                }
                written += accepted;
                cursor.record_write(accepted as u64);
            }
            continue;
        }

        // A successor or a close is only trusted after one more empty read
        // that started after we observed it; capture seals a file first.
        if let Some(next) = cursor.ahead.pop_front() {
            debug!(
                buffer.index = file.index,
                bytes = cursor.offset,
                "Buffer exhausted, moving to next"
            );
            cursor.advance_to(next);
            reader = None;
            last_growth = Instant::now();
            continue;
        }
        if closed_seen {
            sink.flush().await.map_err(FeedError::Sink)?;
            return Ok(FeedEnd::Exhausted);
        }

        if last_growth.elapsed() >= settings.stability_window {
            match queue.try_dequeue() {
                Dequeue::Item(next) => {
                    cursor.ahead.push_back(next);
                    continue;
                }
                Dequeue::Closed => {
                    closed_seen = true;
                    continue;
                }
                Dequeue::Empty | Dequeue::Cancelled => {}
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return Ok(FeedEnd::Cancelled),
            _ = tokio::time::sleep(settings.poll_interval) => {}
        }
    }
}

/// Open `file` positioned at `offset`; `None` if it does not exist yet.
async fn open_at(file: &BufferFile, offset: u64) -> Result<Option<File>> {
    let mut handle = match File::open(&file.path).await {
        Ok(handle) => handle,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(PipelineError::io(&file.path, e)),
    };
    handle
        .seek(SeekFrom::Start(offset))
        .await
        .map_err(|e| PipelineError::io(&file.path, e))?;
    Ok(Some(handle))
}

#[derive(Debug)]
pub enum TranscodeOutcome {
    Finished(FinishedRecording),
    /// Capture closed the queue without ever producing a buffer.
    NoInput,
    Cancelled { cursor: ReadCursor },
}

pub struct TranscodeStage {
    config: TranscodeConfig,
    relocate: RelocateConfig,
    downscale: DownscaleConfig,
    pipeline: PipelineConfig,
    session_dir: PathBuf,
    queue: Arc<BufferQueue>,
    result_dir: Option<PathBuf>,
    cursor: ReadCursor,
}

impl TranscodeStage {
    pub fn new(
        config: TranscodeConfig,
        relocate: RelocateConfig,
        downscale: DownscaleConfig,
        pipeline: PipelineConfig,
        session_dir: PathBuf,
        queue: Arc<BufferQueue>,
    ) -> Self {
        Self {
            config,
            relocate,
            downscale,
            pipeline,
            session_dir,
            queue,
            result_dir: None,
            cursor: ReadCursor::default(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) -> Result<TranscodeOutcome> {
        let result = self.attempts(&shutdown).await;
        match &result {
            Ok(TranscodeOutcome::Finished(rec)) => info!(
                result.dir = %rec.dir.display(),
                segments = rec.segments.len(),
                flagged = rec.flagged.len(),
                forwarded = self.cursor.forwarded,
                "Transcode finished"
            ),
            Ok(outcome) => info!(outcome = ?outcome, "Transcode stopped"),
            Err(e) => error!(
                error = %e,
                buffer.index = ?self.cursor.index(),
                offset = self.cursor.offset,
                "Transcode failed"
            ),
        }
        result
    }

    async fn attempts(&mut self, shutdown: &CancellationToken) -> Result<TranscodeOutcome> {
        let settings = TailSettings::from(&self.pipeline);
        let grace = self.pipeline.shutdown_grace();
        let mut tracker = RestartTracker::new(Stage::Transcode, self.pipeline.max_restarts);

        // Hold off spawning the tool until there is something to feed it.
        while self.cursor.file.is_none() {
            match self.queue.dequeue(settings.poll_interval, shutdown).await {
                Dequeue::Item(first) => self.cursor.advance_to(first),
                Dequeue::Empty => {}
                Dequeue::Closed => return Ok(TranscodeOutcome::NoInput),
                Dequeue::Cancelled => {
                    return Ok(TranscodeOutcome::Cancelled {
                        cursor: self.cursor.clone(),
                    })
                }
            }
        }

        let result_dir = self.ensure_result_dir()?;

        loop {
            if tracker.exhausted() {
                return Err(tracker.fatal_error());
            }

            let attempt = tracker.crashes() + 1;
            let spec = self.process_spec(&result_dir, attempt);
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

            let Some(mut stdin) = process.take_stdin() else {
                process.terminate(grace).await;
                return Err(PipelineError::FatalProcessFailure {
                    stage: Stage::Transcode,
                    reason: "tool stdin was not piped".to_string(),
                });
            };

            self.cursor.begin_attempt();
            info!(
                attempt,
                buffer.index = ?self.cursor.index(),
                offset = self.cursor.offset,
                "Feeding transcode tool"
            );

            let fed = tokio::select! {
                fed = feed(&mut self.cursor, &self.queue, &mut stdin, settings, shutdown) => Some(fed),
                _ = process.wait_exit() => None,
            };

            let crash_reason = match fed {
                Some(Ok(FeedEnd::Exhausted)) => {
                    // Closing stdin tells the tool no more input is coming.
                    drop(stdin);
                    return self.finish(process, &result_dir, shutdown).await;
                }
                Some(Ok(FeedEnd::Cancelled)) => {
                    drop(stdin);
                    process.terminate(grace).await;
                    return Ok(TranscodeOutcome::Cancelled {
                        cursor: self.cursor.clone(),
                    });
                }
                Some(Err(FeedError::Source(e))) => {
                    drop(stdin);
                    process.terminate(grace).await;
                    return Err(e);
                }
                Some(Err(FeedError::Sink(e))) => {
                    let exit = match tokio::time::timeout(grace, process.wait_exit()).await {
                        Ok(exit) => exit,
                        Err(_) => process.terminate(grace).await,
                    };
                    self.reclaim_unread(&stdin);
                    drop(stdin);
                    format!("stdin write failed ({}), {}", e, describe(&exit))
                }
                None => {
                    let exit = process.wait_exit().await;
                    self.reclaim_unread(&stdin);
                    drop(stdin);
                    format!("exited mid-stream, {}", describe(&exit))
                }
            };

            warn!(
                attempt,
                buffer.index = ?self.cursor.index(),
                offset = self.cursor.offset,
                reason = %crash_reason,
                "Transcode tool crashed, resuming from cursor"
            );
            if tracker.record_crash(&crash_reason) == RestartDecision::Fatal {
                return Err(tracker.fatal_error());
            }
        }
    }

    async fn finish(
        &mut self,
        mut process: SupervisedProcess,
        result_dir: &Path,
        shutdown: &CancellationToken,
    ) -> Result<TranscodeOutcome> {
        info!(forwarded = self.cursor.forwarded, "Input exhausted, waiting for transcode tool");

        match process.wait(shutdown, self.pipeline.shutdown_grace()).await {
            ExitClass::CleanExit { code } => {
                debug!(exit.code = code, "Transcode tool exited cleanly");
            }
            ExitClass::CrashExit { code, reason } => {
                // Segments written so far are still worth keeping.
                warn!(exit.code = code, %reason, "Transcode tool exited uncleanly at end of input");
            }
            ExitClass::Killed => {
                return Ok(TranscodeOutcome::Cancelled {
                    cursor: self.cursor.clone(),
                });
            }
        }

        let recording = finalize::finalize(
            result_dir,
            &self.config.segment_extension,
            &self.relocate,
            &self.downscale,
            shutdown,
        )
        .await?;
        Ok(TranscodeOutcome::Finished(recording))
    }

    /// Take back bytes still queued in the dead tool's stdin pipe.
    ///
    /// Must run after the tool has exited and before `stdin` is dropped,
    /// while the pipe still holds what nobody read.
    fn reclaim_unread(&mut self, stdin: &ChildStdin) {
        let sent = self.cursor.in_flight_bytes();
        match pipe_unread(stdin) {
            Some(0) => {}
            Some(unread) => {
                let rewound = self.cursor.rewind(unread);
                info!(
                    unread,
                    rewound,
                    buffer.index = ?self.cursor.index(),
                    offset = self.cursor.offset,
                    "Rewound cursor over input the tool never read"
                );
                if rewound < unread {
                    warn!(lost = unread - rewound, "Unread input exceeds rewind history");
                }
            }
            None => warn!(
                up_to = sent,
                "Cannot measure unread pipe input, bytes after the tool's last read are lost"
            ),
        }
    }

    fn ensure_result_dir(&mut self) -> Result<PathBuf> {
        if let Some(dir) = &self.result_dir {
            return Ok(dir.clone());
        }
        let dir = layout::create_result_dir(&self.session_dir, chrono::Local::now())?;
        info!(result.dir = %dir.display(), "Result directory created");
        self.result_dir = Some(dir.clone());
        Ok(dir)
    }

    fn process_spec(&self, result_dir: &Path, attempt: u32) -> ProcessSpec {
        let output = self
            .config
            .output_pattern
            .replace("{attempt}", &attempt.to_string());
        let segment_seconds = self.config.segment_seconds.to_string();
        let args = render_args(
            &self.config.args,
            &[
                ("segment_seconds", segment_seconds.as_str()),
                ("output", output.as_str()),
            ],
        );
        ProcessSpec::new(Stage::Transcode, &self.config.program, args)
            .clean_exit_codes(&self.config.clean_exit_codes)
            .cwd(result_dir)
            .pipe_stdin()
    }
}

#[cfg(target_os = "linux")]
mod pipe {
    nix::ioctl_read_bad!(unread_bytes, nix::libc::FIONREAD, nix::libc::c_int);
}

/// Bytes sitting in the pipe behind `stdin` that no reader has consumed.
#[cfg(target_os = "linux")]
fn pipe_unread(stdin: &ChildStdin) -> Option<u64> {
    use std::os::fd::AsRawFd;

    let mut unread: nix::libc::c_int = 0;
    // SAFETY: the descriptor is owned by `stdin`, which outlives the call,
    // and FIONREAD writes exactly one c_int through the pointer.
    match unsafe { pipe::unread_bytes(stdin.as_raw_fd(), &mut unread) } {
        Ok(_) => Some(unread.max(0) as u64),
        Err(e) => {
            debug!(error = %e, "FIONREAD on transcode stdin failed");
            None
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pipe_unread(_stdin: &ChildStdin) -> Option<u64> {
    None
}

fn describe(exit: &ExitClass) -> String {
    match exit {
        ExitClass::CleanExit { code } => format!("exit code {} before end of input", code),
        ExitClass::CrashExit { reason, .. } => reason.clone(),
        ExitClass::Killed => "killed".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    fn settings() -> TailSettings {
        TailSettings {
            poll_interval: Duration::from_millis(5),
            stability_window: Duration::from_millis(30),
            chunk_bytes: 1024,
        }
    }

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    /// Accepts up to `budget` bytes, then fails like a dead pipe.
    struct DyingSink {
        budget: usize,
        received: Vec<u8>,
    }

    impl AsyncWrite for DyingSink {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            if self.budget == 0 {
                return Poll::Ready(Err(std::io::ErrorKind::BrokenPipe.into()));
            }
            let n = buf.len().min(self.budget);
            self.budget -= n;
            self.received.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    fn write_buffer(dir: &std::path::Path, index: u64, bytes: &[u8]) -> BufferFile {
        let path = dir.join(layout::buffer_file_name(index, "ts"));
        std::fs::write(&path, bytes).unwrap();
        BufferFile { index, path }
    }

    #[tokio::test]
    async fn test_resume_from_crash_offset() {
        let tmp = tempfile::tempdir().unwrap();
        let data = pattern(10_000, 7);
        let queue = BufferQueue::new();
        queue.enqueue(write_buffer(tmp.path(), 0, &data)).unwrap();
        queue.close_for_adding();
        let cancel = CancellationToken::new();

        let mut cursor = ReadCursor::default();
        let mut dying = DyingSink {
            budget: 4096,
            received: Vec::new(),
        };
        let first = feed(&mut cursor, &queue, &mut dying, settings(), &cancel).await;
        assert!(matches!(first, Err(FeedError::Sink(_))));
        assert_eq!(cursor.offset, 4096);
        assert_eq!(cursor.index(), Some(0));

        let mut restarted: Vec<u8> = Vec::new();
        let second = feed(&mut cursor, &queue, &mut restarted, settings(), &cancel)
            .await
            .unwrap();
        assert_eq!(second, FeedEnd::Exhausted);
        assert_eq!(restarted.len(), 10_000 - 4096);
        assert_eq!(&restarted[..], &data[4096..]);

        let mut whole = dying.received;
        whole.extend_from_slice(&restarted);
        assert_eq!(whole, data);
        assert_eq!(cursor.forwarded, 10_000);
    }

    #[tokio::test]
    async fn test_repeated_crashes_concatenate_exactly() {
        let tmp = tempfile::tempdir().unwrap();
        let files: Vec<Vec<u8>> = vec![pattern(3000, 1), pattern(0, 2), pattern(5000, 3)];
        let queue = BufferQueue::new();
        for (i, body) in files.iter().enumerate() {
            queue.enqueue(write_buffer(tmp.path(), i as u64, body)).unwrap();
        }
        queue.close_for_adding();
        let cancel = CancellationToken::new();

        let mut cursor = ReadCursor::default();
        let mut output = Vec::new();
        // Budgets chosen to die mid-chunk, on a file boundary, and inside the last file.
        for budget in [1000, 2000, 777, 1] {
            let mut sink = DyingSink {
                budget,
                received: Vec::new(),
            };
            let res = feed(&mut cursor, &queue, &mut sink, settings(), &cancel).await;
            assert!(matches!(res, Err(FeedError::Sink(_))));
            output.extend_from_slice(&sink.received);
        }
        let mut tail = Vec::new();
        assert_eq!(
            feed(&mut cursor, &queue, &mut tail, settings(), &cancel)
                .await
                .unwrap(),
            FeedEnd::Exhausted
        );
        output.extend_from_slice(&tail);

        assert_eq!(output, files.concat());
    }

    #[tokio::test]
    async fn test_zero_byte_file_exhausts_after_close() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = BufferQueue::new();
        queue.enqueue(write_buffer(tmp.path(), 0, b"")).unwrap();
        queue.close_for_adding();

        let mut cursor = ReadCursor::default();
        let mut sink = Vec::new();
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            feed(&mut cursor, &queue, &mut sink, settings(), &CancellationToken::new()),
        )
        .await
        .expect("zero-byte buffer must not block forever")
        .unwrap();

        assert_eq!(res, FeedEnd::Exhausted);
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_tails_growing_file_until_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(BufferQueue::new());
        let first = write_buffer(tmp.path(), 0, b"");
        queue.enqueue(first.clone()).unwrap();

        let writer = {
            let queue = queue.clone();
            let dir = tmp.path().to_path_buf();
            let first = first.path.clone();
            tokio::spawn(async move {
                use std::io::Write;
                let mut f = std::fs::OpenOptions::new().append(true).open(&first).unwrap();
                for chunk in [b"alpha-".as_slice(), b"beta-", b"gamma-"] {
                    // Shorter than the stability window: the reader must wait, not move on.
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    f.write_all(chunk).unwrap();
                }
                let second = write_buffer(&dir, 1, b"delta");
                queue.enqueue(second).unwrap();
                queue.close_for_adding();
            })
        };

        let mut cursor = ReadCursor::default();
        let mut sink = Vec::new();
        let res = feed(&mut cursor, &queue, &mut sink, settings(), &CancellationToken::new())
            .await
            .unwrap();
        writer.await.unwrap();

        assert_eq!(res, FeedEnd::Exhausted);
        assert_eq!(sink, b"alpha-beta-gamma-delta");
        assert_eq!(cursor.index(), Some(1));
    }

    #[tokio::test]
    async fn test_missing_file_waits_instead_of_failing() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = Arc::new(BufferQueue::new());
        let path = tmp.path().join("buffer0.ts");
        queue
            .enqueue(BufferFile {
                index: 0,
                path: path.clone(),
            })
            .unwrap();

        let creator = {
            let queue = queue.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                std::fs::write(&path, b"late").unwrap();
                queue.close_for_adding();
            })
        };

        let mut cursor = ReadCursor::default();
        let mut sink = Vec::new();
        feed(&mut cursor, &queue, &mut sink, settings(), &CancellationToken::new())
            .await
            .unwrap();
        creator.await.unwrap();
        assert_eq!(sink, b"late");
    }

    #[tokio::test]
    async fn test_cancel_stops_tailing() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = BufferQueue::new();
        queue.enqueue(write_buffer(tmp.path(), 0, b"abc")).unwrap();
        let cancel = CancellationToken::new();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let mut cursor = ReadCursor::default();
        let mut sink = Vec::new();
        let res = feed(&mut cursor, &queue, &mut sink, settings(), &cancel)
            .await
            .unwrap();
        assert_eq!(res, FeedEnd::Cancelled);
        assert_eq!(cursor.offset, 3);
    }

    #[tokio::test]
    async fn test_rewind_replays_unread_tail_across_files() {
        let tmp = tempfile::tempdir().unwrap();
        let files = [pattern(3000, 4), pattern(2000, 9)];
        let queue = BufferQueue::new();
        for (i, body) in files.iter().enumerate() {
            queue.enqueue(write_buffer(tmp.path(), i as u64, body)).unwrap();
        }
        queue.close_for_adding();
        let cancel = CancellationToken::new();

        let mut cursor = ReadCursor::default();
        let mut first = Vec::new();
        feed(&mut cursor, &queue, &mut first, settings(), &cancel)
            .await
            .unwrap();
        assert_eq!(cursor.index(), Some(1));
        assert_eq!(cursor.forwarded, 5000);

        // The tool only got through 2500 bytes before dying.
        assert_eq!(cursor.rewind(2500), 2500);
        assert_eq!(cursor.index(), Some(0));
        assert_eq!(cursor.offset, 2500);
        assert_eq!(cursor.forwarded, 2500);

        let mut replay = Vec::new();
        assert_eq!(
            feed(&mut cursor, &queue, &mut replay, settings(), &cancel)
                .await
                .unwrap(),
            FeedEnd::Exhausted
        );
        let mut whole = first[..2500].to_vec();
        whole.extend_from_slice(&replay);
        assert_eq!(whole, files.concat());
        assert_eq!(cursor.forwarded, 5000);
    }

    #[test]
    fn test_rewind_is_bounded_by_history() {
        let mut cursor = ReadCursor::default();
        cursor.advance_to(BufferFile {
            index: 0,
            path: PathBuf::from("buffer0.ts"),
        });
        cursor.record_write(IN_FLIGHT_LIMIT);
        cursor.record_write(IN_FLIGHT_LIMIT);
        assert_eq!(cursor.in_flight_bytes(), IN_FLIGHT_LIMIT);

        assert_eq!(cursor.rewind(3 * IN_FLIGHT_LIMIT), IN_FLIGHT_LIMIT);
        assert_eq!(cursor.offset, IN_FLIGHT_LIMIT);
        assert_eq!(cursor.forwarded, IN_FLIGHT_LIMIT);

        cursor.record_write(10);
        cursor.begin_attempt();
        assert_eq!(cursor.rewind(10), 0, "a new attempt cannot take back older input");
    }

    #[tokio::test]
    async fn test_zero_poll_interval_still_finishes() {
        let tmp = tempfile::tempdir().unwrap();
        let queue = BufferQueue::new();
        queue.enqueue(write_buffer(tmp.path(), 0, b"abc")).unwrap();
        queue.close_for_adding();

        let tight = TailSettings {
            poll_interval: Duration::ZERO,
            ..settings()
        };
        let mut cursor = ReadCursor::default();
        let mut sink = Vec::new();
        let res = tokio::time::timeout(
            Duration::from_secs(5),
            feed(&mut cursor, &queue, &mut sink, tight, &CancellationToken::new()),
        )
        .await
        .expect("idle time must accrue without a poll interval")
        .unwrap();
        assert_eq!(res, FeedEnd::Exhausted);
        assert_eq!(sink, b"abc");
    }
}
