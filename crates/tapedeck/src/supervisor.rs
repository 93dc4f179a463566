//! External process supervision.
//!
//! Each attempt spawns one tool in its own process group so termination
//! reaches everything the tool forked, forwards its stderr into tracing,
//! and classifies the exit against an allow-list of "normal end" codes.

use std::fmt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{PipelineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Capture,
    Transcode,
    Relocate,
    Downscale,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Capture => write!(f, "capture"),
            Stage::Transcode => write!(f, "transcode"),
            Stage::Relocate => write!(f, "relocate"),
            Stage::Downscale => write!(f, "downscale"),
        }
    }
}

/// What to run and how to judge its exit.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub stage: Stage,
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub clean_exit_codes: Vec<i32>,
    pub pipe_stdin: bool,
    pub pipe_stdout: bool,
}

impl ProcessSpec {
    pub fn new(stage: Stage, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            stage,
            program: program.into(),
            args,
            cwd: None,
            clean_exit_codes: vec![0],
            pipe_stdin: false,
            pipe_stdout: false,
        }
    }

    pub fn clean_exit_codes(mut self, codes: &[i32]) -> Self {
        self.clean_exit_codes = codes.to_vec();
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn pipe_stdin(mut self) -> Self {
        self.pipe_stdin = true;
        self
    }

    pub fn pipe_stdout(mut self) -> Self {
        self.pipe_stdout = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitClass {
    /// Exit code is in the allow-list: input ended normally.
    CleanExit { code: i32 },
    /// Any other exit, including death by a signal we did not send.
    CrashExit { code: Option<i32>, reason: String },
    /// We terminated it.
    Killed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessState {
    Starting,
    Running,
    Exited(ExitClass),
}

/// Classify a finished process against its clean exit codes.
pub fn classify(status: ExitStatus, clean_exit_codes: &[i32]) -> ExitClass {
    match status.code() {
        Some(code) if clean_exit_codes.contains(&code) => ExitClass::CleanExit { code },
        Some(code) => ExitClass::CrashExit {
            code: Some(code),
            reason: format!("exit code {}", code),
        },
        None => ExitClass::CrashExit {
            code: None,
            reason: describe_signal(status),
        },
    }
}

#[cfg(unix)]
fn describe_signal(status: ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("terminated by signal {}", sig),
        None => "terminated without exit code".to_string(),
    }
}

#[cfg(not(unix))]
fn describe_signal(_status: ExitStatus) -> String {
    "terminated without exit code".to_string()
}

/// One running attempt of an external tool.
pub struct SupervisedProcess {
    stage: Stage,
    attempt: u32,
    child: Child,
    pid: Option<u32>,
    clean_exit_codes: Vec<i32>,
    state: ProcessState,
    stderr_task: Option<JoinHandle<()>>,
}

impl SupervisedProcess {
    /// Spawn one attempt.
    ///
    /// A binary that is missing or not executable is fatal; retrying it
    /// would only burn attempts. Other spawn failures count as a crash.
    pub fn spawn(spec: &ProcessSpec, attempt: u32) -> Result<Self> {
        debug!(stage = %spec.stage, attempt, program = %spec.program, "Starting process");

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .stdin(if spec.pipe_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(if spec.pipe_stdout {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied
                ) =>
            {
                return Err(PipelineError::FatalProcessFailure {
                    stage: spec.stage,
                    reason: format!("cannot launch {}: {}", spec.program, e),
                });
            }
            Err(e) => {
                return Err(PipelineError::TransientProcessCrash {
                    stage: spec.stage,
                    attempt,
                    reason: format!("spawn of {} failed: {}", spec.program, e),
                });
            }
        };

        let pid = child.id();
        let stderr_task = child.stderr.take().map(|stderr| {
            let stage = spec.stage;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(stage = %stage, attempt, "{}", line);
                }
            })
        });

        info!(stage = %spec.stage, attempt, pid, "Process started");

        Ok(Self {
            stage: spec.stage,
            attempt,
            child,
            pid,
            clean_exit_codes: spec.clean_exit_codes.clone(),
            state: ProcessState::Running,
            stderr_task,
        })
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn state(&self) -> &ProcessState {
        &self.state
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.child.stdout.take()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.child.stdin.take()
    }

    /// Wait for the process to exit on its own. Cancel safe.
    pub async fn wait_exit(&mut self) -> ExitClass {
        if let ProcessState::Exited(class) = &self.state {
            return class.clone();
        }
        let class = match self.child.wait().await {
            Ok(status) => classify(status, &self.clean_exit_codes),
            Err(e) => ExitClass::CrashExit {
                code: None,
                reason: format!("wait failed: {}", e),
            },
        };
        self.finish(class).await
    }

    /// Wait for exit, terminating the process tree if `cancel` fires first.
    pub async fn wait(&mut self, cancel: &CancellationToken, grace: Duration) -> ExitClass {
        tokio::select! {
            class = self.wait_exit() => class,
            _ = cancel.cancelled() => self.terminate(grace).await,
        }
    }

    /// SIGTERM the process group, then SIGKILL it after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> ExitClass {
        if let ProcessState::Exited(class) = &self.state {
            return class.clone();
        }

        info!(stage = %self.stage, attempt = self.attempt, pid = self.pid, "Terminating process tree");
        self.signal_group(GroupSignal::Terminate);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!(
                    stage = %self.stage,
                    attempt = self.attempt,
                    grace_secs = grace.as_secs_f32(),
                    "Process ignored SIGTERM, killing"
                );
                self.signal_group(GroupSignal::Kill);
                if let Err(e) = self.child.kill().await {
                    warn!(stage = %self.stage, error = %e, "Kill failed");
                }
            }
        }
        // Grandchildren may outlive the leader.
        self.signal_group(GroupSignal::Kill);

        self.finish(ExitClass::Killed).await
    }

    async fn finish(&mut self, class: ExitClass) -> ExitClass {
        if let Some(task) = self.stderr_task.take() {
            // The pipe closes when the last writer in the group exits.
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        debug!(stage = %self.stage, attempt = self.attempt, exit = ?class, "Process exited");
        self.state = ProcessState::Exited(class.clone());
        class
    }

    #[cfg(unix)]
    fn signal_group(&self, which: GroupSignal) {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid else { return };
        let signal = match which {
            GroupSignal::Terminate => Signal::SIGTERM,
            GroupSignal::Kill => Signal::SIGKILL,
        };
        match killpg(Pid::from_raw(pid as i32), signal) {
            Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
            Err(e) => debug!(stage = %self.stage, pid, error = %e, "killpg failed"),
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _which: GroupSignal) {
        let _ = self.child.start_kill();
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    Retry,
    Fatal,
}

/// Per-session crash counter with a hard stop.
#[derive(Debug, Clone)]
pub struct RestartTracker {
    stage: Stage,
    crashes: u32,
    max: u32,
}

impl RestartTracker {
    pub fn new(stage: Stage, max: u32) -> Self {
        Self {
            stage,
            crashes: 0,
            max,
        }
    }

    pub fn crashes(&self) -> u32 {
        self.crashes
    }

    pub fn exhausted(&self) -> bool {
        self.crashes >= self.max
    }

    /// Count a crash; `Fatal` once the bound is reached.
    pub fn record_crash(&mut self, reason: &str) -> RestartDecision {
        self.crashes += 1;
        if self.exhausted() {
            tracing::error!(
                stage = %self.stage,
                crashes = self.crashes,
                max = self.max,
                reason,
                "Restart bound reached, giving up"
            );
            RestartDecision::Fatal
        } else {
            warn!(
                stage = %self.stage,
                crashes = self.crashes,
                max = self.max,
                reason,
                "Process crashed, restarting"
            );
            RestartDecision::Retry
        }
    }

    pub fn fatal_error(&self) -> PipelineError {
        PipelineError::FatalProcessFailure {
            stage: self.stage,
            reason: format!("{} crashes, bound is {}", self.crashes, self.max),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    fn sh(stage: Stage, script: &str) -> ProcessSpec {
        ProcessSpec::new(stage, "sh", vec!["-c".to_string(), script.to_string()])
    }

    #[test]
    fn test_classify() {
        let clean = [0, 1];
        assert_eq!(
            classify(ExitStatus::from_raw(0), &clean),
            ExitClass::CleanExit { code: 0 }
        );
        assert_eq!(
            classify(ExitStatus::from_raw(1 << 8), &clean),
            ExitClass::CleanExit { code: 1 }
        );
        assert!(matches!(
            classify(ExitStatus::from_raw(2 << 8), &clean),
            ExitClass::CrashExit { code: Some(2), .. }
        ));
        // Raw status 9 = killed by SIGKILL
        assert!(matches!(
            classify(ExitStatus::from_raw(9), &clean),
            ExitClass::CrashExit { code: None, .. }
        ));
    }

    #[test]
    fn test_restart_tracker_escalates() {
        let mut tracker = RestartTracker::new(Stage::Capture, 3);
        assert_eq!(tracker.record_crash("boom"), RestartDecision::Retry);
        assert_eq!(tracker.record_crash("boom"), RestartDecision::Retry);
        assert_eq!(tracker.record_crash("boom"), RestartDecision::Fatal);
        assert!(tracker.exhausted());
        assert!(matches!(
            tracker.fatal_error(),
            PipelineError::FatalProcessFailure { stage: Stage::Capture, .. }
        ));
    }

    #[tokio::test]
    async fn test_missing_binary_is_fatal() {
        let spec = ProcessSpec::new(
            Stage::Capture,
            "/nonexistent/definitely-not-a-tool",
            vec![],
        );
        let err = SupervisedProcess::spawn(&spec, 1).err().unwrap();
        assert!(matches!(err, PipelineError::FatalProcessFailure { .. }));
    }

    #[tokio::test]
    async fn test_wait_classifies_exit() {
        let cancel = CancellationToken::new();

        let mut ok = SupervisedProcess::spawn(&sh(Stage::Transcode, "exit 0"), 1).unwrap();
        assert_eq!(
            ok.wait(&cancel, Duration::from_secs(1)).await,
            ExitClass::CleanExit { code: 0 }
        );
        assert_eq!(ok.state(), &ProcessState::Exited(ExitClass::CleanExit { code: 0 }));

        let mut bad = SupervisedProcess::spawn(&sh(Stage::Transcode, "echo oops >&2; exit 3"), 2)
            .unwrap();
        assert!(matches!(
            bad.wait(&cancel, Duration::from_secs(1)).await,
            ExitClass::CrashExit { code: Some(3), .. }
        ));
    }

    #[tokio::test]
    async fn test_cancel_kills_process_tree() {
        let cancel = CancellationToken::new();
        // The trap ignores SIGTERM, forcing the SIGKILL path; the background
        // sleep is a grandchild in the same group.
        let spec = sh(Stage::Capture, "trap '' TERM; sleep 30 & sleep 30; wait");
        let mut proc = SupervisedProcess::spawn(&spec, 1).unwrap();

        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let started = std::time::Instant::now();
        let class = proc.wait(&cancel, Duration::from_millis(200)).await;
        assert_eq!(class, ExitClass::Killed);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_stdout_is_piped() {
        use tokio::io::AsyncReadExt;

        let spec = sh(Stage::Capture, "printf hello").pipe_stdout();
        let mut proc = SupervisedProcess::spawn(&spec, 1).unwrap();
        let mut out = String::new();
        proc.take_stdout()
            .unwrap()
            .read_to_string(&mut out)
            .await
            .unwrap();
        assert_eq!(out, "hello");
        assert_eq!(proc.wait_exit().await, ExitClass::CleanExit { code: 0 });
    }
}
