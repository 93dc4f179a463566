use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tapeconf::TapeConfig;
use tapedeck::{
    preflight, telemetry, DiskSpaceGuard, LogPublisher, SessionController, SessionEnd,
    SessionState, StartSession, Sweeper,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Tapedeck - record a live stream through a crash-tolerant capture/transcode pipeline
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file used instead of ./tapedeck.toml
    #[arg(long, global = true, env = "TAPEDECK_CONFIG")]
    config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Record one session until the stream ends or a signal arrives
    Record {
        /// Channel label, used for the session directory name
        #[arg(long)]
        label: String,

        /// Stream URL handed to the capture tool
        #[arg(long)]
        target: String,

        /// Credential handed to the capture tool
        #[arg(long, env = "TAPEDECK_AUTH_TOKEN", default_value = "", hide_env_values = true)]
        auth_token: String,
    },

    /// Print the effective configuration as TOML
    ShowConfig,

    /// Verify the configured tools can be launched
    Check,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let (config, sources) = TapeConfig::load_with_sources_from(cli.config.as_deref())
        .context("Failed to load configuration")?;

    match cli.command {
        Commands::ShowConfig => {
            for file in &sources.files {
                println!("# loaded: {}", file.display());
            }
            for var in &sources.env_overrides {
                println!("# env: {}", var);
            }
            print!("{}", config.to_toml()?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Check => match preflight::check(&config) {
            Ok(tools) => {
                for tool in tools {
                    println!("{:<10} {}", tool.stage.to_string(), tool.path.display());
                }
                Ok(ExitCode::SUCCESS)
            }
            Err(e) => {
                eprintln!("{e}");
                Ok(ExitCode::FAILURE)
            }
        },
        Commands::Record {
            label,
            target,
            auth_token,
        } => {
            let _telemetry = telemetry::init(&config.telemetry, &config.paths.log_dir)
                .context("Failed to initialize telemetry")?;
            record(
                config,
                StartSession {
                    label,
                    target,
                    auth_token,
                },
            )
            .await
        }
    }
}

async fn record(config: TapeConfig, request: StartSession) -> Result<ExitCode> {
    preflight::check(&config).context("Preflight failed")?;

    let recordings = config.paths.recordings_dir.clone();
    std::fs::create_dir_all(&recordings)
        .with_context(|| format!("Failed to create {}", recordings.display()))?;

    let controller = SessionController::new(config.clone(), Arc::new(LogPublisher));
    let background = CancellationToken::new();

    let guard = Arc::new(DiskSpaceGuard::new(recordings.clone(), &config.disk_guard));
    tokio::spawn(
        guard
            .run(background.clone())
            .instrument(tracing::info_span!("disk_guard")),
    );
    for sweeper in Sweeper::all(&config, controller.active_dir()) {
        let span = tracing::info_span!("sweeper", kind = ?sweeper.kind());
        tokio::spawn(sweeper.run(background.clone()).instrument(span));
    }

    tracing::info!(
        recordings = %recordings.display(),
        label = %request.label,
        "Tapedeck recording"
    );
    controller.start_session(request)?;

    let mut signals = Signals::new()?;
    let mut state = controller.subscribe();
    let mut stop_requested = false;
    loop {
        tokio::select! {
            _ = state.wait_for(|s| *s == SessionState::Idle) => break,
            name = signals.recv() => {
                if stop_requested {
                    tracing::warn!(signal = name, "Second signal, terminating session");
                    let controller = controller.clone();
                    tokio::spawn(async move { controller.shutdown().await });
                } else {
                    tracing::info!(signal = name, "Signal received, draining session");
                    stop_requested = true;
                    let controller = controller.clone();
                    tokio::spawn(async move { controller.stop_session().await });
                }
            }
        }
    }

    background.cancel();

    let summary = controller.last_summary();
    match summary.map(|s| s.end) {
        Some(SessionEnd::Failed { reason }) => {
            tracing::error!(%reason, "Session failed");
            Ok(ExitCode::FAILURE)
        }
        _ => {
            tracing::info!("Shutdown complete");
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// SIGINT and SIGTERM, registered once so repeated signals are not lost.
struct Signals {
    #[cfg(unix)]
    interrupt: tokio::signal::unix::Signal,
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl Signals {
    #[cfg(unix)]
    fn new() -> Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt()).context("Failed to setup SIGINT")?,
            terminate: signal(SignalKind::terminate()).context("Failed to setup SIGTERM")?,
        })
    }

    #[cfg(not(unix))]
    fn new() -> Result<Self> {
        Ok(Self {})
    }

    #[cfg(unix)]
    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) -> &'static str {
        match tokio::signal::ctrl_c().await {
            Ok(()) => "ctrl-c",
            Err(_) => std::future::pending().await,
        }
    }
}
