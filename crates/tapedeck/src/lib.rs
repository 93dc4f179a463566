//! Tapedeck - live stream recorder
//!
//! A capture tool spools the stream into numbered buffer files on disk while a
//! transcode tool is fed from those same files, so either side can crash and
//! restart without losing or duplicating bytes.

pub mod buffer_queue;
pub mod capture;
pub mod disk_guard;
pub mod error;
pub mod finalize;
pub mod layout;
pub mod preflight;
pub mod publish;
pub mod session;
pub mod supervisor;
pub mod sweepers;
pub mod telemetry;
pub mod transcode;

pub use buffer_queue::{BufferFile, BufferQueue, Dequeue};
pub use disk_guard::{DiskSpaceGuard, FsSpaceProbe, GuardReport, SpaceProbe};
pub use error::{PipelineError, Result};
pub use finalize::FinishedRecording;
pub use publish::{LogPublisher, Publisher, SessionEnd, SessionEvent, SessionSummary};
pub use session::{SessionController, SessionState, StartSession};
pub use supervisor::Stage;
pub use sweepers::{SweepKind, SweepReport, Sweeper};
