//! Supervisor ↔ worker: the restart-on-memory-pressure runtime.
//!
//! ```text
//! Supervisor (tokio loop) ──stop flag──▶ Worker incarnation (process)
//!          ▲                                   │
//!          └──────── LOG / PROGRESS / DONE / ERROR (JSON lines)
//! ```

pub mod audit;
pub mod launcher;
pub mod memory;
pub mod protocol;
pub mod runtime;
pub mod stop;
pub mod worker;

pub use audit::AuditLog;
pub use launcher::{ProcessLauncher, ThreadLauncher, WorkerHandle, WorkerLauncher};
pub use memory::{MemoryProbe, SysinfoProbe};
pub use protocol::WorkerMessage;
pub use runtime::{Control, Supervisor, SupervisorEvent};
pub use stop::{AtomicStopSignal, FileStopSignal, StopSignal};
pub use worker::{run_worker, BackendLoader, WorkerExit, WorkerJob};

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::source::SourceError;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("Failed to launch worker: {0}")]
    Launch(std::io::Error),

    #[error("Extraction already running")]
    AlreadyRunning,

    #[error("Output must be a .csv file: {0}")]
    InvalidOutput(PathBuf),

    #[error("Input document not found: {0}")]
    MissingInput(PathBuf),

    #[error("Page source: {0}")]
    Source(#[from] SourceError),
}
