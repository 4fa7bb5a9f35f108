//! Cooperative stop flag: written by the supervisor, read by the worker at
//! page boundaries only.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

pub trait StopSignal: Send + Sync {
    /// Ask the worker to stop at its next page boundary.
    fn raise(&self);

    /// Reset before a new worker incarnation starts.
    fn clear(&self);

    fn is_raised(&self) -> bool;
}

/// In-process flag for workers running on a thread.
#[derive(Debug, Default)]
pub struct AtomicStopSignal {
    flag: AtomicBool,
}

impl AtomicStopSignal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StopSignal for AtomicStopSignal {
    fn raise(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    fn clear(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }

    fn is_raised(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Flag shared with a child process through the existence of a file.
#[derive(Debug, Clone)]
pub struct FileStopSignal {
    path: PathBuf,
}

impl FileStopSignal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// A flag file in the system temp dir, unique to this supervisor.
    pub fn unique() -> Self {
        let name = format!("tablegrid-stop-{}.flag", uuid::Uuid::new_v4());
        Self::new(std::env::temp_dir().join(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StopSignal for FileStopSignal {
    fn raise(&self) {
        if let Err(e) = std::fs::write(&self.path, b"stop") {
            tracing::error!(path = %self.path.display(), error = %e, "Failed to raise stop flag");
        }
    }

    fn clear(&self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::error!(path = %self.path.display(), error = %e, "Failed to clear stop flag");
            }
        }
    }

    fn is_raised(&self) -> bool {
        self.path.exists()
    }
}
