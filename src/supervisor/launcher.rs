//! Isolation boundary for worker incarnations.
//!
//! The production launcher runs each incarnation as a child process of the
//! current executable so model memory is returned to the OS on exit. The
//! thread launcher runs the same worker in-process; it does not reclaim
//! memory and exists for debugging and tests.

use std::io::{BufRead, BufReader};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::protocol::WorkerMessage;
use super::stop::{AtomicStopSignal, FileStopSignal, StopSignal};
use super::worker::{run_worker, WorkerJob};
use super::SupervisorError;
use crate::config::ExtractionSettings;
use crate::pipeline::extraction::CapabilityLoader;

/// A running worker incarnation, polled without blocking.
pub trait WorkerHandle: Send {
    /// Next queued message in emission order, if any.
    fn try_next(&mut self) -> Option<WorkerMessage>;

    /// Whether the incarnation has ended. Once true, every message it
    /// emitted is already queued.
    fn has_exited(&mut self) -> bool;

    /// End the incarnation without waiting for a page boundary.
    fn terminate(&mut self);

    fn describe(&self) -> String;
}

pub trait WorkerLauncher: Send {
    fn launch(&self, job: &WorkerJob) -> Result<Box<dyn WorkerHandle>, SupervisorError>;

    /// The flag every incarnation from this launcher observes.
    fn stop_signal(&self) -> Arc<dyn StopSignal>;
}

// ═══════════════════════════════════════════════════════════
// Child process
// ═══════════════════════════════════════════════════════════

/// Spawns `<exe> worker ...` and reads its JSON-line messages from stdout.
pub struct ProcessLauncher {
    executable: PathBuf,
    settings: ExtractionSettings,
    stop: Arc<FileStopSignal>,
}

impl ProcessLauncher {
    pub fn new(executable: PathBuf, settings: ExtractionSettings) -> Self {
        Self {
            executable,
            settings,
            stop: Arc::new(FileStopSignal::unique()),
        }
    }

    /// Launcher re-executing the running binary.
    pub fn current_exe(settings: ExtractionSettings) -> Result<Self, SupervisorError> {
        let exe = std::env::current_exe().map_err(SupervisorError::Launch)?;
        Ok(Self::new(exe, settings))
    }

    fn worker_args(&self, job: &WorkerJob) -> Result<Vec<String>, SupervisorError> {
        let settings = serde_json::to_string(&self.settings)
            .map_err(|e| SupervisorError::Launch(std::io::Error::other(e)))?;
        Ok(vec![
            "worker".to_string(),
            "--images".to_string(),
            job.images_dir.display().to_string(),
            "--output".to_string(),
            job.output.display().to_string(),
            "--start-page".to_string(),
            job.start_page.to_string(),
            "--stop-file".to_string(),
            self.stop.path().display().to_string(),
            "--settings".to_string(),
            settings,
        ])
    }
}

impl Drop for ProcessLauncher {
    fn drop(&mut self) {
        self.stop.clear();
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self, job: &WorkerJob) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
        let mut command = Command::new(&self.executable);
        command
            .args(self.worker_args(job)?)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        // Own process group: a terminal Ctrl-C reaches only the supervisor,
        // which turns it into a stop at the next page boundary.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let mut child = command.spawn().map_err(SupervisorError::Launch)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SupervisorError::Launch(std::io::Error::other("worker stdout not captured")))?;

        let (tx, rx) = mpsc::channel();
        let pid = child.id();
        let reader = std::thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                let message = WorkerMessage::from_line(&line).unwrap_or_else(|e| {
                    tracing::debug!(pid, error = %e, "Non-protocol line on worker stdout");
                    WorkerMessage::log(line)
                });
                if tx.send(message).is_err() {
                    break;
                }
            }
        });

        tracing::info!(pid, start_page = job.start_page, "Worker process spawned");

        Ok(Box::new(ProcessHandle {
            child,
            reader: Some(reader),
            messages: rx,
            exited: false,
        }))
    }

    fn stop_signal(&self) -> Arc<dyn StopSignal> {
        self.stop.clone()
    }
}

struct ProcessHandle {
    child: Child,
    reader: Option<JoinHandle<()>>,
    messages: Receiver<WorkerMessage>,
    exited: bool,
}

impl ProcessHandle {
    fn join_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl WorkerHandle for ProcessHandle {
    fn try_next(&mut self) -> Option<WorkerMessage> {
        match self.messages.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    fn has_exited(&mut self) -> bool {
        if self.exited {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::info!(pid = self.child.id(), %status, "Worker process exited");
                // stdout is closed once the process is gone; drain it fully.
                self.join_reader();
                self.exited = true;
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot poll worker process");
                false
            }
        }
    }

    fn terminate(&mut self) {
        if self.exited {
            return;
        }
        tracing::warn!(pid = self.child.id(), "Terminating worker process");
        if let Err(e) = self.child.kill() {
            tracing::warn!(error = %e, "Kill failed");
        }
        let _ = self.child.wait();
        self.join_reader();
        self.exited = true;
    }

    fn describe(&self) -> String {
        format!("process {}", self.child.id())
    }
}

// ═══════════════════════════════════════════════════════════
// In-process thread
// ═══════════════════════════════════════════════════════════

/// Runs incarnations on a thread of the supervisor's process.
pub struct ThreadLauncher {
    loader: Arc<dyn CapabilityLoader>,
    settings: ExtractionSettings,
    stop: Arc<AtomicStopSignal>,
}

impl ThreadLauncher {
    pub fn new(loader: Arc<dyn CapabilityLoader>, settings: ExtractionSettings) -> Self {
        Self {
            loader,
            settings,
            stop: Arc::new(AtomicStopSignal::new()),
        }
    }
}

impl WorkerLauncher for ThreadLauncher {
    fn launch(&self, job: &WorkerJob) -> Result<Box<dyn WorkerHandle>, SupervisorError> {
        let (tx, rx) = mpsc::channel();
        let job = job.clone();
        let loader = self.loader.clone();
        let settings = self.settings.clone();
        let stop = self.stop.clone();

        let thread = std::thread::Builder::new()
            .name(format!("worker-p{}", job.start_page))
            .spawn(move || {
                let emit = |message: WorkerMessage| {
                    let _ = tx.send(message);
                };
                run_worker(&job, loader.as_ref(), &settings, stop.as_ref(), &emit);
            })
            .map_err(SupervisorError::Launch)?;

        Ok(Box::new(ThreadHandle {
            thread: Some(thread),
            messages: rx,
            abandoned: false,
        }))
    }

    fn stop_signal(&self) -> Arc<dyn StopSignal> {
        self.stop.clone()
    }
}

struct ThreadHandle {
    thread: Option<JoinHandle<()>>,
    messages: Receiver<WorkerMessage>,
    abandoned: bool,
}

impl WorkerHandle for ThreadHandle {
    fn try_next(&mut self) -> Option<WorkerMessage> {
        self.messages.try_recv().ok()
    }

    fn has_exited(&mut self) -> bool {
        match &self.thread {
            Some(thread) if thread.is_finished() => {
                if let Some(thread) = self.thread.take() {
                    let _ = thread.join();
                }
                true
            }
            Some(_) => false,
            None => true,
        }
    }

    /// Threads cannot be killed. The handle keeps reporting the worker as
    /// running until its thread returns at the next page boundary, so no
    /// second incarnation is launched alongside it.
    fn terminate(&mut self) {
        if self.thread.is_some() && !std::mem::replace(&mut self.abandoned, true) {
            tracing::warn!("In-process worker cannot be killed; waiting for its next page boundary");
        }
    }

    fn describe(&self) -> String {
        "in-process thread".to_string()
    }
}
