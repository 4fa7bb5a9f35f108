//! The supervisor: owns at most one worker incarnation, relays its messages,
//! and recycles it when system memory runs high.
//!
//! ```text
//! Idle ──start(pdf)──▶ Preparing ──pages ready──┐
//!  │                                             ▼
//!  └────────────start(images)─────────────────▶ Running ──exit──▶ Idle
//!                   │  ▲
//!   memory > limit  │  │ delay elapsed, checkpoint re-resolved
//!   (stop flag set) ▼  │
//!                 Running(restart pending) ──exit──▶ RestartScheduled
//! ```
//!
//! Periodic checks take the current instant and return without blocking, so
//! the state machine can be driven by the tokio loop in [`Supervisor::run`]
//! or stepped directly.

use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::time::{Duration, Instant};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::MissedTickBehavior;

use super::audit::AuditLog;
use super::launcher::{WorkerHandle, WorkerLauncher};
use super::memory::MemoryProbe;
use super::protocol::WorkerMessage;
use super::worker::WorkerJob;
use super::SupervisorError;
use crate::config::ExtractionSettings;
use crate::pipeline::checkpoint::{resolve_start_page, ResumePoint};
use crate::pipeline::source::{
    cache_dir_for, ImageDirSource, PageSource, PdfRasterizer, SourceError,
};
use crate::pipeline::store::CsvResultStore;

/// What the presentation layer sees.
#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorEvent {
    Log(String),
    Progress { page: u32, total: usize },
    /// Worker `DONE` text.
    Done(String),
    /// Worker `ERROR` text, or a run that could not be started.
    Error(String),
    MemoryUsage(f32),
    RestartScheduled { delay: Duration },
    /// No worker is active; `start` is accepted again.
    Idle,
}

/// Control inputs from the presentation layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Control {
    Start { pdf: PathBuf, output: PathBuf },
    /// Start from an existing directory of page images.
    StartImages { images: PathBuf, output: PathBuf },
    Stop,
}

pub type EventSink = Box<dyn Fn(SupervisorEvent) + Send>;

/// Document a run is bound to; survives worker restarts.
#[derive(Debug, Clone)]
struct RunTarget {
    images_dir: PathBuf,
    output: PathBuf,
    total_pages: usize,
}

struct ActiveWorker {
    handle: Box<dyn WorkerHandle>,
    target: RunTarget,
    restart_pending: bool,
    stop_requested_at: Option<Instant>,
    terminal_at: Option<Instant>,
    /// Forced termination already requested; the handle reports the exit.
    terminated: bool,
}

/// Page images being rendered off the supervisor loop.
struct Preparation {
    cache_dir: PathBuf,
    output: PathBuf,
    ready: Receiver<Result<usize, SourceError>>,
}

enum State {
    Idle,
    Preparing(Preparation),
    Running(ActiveWorker),
    RestartScheduled { at: Instant, target: RunTarget },
}

pub struct Supervisor {
    settings: ExtractionSettings,
    launcher: Box<dyn WorkerLauncher>,
    probe: Box<dyn MemoryProbe>,
    audit: AuditLog,
    sink: EventSink,
    state: State,
    exit_when_idle: bool,
}

impl Supervisor {
    pub fn new(
        settings: ExtractionSettings,
        launcher: Box<dyn WorkerLauncher>,
        probe: Box<dyn MemoryProbe>,
        sink: EventSink,
    ) -> Self {
        let audit = AuditLog::new(&settings.audit_log);
        Self {
            settings,
            launcher,
            probe,
            audit,
            sink,
            state: State::Idle,
            exit_when_idle: false,
        }
    }

    /// Make [`Supervisor::run`] return as soon as the supervisor goes idle
    /// after handling queued control inputs.
    pub fn exit_when_idle(mut self, exit: bool) -> Self {
        self.exit_when_idle = exit;
        self
    }

    /// A worker is running or a restart is scheduled.
    pub fn is_active(&self) -> bool {
        !matches!(self.state, State::Idle)
    }

    pub fn restart_pending(&self) -> bool {
        match &self.state {
            State::Running(worker) => worker.restart_pending,
            State::RestartScheduled { .. } => true,
            State::Idle | State::Preparing(_) => false,
        }
    }

    // ═══════════════════════════════════════════════════════════
    // Control inputs
    // ═══════════════════════════════════════════════════════════

    /// Rasterise `pdf` into the page cache (reusing cached pages) on a
    /// background thread; the worker is launched by [`Supervisor::poll_worker`]
    /// once the pages are ready.
    pub fn start(&mut self, pdf: &Path, output: &Path) -> Result<(), SupervisorError> {
        self.check_startable(output)?;
        if !pdf.is_file() {
            return Err(SupervisorError::MissingInput(pdf.to_path_buf()));
        }

        let cache_dir = cache_dir_for(&self.settings.page_cache_dir, pdf);
        let rasterizer = PdfRasterizer::new(&self.settings.pdftoppm_bin, self.settings.render_dpi);
        let (tx, rx) = mpsc::channel();
        let (render_pdf, render_dir) = (pdf.to_path_buf(), cache_dir.clone());
        std::thread::Builder::new()
            .name("page-render".to_string())
            .spawn(move || {
                let _ = tx.send(rasterizer.prepare(&render_pdf, &render_dir));
            })
            .map_err(SupervisorError::Launch)?;

        self.log(format!("Preparing page images for {}...", pdf.display()));
        self.state = State::Preparing(Preparation {
            cache_dir,
            output: output.to_path_buf(),
            ready: rx,
        });
        Ok(())
    }

    /// Start on a directory of page images.
    pub fn start_images(&mut self, images_dir: &Path, output: &Path) -> Result<(), SupervisorError> {
        self.check_startable(output)?;

        let total_pages = ImageDirSource::new(images_dir).page_count()?;
        let target = RunTarget {
            images_dir: images_dir.to_path_buf(),
            output: output.to_path_buf(),
            total_pages,
        };
        tracing::info!(
            images = %images_dir.display(),
            output = %output.display(),
            total_pages,
            "Run requested"
        );
        self.launch_from_checkpoint(target);
        Ok(())
    }

    /// Ask the worker to stop at its next page boundary. Cancels any pending
    /// memory restart.
    pub fn stop(&mut self, now: Instant) {
        match &mut self.state {
            State::Idle => {}
            State::Preparing(_) => {
                // The render thread finishes on its own; its result is dropped.
                self.log("Stop requested. Page preparation abandoned.");
                self.go_idle();
            }
            State::Running(worker) => {
                let cancelled = std::mem::take(&mut worker.restart_pending);
                if worker.stop_requested_at.is_none() {
                    worker.stop_requested_at = Some(now);
                    self.launcher.stop_signal().raise();
                }
                if cancelled {
                    self.log("Pending restart cancelled.");
                }
                self.log("Stop requested. The worker finishes its current page first.");
            }
            State::RestartScheduled { .. } => {
                self.state = State::Idle;
                self.log("Pending restart cancelled.");
                self.go_idle();
            }
        }
    }

    fn check_startable(&self, output: &Path) -> Result<(), SupervisorError> {
        if self.is_active() {
            tracing::warn!("Start rejected: a run is already active");
            return Err(SupervisorError::AlreadyRunning);
        }
        let is_csv = output
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("csv"));
        if !is_csv {
            return Err(SupervisorError::InvalidOutput(output.to_path_buf()));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Periodic checks
    // ═══════════════════════════════════════════════════════════

    /// Drain queued worker messages, reap an exited worker, enforce grace
    /// periods and fire a due restart.
    pub fn poll_worker(&mut self, now: Instant) {
        match &self.state {
            State::Idle => return,
            State::Preparing(_) => {
                self.poll_preparation();
                return;
            }
            State::RestartScheduled { at, .. } => {
                if now >= *at {
                    if let State::RestartScheduled { target, .. } = std::mem::replace(&mut self.state, State::Idle) {
                        self.log("Restarting worker...");
                        self.launch_from_checkpoint(target);
                    }
                }
                return;
            }
            State::Running(_) => {}
        }

        self.drain_messages(now);

        if !self.worker_exited() {
            self.enforce_grace(now);
        }
        if self.worker_exited() {
            self.drain_messages(now);
            self.on_worker_exit(now);
        }
    }

    fn poll_preparation(&mut self) {
        let State::Preparing(preparation) = &self.state else {
            return;
        };
        let result = match preparation.ready.try_recv() {
            Ok(result) => result,
            Err(TryRecvError::Empty) => return,
            Err(TryRecvError::Disconnected) => Err(SourceError::Render(
                "page rendering thread ended without a result".to_string(),
            )),
        };
        let State::Preparing(preparation) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };

        let started = result.map_err(SupervisorError::from).and_then(|pages| {
            self.log(format!(
                "{pages} page image(s) ready in {}.",
                preparation.cache_dir.display()
            ));
            self.start_images(&preparation.cache_dir, &preparation.output)
        });
        if let Err(e) = started {
            self.reject(e);
            self.go_idle();
        }
    }

    fn worker_exited(&mut self) -> bool {
        match &mut self.state {
            State::Running(worker) => worker.handle.has_exited(),
            _ => false,
        }
    }

    /// Probe memory and schedule a restart when usage is over the limit.
    pub fn check_memory(&mut self, now: Instant) {
        let usage = self.probe.usage_percent();
        (self.sink)(SupervisorEvent::MemoryUsage(usage));

        let limit = self.settings.memory_threshold_percent;
        let State::Running(worker) = &mut self.state else {
            return;
        };
        if usage <= limit || worker.restart_pending || worker.stop_requested_at.is_some() {
            return;
        }

        worker.restart_pending = true;
        worker.stop_requested_at = Some(now);
        self.launcher.stop_signal().raise();
        tracing::warn!(usage, limit, "Memory threshold exceeded, recycling worker");
        self.log(format!(
            "Memory usage {usage:.1}% exceeds {limit:.0}%. Restarting worker after the current page."
        ));
    }

    fn enforce_grace(&mut self, now: Instant) {
        let finish_grace = self.settings.finish_join_grace();
        let stop_grace = self.settings.stop_grace();
        let State::Running(worker) = &mut self.state else {
            return;
        };
        if worker.terminated {
            return;
        }

        let reason = if worker.terminal_at.is_some_and(|t| now.duration_since(t) >= finish_grace) {
            Some(format!(
                "Worker did not exit within {}s of finishing; terminating.",
                finish_grace.as_secs()
            ))
        } else if worker.stop_requested_at.is_some_and(|t| now.duration_since(t) >= stop_grace) {
            Some(format!(
                "Worker did not stop within {}s; terminating.",
                stop_grace.as_secs()
            ))
        } else {
            None
        };

        if let Some(reason) = reason {
            tracing::warn!(worker = %worker.handle.describe(), "Forcing worker termination");
            worker.terminated = true;
            worker.handle.terminate();
            self.log(reason);
        }
    }

    fn drain_messages(&mut self, now: Instant) {
        loop {
            let (message, total) = match &mut self.state {
                State::Running(worker) => match worker.handle.try_next() {
                    Some(message) => {
                        if message.is_terminal() {
                            worker.terminal_at.get_or_insert(now);
                        }
                        (message, worker.target.total_pages)
                    }
                    None => return,
                },
                _ => return,
            };
            self.relay(message, total);
        }
    }

    fn relay(&self, message: WorkerMessage, total: usize) {
        match message {
            WorkerMessage::Log { text } => {
                self.audit.append(&text);
                (self.sink)(SupervisorEvent::Log(text));
            }
            WorkerMessage::Progress { page } => {
                (self.sink)(SupervisorEvent::Progress { page, total });
            }
            WorkerMessage::Done { text } => {
                self.audit.append(&text);
                (self.sink)(SupervisorEvent::Done(text));
            }
            WorkerMessage::Error { text } => {
                tracing::error!(%text, "Worker reported an error");
                self.audit.append(&format!("ERROR: {text}"));
                (self.sink)(SupervisorEvent::Error(text));
            }
        }
    }

    fn on_worker_exit(&mut self, now: Instant) {
        let State::Running(worker) = std::mem::replace(&mut self.state, State::Idle) else {
            return;
        };
        tracing::info!(
            worker = %worker.handle.describe(),
            restart_pending = worker.restart_pending,
            "Worker incarnation ended"
        );

        if worker.restart_pending {
            let delay = self.settings.restart_delay();
            self.log(format!(
                "Worker exited to free memory. Restarting in {}s.",
                delay.as_secs()
            ));
            (self.sink)(SupervisorEvent::RestartScheduled { delay });
            self.state = State::RestartScheduled {
                at: now + delay,
                target: worker.target,
            };
            return;
        }

        if worker.terminal_at.is_none() && worker.stop_requested_at.is_none() {
            let text = "Worker exited without reporting a final status.".to_string();
            self.audit.append(&format!("ERROR: {text}"));
            (self.sink)(SupervisorEvent::Error(text));
        }
        self.go_idle();
    }

    /// Resolve the checkpoint for `target` and launch a worker from it, or
    /// go idle when there is nothing left to do.
    fn launch_from_checkpoint(&mut self, target: RunTarget) {
        let store = CsvResultStore::new(&target.output);
        let resolution = resolve_start_page(&store, target.total_pages);
        if let Some(warning) = &resolution.warning {
            self.log(warning.clone());
        }

        let start_page = match resolution.point {
            ResumePoint::Complete { last_page, total_pages } => {
                self.log(format!(
                    "All pages already processed ({last_page} of {total_pages}). Nothing to do."
                ));
                self.go_idle();
                return;
            }
            ResumePoint::Start { page } => page,
        };

        let job = WorkerJob {
            images_dir: target.images_dir.clone(),
            output: target.output.clone(),
            start_page,
        };

        self.launcher.stop_signal().clear();
        match self.launcher.launch(&job) {
            Ok(handle) => {
                self.log(format!(
                    "Starting worker from page {start_page} of {}.",
                    target.total_pages
                ));
                self.state = State::Running(ActiveWorker {
                    handle,
                    target,
                    restart_pending: false,
                    stop_requested_at: None,
                    terminal_at: None,
                    terminated: false,
                });
            }
            Err(e) => {
                tracing::error!(error = %e, "Worker launch failed");
                let text = e.to_string();
                self.audit.append(&format!("ERROR: {text}"));
                (self.sink)(SupervisorEvent::Error(text));
                self.go_idle();
            }
        }
    }

    fn go_idle(&mut self) {
        self.state = State::Idle;
        tracing::info!("Supervisor idle");
        (self.sink)(SupervisorEvent::Idle);
    }

    fn log(&self, text: impl Into<String>) {
        let text = text.into();
        tracing::info!("{text}");
        self.audit.append(&text);
        (self.sink)(SupervisorEvent::Log(text));
    }

    fn reject(&self, error: SupervisorError) {
        tracing::warn!(error = %error, "Control input rejected");
        let text = error.to_string();
        self.audit.append(&format!("ERROR: {text}"));
        (self.sink)(SupervisorEvent::Error(text));
    }

    // ═══════════════════════════════════════════════════════════
    // Event loop
    // ═══════════════════════════════════════════════════════════

    /// Drive the supervisor: control inputs as they arrive, the message
    /// queue every `queue_poll_millis`, memory every `memory_poll_secs`.
    ///
    /// Returns once the control channel is closed and no run is active, or
    /// as soon as the supervisor is idle when `exit_when_idle` is set.
    pub async fn run(&mut self, mut control: UnboundedReceiver<Control>) {
        let mut queue_tick = tokio::time::interval(self.settings.queue_poll_interval());
        queue_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut memory_tick = tokio::time::interval(self.settings.memory_poll_interval());
        memory_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut control_open = true;

        tracing::info!(
            queue_ms = self.settings.queue_poll_millis,
            memory_s = self.settings.memory_poll_secs,
            threshold = self.settings.memory_threshold_percent,
            "Supervisor loop started"
        );

        loop {
            tokio::select! {
                biased;
                command = control.recv(), if control_open => match command {
                    Some(command) => self.handle_control(command),
                    None => control_open = false,
                },
                _ = queue_tick.tick() => {
                    self.poll_worker(Instant::now());
                    if !self.is_active() && (self.exit_when_idle || !control_open) {
                        break;
                    }
                }
                _ = memory_tick.tick() => self.check_memory(Instant::now()),
            }
        }

        tracing::info!("Supervisor loop finished");
    }

    fn handle_control(&mut self, command: Control) {
        let now = Instant::now();
        let result = match command {
            Control::Start { pdf, output } => self.start(&pdf, &output),
            Control::StartImages { images, output } => self.start_images(&images, &output),
            Control::Stop => {
                self.stop(now);
                Ok(())
            }
        };
        if let Err(e) = result {
            self.reject(e);
        }
    }
}
