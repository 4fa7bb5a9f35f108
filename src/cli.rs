//! Command line: the presentation layer for the supervisor, plus the hidden
//! `worker` entry point each worker process is spawned with.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use clap::{Parser, Subcommand};

use crate::config::{ConfigError, ExtractionSettings};
use crate::pipeline::checkpoint::resume_after;
use crate::pipeline::source::{ImageDirSource, PageSource};
use crate::pipeline::store::{CsvResultStore, ResultStore};
use crate::supervisor::protocol::write_message;
use crate::supervisor::{
    run_worker, BackendLoader, Control, FileStopSignal, ProcessLauncher, Supervisor,
    SupervisorEvent, SysinfoProbe, ThreadLauncher, WorkerExit, WorkerJob, WorkerLauncher,
    WorkerMessage,
};

#[derive(Parser, Debug)]
#[command(name = "tablegrid")]
#[command(about = "Extract tables from scanned pages into a resumable CSV dataset")]
#[command(version)]
pub struct Cli {
    /// JSON settings file; fields left out keep their defaults
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Extract every table of a document, resuming where a previous run stopped
    Run {
        /// PDF to rasterise into the page cache
        #[arg(long, required_unless_present = "images", conflicts_with = "images")]
        pdf: Option<PathBuf>,

        /// Directory of page images to use instead of a PDF
        #[arg(long)]
        images: Option<PathBuf>,

        /// CSV file the tables are appended to
        #[arg(long)]
        output: PathBuf,

        /// Run the worker on a thread instead of a child process (memory is
        /// not returned to the OS on restart)
        #[arg(long)]
        in_process: bool,
    },

    /// One worker incarnation; spawned by `run`
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        images: PathBuf,

        #[arg(long)]
        output: PathBuf,

        #[arg(long, default_value_t = 1)]
        start_page: u32,

        #[arg(long)]
        stop_file: PathBuf,

        /// Settings as inline JSON, passed down by the supervisor
        #[arg(long)]
        settings: Option<String>,
    },

    /// Print where the next run would start
    ResumePoint {
        #[arg(long)]
        images: PathBuf,

        #[arg(long)]
        output: PathBuf,
    },
}

pub fn execute(cli: Cli) -> ExitCode {
    let settings = match load_settings(cli.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::error!(error = %e, "Settings rejected");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Command::Run {
            pdf,
            images,
            output,
            in_process,
        } => {
            let control = match (pdf, images) {
                (Some(pdf), _) => Control::Start { pdf, output },
                (None, Some(images)) => Control::StartImages { images, output },
                (None, None) => {
                    tracing::error!("Either --pdf or --images is required");
                    return ExitCode::FAILURE;
                }
            };
            run_supervised(settings, control, in_process)
        }
        Command::Worker {
            images,
            output,
            start_page,
            stop_file,
            settings: inline,
        } => {
            let settings = match inline {
                Some(json) => match serde_json::from_str::<ExtractionSettings>(&json) {
                    Ok(s) => s,
                    Err(e) => {
                        tracing::error!(error = %e, "Invalid worker settings");
                        return ExitCode::FAILURE;
                    }
                },
                None => settings,
            };
            let job = WorkerJob {
                images_dir: images,
                output,
                start_page,
            };
            worker_process(&job, &settings, &FileStopSignal::new(stop_file))
        }
        Command::ResumePoint { images, output } => print_resume_point(&images, &output),
    }
}

fn load_settings(path: Option<&Path>) -> Result<ExtractionSettings, ConfigError> {
    match path {
        Some(path) => ExtractionSettings::load(path),
        None => Ok(ExtractionSettings::default()),
    }
}

// ═══════════════════════════════════════════════════════════
// run
// ═══════════════════════════════════════════════════════════

fn run_supervised(settings: ExtractionSettings, start: Control, in_process: bool) -> ExitCode {
    let launcher: Box<dyn WorkerLauncher> = if in_process {
        Box::new(ThreadLauncher::new(
            Arc::new(BackendLoader::new(settings.clone())),
            settings.clone(),
        ))
    } else {
        match ProcessLauncher::current_exe(settings.clone()) {
            Ok(launcher) => Box::new(launcher),
            Err(e) => {
                tracing::error!(error = %e, "Cannot locate own executable");
                return ExitCode::FAILURE;
            }
        }
    };

    let failed = Arc::new(AtomicBool::new(false));
    let sink_failed = failed.clone();
    let sink = Box::new(move |event: SupervisorEvent| {
        if matches!(event, SupervisorEvent::Error(_)) {
            sink_failed.store(true, Ordering::Relaxed);
        }
        render_event(event);
    });

    let mut supervisor = Supervisor::new(settings, launcher, Box::new(SysinfoProbe::new()), sink)
        .exit_when_idle(true);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Failed to start async runtime");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let _ = tx.send(start);

        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupt received, stopping after the current page");
                if tx.send(Control::Stop).is_err() {
                    break;
                }
            }
        });

        supervisor.run(rx).await;
    });

    if failed.load(Ordering::Relaxed) {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

fn render_event(event: SupervisorEvent) {
    match event {
        SupervisorEvent::Log(text) => tracing::info!("{text}"),
        SupervisorEvent::Progress { page, total } => {
            tracing::info!(page, total, "Progress: page {page}/{total}");
        }
        SupervisorEvent::Done(text) => tracing::info!("{text}"),
        SupervisorEvent::Error(text) => tracing::error!("{text}"),
        SupervisorEvent::MemoryUsage(usage) => tracing::debug!(usage, "Memory usage {usage:.1}%"),
        SupervisorEvent::RestartScheduled { delay } => {
            tracing::warn!(delay_secs = delay.as_secs(), "Worker restart scheduled");
        }
        SupervisorEvent::Idle => tracing::debug!("Idle"),
    }
}

// ═══════════════════════════════════════════════════════════
// worker
// ═══════════════════════════════════════════════════════════

fn worker_process(job: &WorkerJob, settings: &ExtractionSettings, stop: &FileStopSignal) -> ExitCode {
    let stdout = Mutex::new(std::io::stdout());
    let emit = |message: WorkerMessage| {
        let Ok(mut out) = stdout.lock() else {
            return;
        };
        if let Err(e) = write_message(&mut *out, &message) {
            tracing::warn!(error = %e, "Lost connection to supervisor");
        }
    };

    let exit = run_worker(job, &BackendLoader::new(settings.clone()), settings, stop, &emit);

    if let Ok(mut out) = stdout.lock() {
        let _ = out.flush();
    }
    match exit {
        WorkerExit::Failed => ExitCode::FAILURE,
        WorkerExit::Completed { .. } | WorkerExit::Stopped { .. } => ExitCode::SUCCESS,
    }
}

// ═══════════════════════════════════════════════════════════
// resume-point
// ═══════════════════════════════════════════════════════════

/// Read-only: a corrupt store is reported, never moved aside.
fn print_resume_point(images: &Path, output: &Path) -> ExitCode {
    let total = match ImageDirSource::new(images).page_count() {
        Ok(total) => total,
        Err(e) => {
            tracing::error!(error = %e, "Cannot list pages");
            return ExitCode::FAILURE;
        }
    };
    match CsvResultStore::new(output).last_committed_page() {
        Ok(last) => {
            println!("{}", resume_after(last, total));
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(error = %e, "Result store unreadable; a run would restart from page 1");
            ExitCode::FAILURE
        }
    }
}
