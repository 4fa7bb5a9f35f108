//! The extraction worker: one incarnation walks the remaining pages in
//! order, checking the stop flag before each one.
//!
//! Everything that escapes the page loop (capability load failure, page
//! listing failure, a store append failure, a panic) ends the incarnation
//! with an `ERROR` message instead of a silent crash.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;

use thiserror::Error;

use super::protocol::WorkerMessage;
use super::stop::StopSignal;
use crate::config::ExtractionSettings;
use crate::pipeline::extraction::{
    Capabilities, CapabilityLoader, ExtractionError, PageExtractor, TesseractCli,
};
use crate::pipeline::source::{ImageDirSource, PageSource, SourceError};
use crate::pipeline::store::{CsvResultStore, StoreError};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("{0}")]
    Extraction(#[from] ExtractionError),

    #[error("Page source: {0}")]
    Source(#[from] SourceError),

    #[error("Result store: {0}")]
    Store(#[from] StoreError),
}

/// What one worker incarnation is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerJob {
    pub images_dir: PathBuf,
    pub output: PathBuf,
    /// 1-based first page to process.
    pub start_page: u32,
}

/// How an incarnation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Completed { pages: usize },
    /// Stopped at a page boundary; `next_page` was not started.
    Stopped { next_page: u32 },
    Failed,
}

/// Run one worker incarnation to completion, early stop or failure.
///
/// Always emits exactly one terminal message (`DONE` or `ERROR`) last.
pub fn run_worker(
    job: &WorkerJob,
    loader: &dyn CapabilityLoader,
    settings: &ExtractionSettings,
    stop: &dyn StopSignal,
    emit: &dyn Fn(WorkerMessage),
) -> WorkerExit {
    let outcome = catch_unwind(AssertUnwindSafe(|| run_pages(job, loader, settings, stop, emit)));

    match outcome {
        Ok(Ok(exit)) => {
            let text = match exit {
                WorkerExit::Stopped { next_page } => {
                    format!("Worker stopped before page {next_page}.")
                }
                _ => "Worker finished.".to_string(),
            };
            emit(WorkerMessage::done(text));
            exit
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "Worker run failed");
            emit(WorkerMessage::error(format!("Worker error: {e}")));
            WorkerExit::Failed
        }
        Err(panic) => {
            let reason = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(%reason, "Worker panicked");
            emit(WorkerMessage::error(format!("Worker panicked: {reason}")));
            WorkerExit::Failed
        }
    }
}

fn run_pages(
    job: &WorkerJob,
    loader: &dyn CapabilityLoader,
    settings: &ExtractionSettings,
    stop: &dyn StopSignal,
    emit: &dyn Fn(WorkerMessage),
) -> Result<WorkerExit, WorkerError> {
    emit(WorkerMessage::log("Loading models (new worker process)..."));
    let mut capabilities = loader.load()?;
    emit(WorkerMessage::log(format!(
        "Models loaded in worker ({}).",
        loader.describe()
    )));

    let source = ImageDirSource::new(&job.images_dir);
    let store = CsvResultStore::new(&job.output);
    let pages = source.list_pages()?;
    let total = pages.len();
    let start_index = job.start_page.saturating_sub(1) as usize;

    tracing::info!(
        start_page = job.start_page,
        total_pages = total,
        output = %job.output.display(),
        "Worker starting page loop"
    );

    let mut extractor = PageExtractor::new(&mut capabilities, &source, &store)
        .with_thresholds(settings.table_threshold, settings.structure_threshold);

    let mut processed = 0;
    for page in pages.iter().skip(start_index) {
        if stop.is_raised() {
            tracing::info!(next_page = page.number, "Stop signal observed");
            emit(WorkerMessage::log("Stop signal received. Closing worker."));
            return Ok(WorkerExit::Stopped {
                next_page: page.number,
            });
        }

        emit(WorkerMessage::log(format!(
            "--- Processing page {}/{total} ---",
            page.number
        )));
        extractor.process_page(page, emit)?;
        processed += 1;
    }

    Ok(WorkerExit::Completed { pages: processed })
}

/// Loads the production backends: Table Transformer models for detection and
/// structure, Tesseract for cell text.
#[derive(Debug, Clone)]
pub struct BackendLoader {
    settings: ExtractionSettings,
}

impl BackendLoader {
    pub fn new(settings: ExtractionSettings) -> Self {
        Self { settings }
    }
}

impl CapabilityLoader for BackendLoader {
    fn describe(&self) -> String {
        format!(
            "models: {}, ocr: {} -l {}",
            self.settings.models_dir.display(),
            self.settings.tesseract_bin.display(),
            self.settings.ocr_languages
        )
    }

    #[cfg(feature = "onnx")]
    fn load(&self) -> Result<Capabilities, ExtractionError> {
        use crate::pipeline::extraction::onnx::{TableTransformer, DETECTION_MODEL, STRUCTURE_MODEL};

        let detector = TableTransformer::detection(&self.settings.models_dir.join(DETECTION_MODEL))?;
        let structure = TableTransformer::structure(&self.settings.models_dir.join(STRUCTURE_MODEL))?;
        let ocr = TesseractCli::new(
            &self.settings.tesseract_bin,
            &self.settings.ocr_languages,
            self.settings.ocr_page_segmentation,
        )?;

        Ok(Capabilities {
            detector: Box::new(detector),
            structure: Box::new(structure),
            ocr: Box::new(ocr),
        })
    }

    #[cfg(not(feature = "onnx"))]
    fn load(&self) -> Result<Capabilities, ExtractionError> {
        // Fail on the OCR probe first when it is missing too, so both problems
        // surface in one run.
        TesseractCli::new(
            &self.settings.tesseract_bin,
            &self.settings.ocr_languages,
            self.settings.ocr_page_segmentation,
        )?;
        Err(ExtractionError::BackendUnavailable(
            "this build has no table detection models; rebuild with `--features onnx`".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::ResultStore;
    use crate::supervisor::stop::AtomicStopSignal;
    use crate::testing::{
        collect_messages, three_page_document, FailingLoader, SyntheticLoader,
    };

    const EXPECTED: &str = "page_number,table_on_page,0,1\n1,1,A,B\n1,1,C,D\n3,1,X,Y,Z\n";

    #[test]
    fn full_run_extracts_all_pages_in_order() {
        let doc = three_page_document();
        let (dir, _source) = doc.write_images();
        let output = dir.path().join("out.csv");
        let job = WorkerJob {
            images_dir: dir.path().to_path_buf(),
            output: output.clone(),
            start_page: 1,
        };
        let (emit, messages) = collect_messages();

        let exit = run_worker(
            &job,
            &SyntheticLoader::new(doc),
            &ExtractionSettings::default(),
            &AtomicStopSignal::new(),
            &emit,
        );

        assert_eq!(exit, WorkerExit::Completed { pages: 3 });
        assert_eq!(std::fs::read_to_string(&output).unwrap(), EXPECTED);

        let messages = messages.lock().unwrap();
        let progress: Vec<u32> = messages
            .iter()
            .filter_map(|m| match m {
                WorkerMessage::Progress { page } => Some(*page),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![1, 2, 3]);
        assert_eq!(messages.last(), Some(&WorkerMessage::done("Worker finished.")));
    }

    #[test]
    fn stop_after_first_page_then_resume_matches_single_pass() {
        let doc = three_page_document();
        let (dir, _source) = doc.write_images();
        let output = dir.path().join("out.csv");
        let settings = ExtractionSettings::default();
        let loader = SyntheticLoader::new(doc);

        // Raise the stop flag while page 1 is in flight.
        let stop = std::sync::Arc::new(AtomicStopSignal::new());
        let (collect, messages) = collect_messages();
        let stop_on_progress = {
            let stop = stop.clone();
            move |m: WorkerMessage| {
                if let WorkerMessage::Log { text } = &m {
                    if text.starts_with("--- Processing page 1/") {
                        stop.raise();
                    }
                }
                collect(m);
            }
        };

        let first = WorkerJob {
            images_dir: dir.path().to_path_buf(),
            output: output.clone(),
            start_page: 1,
        };
        let exit = run_worker(&first, &loader, &settings, stop.as_ref(), &stop_on_progress);

        assert_eq!(exit, WorkerExit::Stopped { next_page: 2 });
        assert_eq!(
            std::fs::read_to_string(&output).unwrap(),
            "page_number,table_on_page,0,1\n1,1,A,B\n1,1,C,D\n"
        );
        assert!(messages
            .lock()
            .unwrap()
            .contains(&WorkerMessage::Progress { page: 1 }));

        let store = CsvResultStore::new(&output);
        let resolution = crate::pipeline::checkpoint::resolve_start_page(&store, 3);
        assert_eq!(
            resolution.point,
            crate::pipeline::checkpoint::ResumePoint::Start { page: 2 }
        );

        stop.clear();
        let second = WorkerJob {
            start_page: 2,
            ..first
        };
        let (emit, _) = collect_messages();
        let exit = run_worker(&second, &loader, &settings, stop.as_ref(), &emit);

        assert_eq!(exit, WorkerExit::Completed { pages: 2 });
        assert_eq!(std::fs::read_to_string(&output).unwrap(), EXPECTED);
        assert_eq!(store.last_committed_page().unwrap(), Some(3));
    }

    #[test]
    fn stop_raised_before_start_processes_nothing() {
        let doc = three_page_document();
        let (dir, _source) = doc.write_images();
        let job = WorkerJob {
            images_dir: dir.path().to_path_buf(),
            output: dir.path().join("out.csv"),
            start_page: 1,
        };
        let stop = AtomicStopSignal::new();
        stop.raise();
        let (emit, messages) = collect_messages();

        let exit = run_worker(&job, &SyntheticLoader::new(doc), &ExtractionSettings::default(), &stop, &emit);

        assert_eq!(exit, WorkerExit::Stopped { next_page: 1 });
        assert!(!job.output.exists());
        let messages = messages.lock().unwrap();
        assert!(messages.contains(&WorkerMessage::log("Stop signal received. Closing worker.")));
        assert_eq!(
            messages.last(),
            Some(&WorkerMessage::done("Worker stopped before page 1."))
        );
    }

    #[test]
    fn capability_load_failure_reported_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let job = WorkerJob {
            images_dir: dir.path().to_path_buf(),
            output: dir.path().join("out.csv"),
            start_page: 1,
        };
        let (emit, messages) = collect_messages();

        let exit = run_worker(&job, &FailingLoader, &ExtractionSettings::default(), &AtomicStopSignal::new(), &emit);

        assert_eq!(exit, WorkerExit::Failed);
        let messages = messages.lock().unwrap();
        assert!(matches!(messages.last(), Some(WorkerMessage::Error { text }) if text.contains("weights missing")));
        assert_eq!(messages.iter().filter(|m| m.is_terminal()).count(), 1);
    }

    #[test]
    fn start_page_beyond_document_completes_without_work() {
        let doc = three_page_document();
        let (dir, _source) = doc.write_images();
        let job = WorkerJob {
            images_dir: dir.path().to_path_buf(),
            output: dir.path().join("out.csv"),
            start_page: 4,
        };
        let (emit, _) = collect_messages();

        let exit = run_worker(&job, &SyntheticLoader::new(doc), &ExtractionSettings::default(), &AtomicStopSignal::new(), &emit);

        assert_eq!(exit, WorkerExit::Completed { pages: 0 });
        assert!(!job.output.exists());
    }

    #[cfg(not(feature = "onnx"))]
    #[test]
    fn backend_loader_without_models_fails_descriptively() {
        let settings = ExtractionSettings {
            tesseract_bin: PathBuf::from("/nonexistent/tesseract"),
            ..ExtractionSettings::default()
        };
        let err = BackendLoader::new(settings).load().err().unwrap();
        assert!(matches!(err, ExtractionError::OcrInit(_)));
    }
}
