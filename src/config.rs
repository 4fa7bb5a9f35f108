use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Application-level constants
pub const APP_NAME: &str = "TableGrid";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Detections below this score are not treated as tables.
pub const TABLE_CONFIDENCE_THRESHOLD: f32 = 0.85;

/// Row/column boxes below this score are discarded.
pub const STRUCTURE_CONFIDENCE_THRESHOLD: f32 = 0.7;

/// Memory usage (percent) above which the worker is recycled.
pub const MEMORY_THRESHOLD_PERCENT: f32 = 85.0;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Invalid setting: {0}")]
    Invalid(String),
}

/// Get the application data directory.
/// ~/TableGrid/ on all platforms, falling back to the working directory
/// when no home directory can be determined.
pub fn app_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_NAME)
}

/// Directory holding the ONNX table models.
pub fn models_dir() -> PathBuf {
    app_data_dir().join("models")
}

/// Root of the per-document page image caches.
pub fn page_cache_dir() -> PathBuf {
    app_data_dir().join("page_cache")
}

/// Default location of the plain-text audit log.
pub fn audit_log_path() -> PathBuf {
    app_data_dir().join("extraction_log.txt")
}

pub fn default_log_filter() -> &'static str {
    "tablegrid=info,tablegrid_lib=info,warn"
}

/// Every tunable of the extraction pipeline and its supervisor.
///
/// Loaded from an optional JSON file; any field left out keeps its default.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractionSettings {
    /// Minimum detection score for a table region.
    pub table_threshold: f32,
    /// Minimum score for row/column boxes inside a table.
    pub structure_threshold: f32,
    /// System memory usage (percent) that triggers a worker restart.
    pub memory_threshold_percent: f32,
    /// Interval between memory probes.
    pub memory_poll_secs: u64,
    /// Interval between drains of the worker message queue.
    pub queue_poll_millis: u64,
    /// Pause between a memory-triggered exit and the respawn.
    pub restart_delay_secs: u64,
    /// How long a worker may linger after reporting DONE/ERROR.
    pub finish_join_secs: u64,
    /// How long a worker may run after being asked to stop.
    pub stop_grace_secs: u64,
    /// Tesseract language list, e.g. "eng+ind".
    pub ocr_languages: String,
    /// Tesseract page segmentation mode (7 = single text line).
    pub ocr_page_segmentation: u8,
    pub tesseract_bin: PathBuf,
    pub pdftoppm_bin: PathBuf,
    /// Resolution used when rasterising PDF pages.
    pub render_dpi: u32,
    pub models_dir: PathBuf,
    pub page_cache_dir: PathBuf,
    pub audit_log: PathBuf,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            table_threshold: TABLE_CONFIDENCE_THRESHOLD,
            structure_threshold: STRUCTURE_CONFIDENCE_THRESHOLD,
            memory_threshold_percent: MEMORY_THRESHOLD_PERCENT,
            memory_poll_secs: 2,
            queue_poll_millis: 100,
            restart_delay_secs: 5,
            finish_join_secs: 3,
            stop_grace_secs: 120,
            ocr_languages: "eng+ind".to_string(),
            ocr_page_segmentation: 7,
            tesseract_bin: PathBuf::from("tesseract"),
            pdftoppm_bin: PathBuf::from("pdftoppm"),
            render_dpi: 200,
            models_dir: models_dir(),
            page_cache_dir: page_cache_dir(),
            audit_log: audit_log_path(),
        }
    }
}

impl ExtractionSettings {
    /// Load settings from a JSON file, defaulting missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("table_threshold", self.table_threshold),
            ("structure_threshold", self.structure_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be within 0.0-1.0, got {value}"
                )));
            }
        }
        if !(0.0..=100.0).contains(&self.memory_threshold_percent) {
            return Err(ConfigError::Invalid(format!(
                "memory_threshold_percent must be within 0-100, got {}",
                self.memory_threshold_percent
            )));
        }
        if self.memory_poll_secs == 0 || self.queue_poll_millis == 0 {
            return Err(ConfigError::Invalid("poll intervals must be non-zero".into()));
        }
        Ok(())
    }

    pub fn memory_poll_interval(&self) -> Duration {
        Duration::from_secs(self.memory_poll_secs)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_millis)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub fn finish_join_grace(&self) -> Duration {
        Duration::from_secs(self.finish_join_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }
}
