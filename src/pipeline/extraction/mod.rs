pub mod types;
pub mod geometry;
pub mod cell;
pub mod ocr;
pub mod page;
#[cfg(feature = "onnx")]
pub mod onnx;

pub use types::*;
pub use geometry::{build_cell_grid, partition_structure, TableStructure};
pub use cell::extract_cell_text;
pub use ocr::TesseractCli;
pub use page::{PageExtractor, PageOutcome};

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Model not found at: {0}")]
    ModelNotFound(PathBuf),

    #[error("Model initialization failed: {0}")]
    ModelInit(String),

    #[error("Model inference failed: {0}")]
    Inference(String),

    #[error("OCR engine unavailable: {0}")]
    OcrInit(String),

    #[error("OCR processing failed: {0}")]
    OcrProcessing(String),

    #[error("Detection backend unavailable: {0}")]
    BackendUnavailable(String),
}
