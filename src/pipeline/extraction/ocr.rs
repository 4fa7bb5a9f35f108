use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use image::{ImageFormat, RgbImage};

use super::types::TextRecognizer;
use super::ExtractionError;

/// Tesseract OCR through its command-line binary.
///
/// Each cell crop is piped to `tesseract stdin stdout` as PNG. The binary is
/// probed once at construction so a missing install fails the worker load
/// instead of silently blanking every cell.
#[derive(Debug, Clone)]
pub struct TesseractCli {
    binary: PathBuf,
    languages: String,
    page_segmentation: u8,
}

impl TesseractCli {
    pub fn new(binary: &Path, languages: &str, page_segmentation: u8) -> Result<Self, ExtractionError> {
        let probe = Command::new(binary)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|e| ExtractionError::OcrInit(format!("{}: {e}", binary.display())))?;

        if !probe.success() {
            return Err(ExtractionError::OcrInit(format!(
                "{} --version exited with {probe}",
                binary.display()
            )));
        }

        tracing::info!(
            binary = %binary.display(),
            languages,
            psm = page_segmentation,
            "Tesseract OCR ready"
        );

        Ok(Self {
            binary: binary.to_path_buf(),
            languages: languages.to_string(),
            page_segmentation,
        })
    }

    fn args(&self) -> Vec<String> {
        vec![
            "stdin".to_string(),
            "stdout".to_string(),
            "--psm".to_string(),
            self.page_segmentation.to_string(),
            "-l".to_string(),
            self.languages.clone(),
        ]
    }
}

impl TextRecognizer for TesseractCli {
    fn recognize_text(&self, cell: &RgbImage) -> Result<String, ExtractionError> {
        let mut png = Cursor::new(Vec::new());
        cell.write_to(&mut png, ImageFormat::Png)?;

        let mut child = Command::new(&self.binary)
            .args(self.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(png.get_ref())?;
        }

        let output = child.wait_with_output()?;
        if !output.status.success() {
            return Err(ExtractionError::OcrProcessing(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
