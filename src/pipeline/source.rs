//! Page source: an ordered, re-listable set of page images on disk.
//!
//! A PDF is rasterised once into a per-document cache directory with
//! poppler's `pdftoppm`; later runs reuse the cached images so page numbering
//! never shifts between worker incarnations.

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;

use image::RgbImage;
use regex::Regex;
use thiserror::Error;

const PAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg"];

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot decode page image {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error("PDF rasterisation failed: {0}")]
    Render(String),

    #[error("PDF produced no page images: {0}")]
    NoPages(PathBuf),
}

/// One page of the document, 1-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRef {
    pub number: u32,
    pub path: PathBuf,
}

impl PageRef {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }
}

/// Ordered page listing. Listing the same document twice yields the same pages.
pub trait PageSource: Send + Sync {
    fn list_pages(&self) -> Result<Vec<PageRef>, SourceError>;

    fn load_page(&self, page: &PageRef) -> Result<RgbImage, SourceError>;

    fn page_count(&self) -> Result<usize, SourceError> {
        Ok(self.list_pages()?.len())
    }
}

/// Page images stored as files in one directory.
#[derive(Debug, Clone)]
pub struct ImageDirSource {
    dir: PathBuf,
}

impl ImageDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl PageSource for ImageDirSource {
    fn list_pages(&self) -> Result<Vec<PageRef>, SourceError> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && is_page_image(p))
            .collect();

        files.sort_by(|a, b| natural_cmp(&file_name_of(a), &file_name_of(b)));

        Ok(files
            .into_iter()
            .enumerate()
            .map(|(i, path)| PageRef {
                number: i as u32 + 1,
                path,
            })
            .collect())
    }

    fn load_page(&self, page: &PageRef) -> Result<RgbImage, SourceError> {
        let image = image::open(&page.path).map_err(|source| SourceError::Decode {
            path: page.path.clone(),
            source,
        })?;
        Ok(image.to_rgb8())
    }
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn is_page_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| PAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn chunk_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\d+|\D+").expect("static regex"))
}

/// Compare file names with digit runs ordered numerically ("page-9" < "page-10").
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let pattern = chunk_pattern();
    let mut left = pattern.find_iter(a).map(|m| m.as_str());
    let mut right = pattern.find_iter(b).map(|m| m.as_str());

    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l.parse::<u128>(), r.parse::<u128>()) {
                    (Ok(ln), Ok(rn)) => ln.cmp(&rn).then_with(|| l.len().cmp(&r.len())),
                    _ => l.cmp(r),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

/// Page-image cache directory for one PDF.
pub fn cache_dir_for(cache_root: &Path, pdf: &Path) -> PathBuf {
    let stem = pdf
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    cache_root.join(stem)
}

/// Rasterises PDFs into page images with poppler's `pdftoppm`.
#[derive(Debug, Clone)]
pub struct PdfRasterizer {
    binary: PathBuf,
    dpi: u32,
}

impl PdfRasterizer {
    pub fn new(binary: &Path, dpi: u32) -> Self {
        Self {
            binary: binary.to_path_buf(),
            dpi,
        }
    }

    /// Ensure `cache_dir` holds the page images of `pdf`.
    ///
    /// Existing images are reused untouched; only an empty cache triggers
    /// rasterisation. Returns the number of pages available.
    pub fn prepare(&self, pdf: &Path, cache_dir: &Path) -> Result<usize, SourceError> {
        std::fs::create_dir_all(cache_dir)?;
        let source = ImageDirSource::new(cache_dir);

        let existing = source.page_count()?;
        if existing > 0 {
            tracing::info!(pages = existing, dir = %cache_dir.display(), "Reusing cached page images");
            return Ok(existing);
        }

        tracing::info!(pdf = %pdf.display(), dir = %cache_dir.display(), dpi = self.dpi, "Rasterising PDF");

        let output = Command::new(&self.binary)
            .arg("-png")
            .arg("-r")
            .arg(self.dpi.to_string())
            .arg(pdf)
            .arg(cache_dir.join("page"))
            .output()
            .map_err(|e| SourceError::Render(format!("{}: {e}", self.binary.display())))?;

        if !output.status.success() {
            return Err(SourceError::Render(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let pages = source.page_count()?;
        if pages == 0 {
            return Err(SourceError::NoPages(pdf.to_path_buf()));
        }
        Ok(pages)
    }
}
