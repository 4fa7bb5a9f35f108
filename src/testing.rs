//! Test doubles: a synthetic scanned document whose page images encode
//! which tables, rows and cells they contain, plus scripted model backends
//! that read those encodings back.
//!
//! Layout of a synthetic page (400x300, white):
//! - pixel (0,0) carries the page index in its red channel (detector key);
//! - table `t` occupies `(10, 10+140t)..(390, 130+140t)`, filled with the
//!   table's key colour `[key, 0, 0]` (structure key, read at crop (0,0));
//! - each cell interior is painted `[key, 20r+1, 20c+1]` (OCR key).

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use crate::pipeline::extraction::{
    BoundingBox, Capabilities, CapabilityLoader, Detection, ExtractionError, StructureRecognizer,
    TableDetector, TextRecognizer, LABEL_COLUMN, LABEL_ROW, LABEL_TABLE,
};
use crate::pipeline::source::ImageDirSource;
use crate::supervisor::protocol::WorkerMessage;

const PAGE_WIDTH: u32 = 400;
const PAGE_HEIGHT: u32 = 300;
const TABLE_WIDTH: u32 = 380;
const TABLE_HEIGHT: u32 = 120;
const TABLE_MARGIN: u32 = 10;
const TABLE_STRIDE: u32 = 140;
const CELL_INSET: u32 = 2;

/// Collects every message passed to the returned closure.
pub fn collect_messages() -> (
    impl Fn(WorkerMessage) + Send + Sync + 'static,
    Arc<Mutex<Vec<WorkerMessage>>>,
) {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();
    let emit = move |m: WorkerMessage| sink.lock().unwrap().push(m);
    (emit, messages)
}

/// Fill the `(x, y, width, height)` rectangle with one colour.
pub fn paint_cell(image: &mut RgbImage, rect: (u32, u32, u32, u32), color: [u8; 3]) {
    let (x, y, w, h) = rect;
    for py in y..(y + h).min(image.height()) {
        for px in x..(x + w).min(image.width()) {
            image.put_pixel(px, py, Rgb(color));
        }
    }
}

/// OCR double: returns the text registered for the colour at the centre of
/// the cell image; unknown colours fail.
#[derive(Debug, Clone, Default)]
pub struct ColorOcr {
    texts: HashMap<[u8; 3], String>,
}

impl ColorOcr {
    pub fn new(entries: &[([u8; 3], &str)]) -> Self {
        Self {
            texts: entries
                .iter()
                .map(|(color, text)| (*color, text.to_string()))
                .collect(),
        }
    }
}

impl TextRecognizer for ColorOcr {
    fn recognize_text(&self, cell: &RgbImage) -> Result<String, ExtractionError> {
        let (w, h) = cell.dimensions();
        if w == 0 || h == 0 {
            return Err(ExtractionError::OcrProcessing("empty cell".into()));
        }
        let color = cell.get_pixel(w / 2, h / 2).0;
        self.texts
            .get(&color)
            .cloned()
            .ok_or_else(|| ExtractionError::OcrProcessing(format!("unreadable cell {color:?}")))
    }
}

// ═══════════════════════════════════════════════════════════
// Synthetic document
// ═══════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct SyntheticTable {
    cells: Vec<Vec<String>>,
    rows_only: bool,
    failing: HashSet<(usize, usize)>,
    score: f32,
}

impl SyntheticTable {
    pub fn new(cells: Vec<Vec<&str>>) -> Self {
        Self {
            cells: cells
                .into_iter()
                .map(|row| row.into_iter().map(str::to_string).collect())
                .collect(),
            rows_only: false,
            failing: HashSet::new(),
            score: 0.95,
        }
    }

    /// A table whose structure model finds rows but no columns.
    pub fn rows_only(rows: usize) -> Self {
        let mut table = Self::new(vec![vec!["?"]; rows]);
        table.rows_only = true;
        table
    }

    /// OCR of this cell fails.
    pub fn failing_cell(mut self, row: usize, column: usize) -> Self {
        self.failing.insert((row, column));
        self
    }

    /// Detection confidence of the table region.
    pub fn with_score(mut self, score: f32) -> Self {
        self.score = score;
        self
    }

    fn dims(&self) -> (u32, u32) {
        let rows = self.cells.len().max(1) as u32;
        let cols = self.cells.iter().map(Vec::len).max().unwrap_or(1).max(1) as u32;
        (rows, cols)
    }

    fn cell_size(&self) -> (u32, u32) {
        let (rows, cols) = self.dims();
        (TABLE_WIDTH / cols, TABLE_HEIGHT / rows)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyntheticPage {
    tables: Vec<SyntheticTable>,
}

impl SyntheticPage {
    /// At most two tables fit on a page.
    pub fn with_tables(tables: Vec<SyntheticTable>) -> Self {
        assert!(tables.len() <= 2, "synthetic pages hold at most two tables");
        Self { tables }
    }

    pub fn blank() -> Self {
        Self::default()
    }
}

#[derive(Debug, Clone)]
pub struct SyntheticDocument {
    pages: Vec<SyntheticPage>,
}

impl SyntheticDocument {
    pub fn new(pages: Vec<SyntheticPage>) -> Self {
        assert!(pages.len() < 255);
        Self { pages }
    }

    /// `(page index, table index, table)` with a document-unique key per table.
    fn tables(&self) -> Vec<(usize, usize, u8, &SyntheticTable)> {
        let mut out = Vec::new();
        for (p, page) in self.pages.iter().enumerate() {
            for (t, table) in page.tables.iter().enumerate() {
                let key = out.len() as u8 + 1;
                out.push((p, t, key, table));
            }
        }
        out
    }

    fn table_region(table_idx: usize) -> (u32, u32, u32, u32) {
        (
            TABLE_MARGIN,
            TABLE_MARGIN + table_idx as u32 * TABLE_STRIDE,
            TABLE_WIDTH,
            TABLE_HEIGHT,
        )
    }

    fn cell_color(key: u8, row: usize, column: usize) -> [u8; 3] {
        [key, row as u8 * 20 + 1, column as u8 * 20 + 1]
    }

    fn render_page(&self, page_idx: usize) -> RgbImage {
        let mut image = RgbImage::from_pixel(PAGE_WIDTH, PAGE_HEIGHT, Rgb([255, 255, 255]));
        image.put_pixel(0, 0, Rgb([page_idx as u8, 0, 0]));

        for (p, t, key, table) in self.tables() {
            if p != page_idx {
                continue;
            }
            let (tx, ty, tw, th) = Self::table_region(t);
            paint_cell(&mut image, (tx, ty, tw, th), [key, 0, 0]);

            let (cell_w, cell_h) = table.cell_size();
            for (r, row) in table.cells.iter().enumerate() {
                for c in 0..row.len() {
                    let x = tx + c as u32 * cell_w + CELL_INSET;
                    let y = ty + r as u32 * cell_h + CELL_INSET;
                    let rect = (x, y, cell_w - 2 * CELL_INSET, cell_h - 2 * CELL_INSET);
                    paint_cell(&mut image, rect, Self::cell_color(key, r, c));
                }
            }
        }
        image
    }

    /// Write the pages as `page-<n>.png` into a fresh temp dir.
    pub fn write_images(&self) -> (TempDir, ImageDirSource) {
        let dir = tempfile::tempdir().unwrap();
        for idx in 0..self.pages.len() {
            self.render_page(idx)
                .save(dir.path().join(format!("page-{}.png", idx + 1)))
                .unwrap();
        }
        let source = ImageDirSource::new(dir.path());
        (dir, source)
    }

    /// Scripted detector, structure recogniser and OCR for this document.
    pub fn capabilities(&self) -> Capabilities {
        let mut pages: Vec<Vec<Detection>> = vec![Vec::new(); self.pages.len()];
        let mut structures = HashMap::new();
        let mut texts = Vec::new();

        for (p, t, key, table) in self.tables() {
            let (x, y, w, h) = Self::table_region(t);
            let region = bbox(x, y, x + w, y + h);
            pages[p].push(Detection::new(LABEL_TABLE, table.score, region));

            let (rows, cols) = table.dims();
            let (cell_w, cell_h) = table.cell_size();
            let mut detections: Vec<Detection> = (0..rows)
                .map(|r| Detection::new(LABEL_ROW, 0.9, bbox(0, r * cell_h, TABLE_WIDTH, (r + 1) * cell_h)))
                .collect();
            if !table.rows_only {
                detections.extend((0..cols).map(|c| {
                    Detection::new(LABEL_COLUMN, 0.9, bbox(c * cell_w, 0, (c + 1) * cell_w, TABLE_HEIGHT))
                }));
            }
            detections.reverse();
            structures.insert(key, detections);

            for (r, row) in table.cells.iter().enumerate() {
                for (c, text) in row.iter().enumerate() {
                    if !table.failing.contains(&(r, c)) {
                        texts.push((Self::cell_color(key, r, c), text.clone()));
                    }
                }
            }
        }

        let entries: Vec<([u8; 3], &str)> = texts.iter().map(|(c, t)| (*c, t.as_str())).collect();
        Capabilities {
            detector: Box::new(ScriptedDetector { pages }),
            structure: Box::new(ScriptedStructure { tables: structures }),
            ocr: Box::new(ColorOcr::new(&entries)),
        }
    }
}

fn bbox(x0: u32, y0: u32, x1: u32, y1: u32) -> BoundingBox {
    BoundingBox::new(x0 as f32, y0 as f32, x1 as f32, y1 as f32).unwrap()
}

/// Page 1: 2x2 table `A B / C D`; page 2: blank; page 3: 1x3 table `X Y Z`.
pub fn three_page_document() -> SyntheticDocument {
    SyntheticDocument::new(vec![
        SyntheticPage::with_tables(vec![SyntheticTable::new(vec![
            vec!["A", "B"],
            vec!["C", "D"],
        ])]),
        SyntheticPage::blank(),
        SyntheticPage::with_tables(vec![SyntheticTable::new(vec![vec!["X", "Y", "Z"]])]),
    ])
}

struct ScriptedDetector {
    pages: Vec<Vec<Detection>>,
}

impl TableDetector for ScriptedDetector {
    fn detect(&mut self, page: &RgbImage) -> Result<Vec<Detection>, ExtractionError> {
        let idx = page.get_pixel(0, 0).0[0] as usize;
        self.pages
            .get(idx)
            .cloned()
            .ok_or_else(|| ExtractionError::Inference(format!("unknown page {idx}")))
    }
}

struct ScriptedStructure {
    tables: HashMap<u8, Vec<Detection>>,
}

impl StructureRecognizer for ScriptedStructure {
    fn recognize(&mut self, table: &RgbImage) -> Result<Vec<Detection>, ExtractionError> {
        let key = table.get_pixel(0, 0).0[0];
        Ok(self.tables.get(&key).cloned().unwrap_or_default())
    }
}

// ═══════════════════════════════════════════════════════════
// Loaders
// ═══════════════════════════════════════════════════════════

pub struct SyntheticLoader {
    document: SyntheticDocument,
    page_delay: Duration,
}

impl SyntheticLoader {
    pub fn new(document: SyntheticDocument) -> Self {
        Self {
            document,
            page_delay: Duration::ZERO,
        }
    }

    /// Make every detector call take `delay`, so a page stays in progress
    /// long enough to interfere with.
    pub fn with_page_delay(mut self, delay: Duration) -> Self {
        self.page_delay = delay;
        self
    }
}

struct SlowDetector {
    inner: Box<dyn TableDetector + Send>,
    delay: Duration,
}

impl TableDetector for SlowDetector {
    fn detect(&mut self, page: &RgbImage) -> Result<Vec<Detection>, ExtractionError> {
        std::thread::sleep(self.delay);
        self.inner.detect(page)
    }
}

impl CapabilityLoader for SyntheticLoader {
    fn describe(&self) -> String {
        "synthetic".to_string()
    }

    fn load(&self) -> Result<Capabilities, ExtractionError> {
        let mut capabilities = self.document.capabilities();
        if !self.page_delay.is_zero() {
            capabilities.detector = Box::new(SlowDetector {
                inner: capabilities.detector,
                delay: self.page_delay,
            });
        }
        Ok(capabilities)
    }
}

pub struct FailingLoader;

impl CapabilityLoader for FailingLoader {
    fn describe(&self) -> String {
        "failing".to_string()
    }

    fn load(&self) -> Result<Capabilities, ExtractionError> {
        Err(ExtractionError::ModelInit("weights missing".into()))
    }
}
