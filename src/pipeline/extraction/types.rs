use image::RgbImage;
use serde::{Deserialize, Serialize};

use super::ExtractionError;

/// Label the detection model assigns to table regions.
pub const LABEL_TABLE: &str = "table";
/// Label the structure model assigns to row boxes.
pub const LABEL_ROW: &str = "table row";
/// Label the structure model assigns to column boxes.
pub const LABEL_COLUMN: &str = "table column";

/// Axis-aligned box in source-image pixel coordinates.
///
/// Always satisfies `x0 < x1` and `y0 < y1`; the constructors never yield a
/// degenerate box.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x0: f32,
    pub y0: f32,
    pub x1: f32,
    pub y1: f32,
}

impl BoundingBox {
    /// Returns `None` for empty, inverted or non-finite boxes.
    pub fn new(x0: f32, y0: f32, x1: f32, y1: f32) -> Option<Self> {
        let finite = [x0, y0, x1, y1].iter().all(|v| v.is_finite());
        (finite && x0 < x1 && y0 < y1).then_some(Self { x0, y0, x1, y1 })
    }

    /// The cell where `row` and `column` cross: horizontal extent of the
    /// column, vertical extent of the row. Valid inputs give a valid cell.
    pub fn cell(row: &BoundingBox, column: &BoundingBox) -> Self {
        Self {
            x0: column.x0,
            y0: row.y0,
            x1: column.x1,
            y1: row.y1,
        }
    }

    pub fn width(&self) -> f32 {
        self.x1 - self.x0
    }

    pub fn height(&self) -> f32 {
        self.y1 - self.y0
    }

    /// Integer pixel rectangle `(x, y, width, height)` of this box inside an
    /// image of the given size. Coordinates are rounded, then clamped.
    /// `None` when nothing of the box lies inside the image.
    pub fn pixel_rect(&self, image_width: u32, image_height: u32) -> Option<(u32, u32, u32, u32)> {
        let clamp = |v: f32, max: u32| v.round().clamp(0.0, max as f32) as u32;
        let x0 = clamp(self.x0, image_width);
        let y0 = clamp(self.y0, image_height);
        let x1 = clamp(self.x1, image_width);
        let y1 = clamp(self.y1, image_height);
        (x1 > x0 && y1 > y0).then_some((x0, y0, x1 - x0, y1 - y0))
    }
}

/// One labelled box produced by a detection or structure model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub score: f32,
    pub bbox: BoundingBox,
}

impl Detection {
    pub fn new(label: &str, score: f32, bbox: BoundingBox) -> Self {
        Self {
            label: label.to_string(),
            score,
            bbox,
        }
    }

    /// Label match plus strict score threshold.
    pub fn is(&self, label: &str, threshold: f32) -> bool {
        self.label == label && self.score > threshold
    }
}

/// The text grid extracted from one table region, ready for persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRecord {
    pub page_number: u32,
    /// 1-based, in detection order.
    pub table_on_page: u32,
    pub rows: Vec<Vec<String>>,
}

impl TableRecord {
    pub fn column_count(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }
}

/// Locates table regions on a full page image.
pub trait TableDetector {
    fn detect(&mut self, page: &RgbImage) -> Result<Vec<Detection>, ExtractionError>;
}

/// Finds row and column boxes inside a cropped table image.
pub trait StructureRecognizer {
    fn recognize(&mut self, table: &RgbImage) -> Result<Vec<Detection>, ExtractionError>;
}

/// Reads the text of one cropped cell image.
pub trait TextRecognizer {
    fn recognize_text(&self, cell: &RgbImage) -> Result<String, ExtractionError>;
}

/// The model/OCR instances owned by one worker incarnation.
pub struct Capabilities {
    pub detector: Box<dyn TableDetector + Send>,
    pub structure: Box<dyn StructureRecognizer + Send>,
    pub ocr: Box<dyn TextRecognizer + Send>,
}

/// Builds the capabilities once per worker incarnation.
pub trait CapabilityLoader: Send + Sync {
    /// Short description for log lines (e.g. device, model directory).
    fn describe(&self) -> String;

    fn load(&self) -> Result<Capabilities, ExtractionError>;
}
