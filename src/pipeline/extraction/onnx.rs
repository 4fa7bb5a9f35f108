//! Table Transformer (DETR) models through ONNX Runtime.
//!
//! One type serves both the detection and the structure-recognition export;
//! they differ only in label map and resize limits. Post-processing follows
//! DETR: softmax over classes, drop the trailing "no object" class, convert
//! normalised `(cx, cy, w, h)` boxes to corners in source-image pixels.

use std::path::Path;

use image::imageops::FilterType;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;

use super::types::{BoundingBox, Detection, StructureRecognizer, TableDetector};
use super::ExtractionError;

/// File name of the detection export inside the models directory.
pub const DETECTION_MODEL: &str = "table-detection.onnx";
/// File name of the structure-recognition export inside the models directory.
pub const STRUCTURE_MODEL: &str = "table-structure.onnx";

const DETECTION_LABELS: &[&str] = &["table", "table rotated"];
const STRUCTURE_LABELS: &[&str] = &[
    "table",
    "table column",
    "table row",
    "table column header",
    "table projected row header",
    "table spanning cell",
];

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Resize limits: shortest edge target, longest edge cap.
#[derive(Debug, Clone, Copy)]
struct ResizeLimits {
    shortest: u32,
    longest: u32,
}

pub struct TableTransformer {
    session: Session,
    labels: &'static [&'static str],
    limits: ResizeLimits,
}

impl TableTransformer {
    /// Load the table detection model.
    pub fn detection(model_path: &Path) -> Result<Self, ExtractionError> {
        Self::load(
            model_path,
            DETECTION_LABELS,
            ResizeLimits {
                shortest: 800,
                longest: 1333,
            },
        )
    }

    /// Load the table structure-recognition model.
    pub fn structure(model_path: &Path) -> Result<Self, ExtractionError> {
        Self::load(
            model_path,
            STRUCTURE_LABELS,
            ResizeLimits {
                shortest: 800,
                longest: 1000,
            },
        )
    }

    fn load(
        model_path: &Path,
        labels: &'static [&'static str],
        limits: ResizeLimits,
    ) -> Result<Self, ExtractionError> {
        if !model_path.exists() {
            return Err(ExtractionError::ModelNotFound(model_path.to_path_buf()));
        }

        let session = Session::builder()
            .map_err(|e: ort::Error| ExtractionError::ModelInit(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e: ort::Error| ExtractionError::ModelInit(format!("ONNX load failed: {e}")))?;

        tracing::info!(model = %model_path.display(), labels = labels.len(), "Table Transformer loaded");

        Ok(Self {
            session,
            labels,
            limits,
        })
    }

    fn infer(&mut self, image: &RgbImage) -> Result<Vec<Detection>, ExtractionError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Ok(Vec::new());
        }

        let input = preprocess(image, self.limits);
        let tensor = TensorRef::from_array_view(input.view())
            .map_err(|e| ExtractionError::Inference(e.to_string()))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor])
            .map_err(|e| ExtractionError::Inference(e.to_string()))?;
        if outputs.len() < 2 {
            return Err(ExtractionError::Inference(format!(
                "expected logits and pred_boxes, model returned {} output(s)",
                outputs.len()
            )));
        }

        let (logit_shape, logits) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::Inference(format!("logits: {e}")))?;
        let (_, boxes) = outputs[1]
            .try_extract_tensor::<f32>()
            .map_err(|e| ExtractionError::Inference(format!("pred_boxes: {e}")))?;

        let dims = logit_shape.as_ref();
        if dims.len() != 3 {
            return Err(ExtractionError::Inference(format!(
                "expected 3D logits, got {}D",
                dims.len()
            )));
        }
        let queries = dims[1] as usize;
        let classes = dims[2] as usize;

        decode_detections(logits, boxes, queries, classes, self.labels, width, height)
    }
}

impl TableDetector for TableTransformer {
    fn detect(&mut self, page: &RgbImage) -> Result<Vec<Detection>, ExtractionError> {
        self.infer(page)
    }
}

impl StructureRecognizer for TableTransformer {
    fn recognize(&mut self, table: &RgbImage) -> Result<Vec<Detection>, ExtractionError> {
        self.infer(table)
    }
}

/// Target size keeping aspect ratio: shortest edge to `shortest` unless that
/// pushes the longest edge past `longest`.
fn target_size(width: u32, height: u32, limits: ResizeLimits) -> (u32, u32) {
    let (short, long) = (width.min(height) as f32, width.max(height) as f32);
    let mut scale = limits.shortest as f32 / short;
    if long * scale > limits.longest as f32 {
        scale = limits.longest as f32 / long;
    }
    let w = ((width as f32 * scale).round() as u32).max(1);
    let h = ((height as f32 * scale).round() as u32).max(1);
    (w, h)
}

/// Resize and normalise into a `(1, 3, H, W)` tensor.
fn preprocess(image: &RgbImage, limits: ResizeLimits) -> Array4<f32> {
    let (w, h) = target_size(image.width(), image.height(), limits);
    let resized = image::imageops::resize(image, w, h, FilterType::Triangle);

    let mut input = Array4::<f32>::zeros((1, 3, h as usize, w as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let v = f32::from(pixel[c]) / 255.0;
            input[[0, c, y as usize, x as usize]] = (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    input
}

/// DETR post-processing for one image. `logits` is `queries × classes`
/// (last class = no object), `boxes` is `queries × 4` normalised cxcywh.
fn decode_detections(
    logits: &[f32],
    boxes: &[f32],
    queries: usize,
    classes: usize,
    labels: &[&str],
    width: u32,
    height: u32,
) -> Result<Vec<Detection>, ExtractionError> {
    if classes < 2 || logits.len() < queries * classes || boxes.len() < queries * 4 {
        return Err(ExtractionError::Inference(format!(
            "output size mismatch: {} logits, {} box values for {queries} queries × {classes} classes",
            logits.len(),
            boxes.len()
        )));
    }

    let (w, h) = (width as f32, height as f32);
    let mut detections = Vec::new();

    for q in 0..queries {
        let row = &logits[q * classes..(q + 1) * classes];
        let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let exp: Vec<f32> = row.iter().map(|v| (v - max).exp()).collect();
        let sum: f32 = exp.iter().sum();

        let Some((class, prob)) = exp[..classes - 1]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        else {
            continue;
        };
        let Some(label) = labels.get(class) else {
            continue;
        };

        let b = &boxes[q * 4..q * 4 + 4];
        let (cx, cy, bw, bh) = (b[0], b[1], b[2], b[3]);
        let bbox = BoundingBox::new(
            (cx - bw / 2.0) * w,
            (cy - bh / 2.0) * h,
            (cx + bw / 2.0) * w,
            (cy + bh / 2.0) * h,
        );
        if let Some(bbox) = bbox {
            detections.push(Detection::new(label, prob / sum, bbox));
        }
    }

    Ok(detections)
}
