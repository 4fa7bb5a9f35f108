use std::panic::{catch_unwind, AssertUnwindSafe};

use image::RgbImage;

use super::types::{BoundingBox, TextRecognizer};
use super::ExtractionError;

/// Crop `image` to `cell` and read its text.
///
/// Best effort: an OCR error, a panic inside the engine, or a cell that
/// falls outside the image all yield an empty string. A bad cell never
/// aborts its row, table or page.
pub fn extract_cell_text(ocr: &dyn TextRecognizer, image: &RgbImage, cell: &BoundingBox) -> String {
    match try_extract_cell_text(ocr, image, cell) {
        Ok(text) => text,
        Err(e) => {
            tracing::debug!(error = %e, ?cell, "Cell OCR failed, substituting empty text");
            String::new()
        }
    }
}

fn try_extract_cell_text(
    ocr: &dyn TextRecognizer,
    image: &RgbImage,
    cell: &BoundingBox,
) -> Result<String, ExtractionError> {
    let crop = crop_region(image, cell)?;

    let text = catch_unwind(AssertUnwindSafe(|| ocr.recognize_text(&crop)))
        .map_err(|_| ExtractionError::OcrProcessing("OCR engine panicked".into()))??;

    Ok(text.trim().to_string())
}

/// Copy the pixels under `region` into a new image.
pub fn crop_region(image: &RgbImage, region: &BoundingBox) -> Result<RgbImage, ExtractionError> {
    let (x, y, width, height) = region
        .pixel_rect(image.width(), image.height())
        .ok_or_else(|| {
            ExtractionError::ImageProcessing(format!(
                "Region {region:?} lies outside the {}x{} image",
                image.width(),
                image.height()
            ))
        })?;

    Ok(image::imageops::crop_imm(image, x, y, width, height).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{paint_cell, ColorOcr};

    fn bbox(x0: f32, y0: f32, x1: f32, y1: f32) -> BoundingBox {
        BoundingBox::new(x0, y0, x1, y1).unwrap()
    }

    struct FailingOcr;

    impl TextRecognizer for FailingOcr {
        fn recognize_text(&self, _cell: &RgbImage) -> Result<String, ExtractionError> {
            Err(ExtractionError::OcrProcessing("engine crashed".into()))
        }
    }

    struct PanickingOcr;

    impl TextRecognizer for PanickingOcr {
        fn recognize_text(&self, _cell: &RgbImage) -> Result<String, ExtractionError> {
            panic!("segfault-ish");
        }
    }

    #[test]
    fn reads_text_of_cropped_cell() {
        let mut image = RgbImage::new(40, 20);
        paint_cell(&mut image, (20, 0, 20, 20), [10, 20, 30]);
        let ocr = ColorOcr::new(&[([10, 20, 30], "  total \n")]);

        let text = extract_cell_text(&ocr, &image, &bbox(20.0, 0.0, 40.0, 20.0));
        assert_eq!(text, "total");
    }

    #[test]
    fn ocr_error_becomes_empty_string() {
        let image = RgbImage::new(10, 10);
        assert_eq!(extract_cell_text(&FailingOcr, &image, &bbox(0.0, 0.0, 5.0, 5.0)), "");
    }

    #[test]
    fn ocr_panic_becomes_empty_string() {
        let image = RgbImage::new(10, 10);
        assert_eq!(extract_cell_text(&PanickingOcr, &image, &bbox(0.0, 0.0, 5.0, 5.0)), "");
    }

    #[test]
    fn cell_outside_image_becomes_empty_string() {
        let image = RgbImage::new(10, 10);
        let ocr = ColorOcr::new(&[]);
        assert_eq!(extract_cell_text(&ocr, &image, &bbox(50.0, 50.0, 60.0, 60.0)), "");
    }

    #[test]
    fn crop_keeps_region_size() {
        let image = RgbImage::new(100, 50);
        let crop = crop_region(&image, &bbox(10.0, 5.0, 30.0, 25.0)).unwrap();
        assert_eq!(crop.dimensions(), (20, 20));
    }
}
