//! Per-page table extraction.
//!
//! ```text
//! DetectTables ─┬─ NoTables
//!               └─ ForEachTable { StructureRecognize → BuildGrid → OcrCells → Persist }
//! ```
//!
//! Faults are contained at the narrowest scope: a cell yields empty text, a
//! table without a grid is skipped, an unreadable page is skipped. Only a
//! failed store append escapes, since the page could not be reported as done.

use image::RgbImage;

use super::cell::{crop_region, extract_cell_text};
use super::geometry::{build_cell_grid, partition_structure};
use super::types::{BoundingBox, Capabilities, LABEL_TABLE};
use crate::pipeline::source::{PageRef, PageSource};
use crate::pipeline::store::{assemble_and_persist, ResultStore, StoreError};
use crate::supervisor::protocol::WorkerMessage;

/// What happened to one page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageOutcome {
    /// The page image could not be opened; no progress is reported.
    Unreadable,
    /// Table detection failed; no progress is reported.
    DetectionFailed,
    NoTables,
    Tables { found: usize, saved: usize, rows: usize },
}

impl PageOutcome {
    /// Whether the page counts as processed (progress is emitted).
    pub fn is_processed(&self) -> bool {
        matches!(self, Self::NoTables | Self::Tables { .. })
    }
}

/// Runs detection → structure → grid → OCR → persist for single pages.
pub struct PageExtractor<'a> {
    capabilities: &'a mut Capabilities,
    source: &'a dyn PageSource,
    store: &'a dyn ResultStore,
    table_threshold: f32,
    structure_threshold: f32,
}

impl<'a> PageExtractor<'a> {
    pub fn new(
        capabilities: &'a mut Capabilities,
        source: &'a dyn PageSource,
        store: &'a dyn ResultStore,
    ) -> Self {
        Self {
            capabilities,
            source,
            store,
            table_threshold: crate::config::TABLE_CONFIDENCE_THRESHOLD,
            structure_threshold: crate::config::STRUCTURE_CONFIDENCE_THRESHOLD,
        }
    }

    pub fn with_thresholds(mut self, table: f32, structure: f32) -> Self {
        self.table_threshold = table;
        self.structure_threshold = structure;
        self
    }

    /// Extract every table on `page`, persisting each as soon as it is read.
    ///
    /// `PROGRESS(page)` is emitted only after all of the page's rows are in
    /// the store.
    pub fn process_page(
        &mut self,
        page: &PageRef,
        emit: &dyn Fn(WorkerMessage),
    ) -> Result<PageOutcome, StoreError> {
        let image = match self.source.load_page(page) {
            Ok(image) => image,
            Err(e) => {
                tracing::warn!(page = page.number, error = %e, "Page image unreadable, skipping");
                emit(WorkerMessage::log(format!(
                    "!!! Failed to open image {}: {e}",
                    page.file_name()
                )));
                return Ok(PageOutcome::Unreadable);
            }
        };

        let outcome = self.extract_tables(page.number, &image, emit)?;

        if outcome.is_processed() {
            emit(WorkerMessage::Progress { page: page.number });
        }
        Ok(outcome)
    }

    fn extract_tables(
        &mut self,
        page_number: u32,
        image: &RgbImage,
        emit: &dyn Fn(WorkerMessage),
    ) -> Result<PageOutcome, StoreError> {
        let detections = match self.capabilities.detector.detect(image) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(page = page_number, error = %e, "Table detection failed, skipping page");
                emit(WorkerMessage::log(format!(
                    "!!! Table detection failed on page {page_number}: {e}"
                )));
                return Ok(PageOutcome::DetectionFailed);
            }
        };

        let tables: Vec<BoundingBox> = detections
            .iter()
            .filter(|d| d.is(LABEL_TABLE, self.table_threshold))
            .map(|d| d.bbox)
            .collect();

        if tables.is_empty() {
            tracing::info!(page = page_number, "No tables detected");
            emit(WorkerMessage::log(format!("No tables on page {page_number}.")));
            return Ok(PageOutcome::NoTables);
        }

        emit(WorkerMessage::log(format!("Found {} table(s).", tables.len())));

        let mut saved = 0;
        let mut rows_written = 0;
        for (idx, region) in tables.iter().enumerate() {
            let table_on_page = idx as u32 + 1;
            let Some(rows) = self.read_table(page_number, table_on_page, image, region, emit) else {
                continue;
            };

            let record = assemble_and_persist(rows, page_number, table_on_page, self.store)?;

            saved += 1;
            rows_written += record.rows.len();
            tracing::info!(
                page = page_number,
                table = table_on_page,
                rows = record.rows.len(),
                columns = record.column_count(),
                "Table persisted"
            );
            emit(WorkerMessage::log(format!(
                "  Table #{table_on_page} saved. [{} rows]",
                record.rows.len()
            )));
        }

        Ok(PageOutcome::Tables {
            found: tables.len(),
            saved,
            rows: rows_written,
        })
    }

    /// Structure-recognise and OCR one table. `None` means the table is skipped.
    fn read_table(
        &mut self,
        page_number: u32,
        table_on_page: u32,
        image: &RgbImage,
        region: &BoundingBox,
        emit: &dyn Fn(WorkerMessage),
    ) -> Option<Vec<Vec<String>>> {
        let skip = |reason: String| {
            tracing::info!(page = page_number, table = table_on_page, %reason, "Table skipped");
            emit(WorkerMessage::log(format!(
                "  Table #{table_on_page} skipped: {reason}"
            )));
        };

        let table_image = match crop_region(image, region) {
            Ok(crop) => crop,
            Err(e) => {
                skip(e.to_string());
                return None;
            }
        };

        let structure = match self.capabilities.structure.recognize(&table_image) {
            Ok(detections) => partition_structure(&detections, self.structure_threshold),
            Err(e) => {
                skip(format!("structure recognition failed: {e}"));
                return None;
            }
        };

        let grid = build_cell_grid(&structure.rows, &structure.columns);
        if grid.is_empty() {
            skip(format!(
                "no grid ({} rows, {} columns)",
                structure.rows.len(),
                structure.columns.len()
            ));
            return None;
        }

        let ocr = self.capabilities.ocr.as_ref();
        Some(
            grid.iter()
                .map(|row| {
                    row.iter()
                        .map(|cell| extract_cell_text(ocr, &table_image, cell))
                        .collect()
                })
                .collect(),
        )
    }
}
