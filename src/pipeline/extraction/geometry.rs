//! Cell-grid construction from recognised table structure.
//!
//! A cell takes its horizontal extent from its column and its vertical
//! extent from its row. The grid is dense (`rows × columns`), no spans.

use super::types::{BoundingBox, Detection, LABEL_COLUMN, LABEL_ROW};

/// Row and column boxes of one table, sorted for grid construction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableStructure {
    /// Ascending by top edge.
    pub rows: Vec<BoundingBox>,
    /// Ascending by left edge.
    pub columns: Vec<BoundingBox>,
}

/// Split structure-model output into rows and columns, keeping boxes
/// scored above `threshold`, and sort both per the grid invariant.
pub fn partition_structure(detections: &[Detection], threshold: f32) -> TableStructure {
    let mut rows: Vec<BoundingBox> = detections
        .iter()
        .filter(|d| d.is(LABEL_ROW, threshold))
        .map(|d| d.bbox)
        .collect();
    let mut columns: Vec<BoundingBox> = detections
        .iter()
        .filter(|d| d.is(LABEL_COLUMN, threshold))
        .map(|d| d.bbox)
        .collect();

    rows.sort_by(|a, b| a.y0.total_cmp(&b.y0));
    columns.sort_by(|a, b| a.x0.total_cmp(&b.x0));

    TableStructure { rows, columns }
}

/// Intersect sorted row and column boxes into a `rows × columns` grid.
///
/// Either list empty → empty grid; the table has no reconstructable layout.
pub fn build_cell_grid(rows: &[BoundingBox], columns: &[BoundingBox]) -> Vec<Vec<BoundingBox>> {
    if rows.is_empty() || columns.is_empty() {
        return Vec::new();
    }

    rows.iter()
        .map(|row| {
            columns
                .iter()
                .map(|col| BoundingBox::cell(row, col))
                .collect()
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x0: f32, y0: f32, x1: f32, y1: f32) -> BoundingBox {
        BoundingBox::new(x0, y0, x1, y1).unwrap()
    }

    #[test]
    fn grid_has_rows_times_columns_cells() {
        let rows = vec![bbox(0.0, 0.0, 300.0, 20.0), bbox(0.0, 20.0, 300.0, 45.0)];
        let columns = vec![
            bbox(0.0, 0.0, 100.0, 45.0),
            bbox(100.0, 0.0, 180.0, 45.0),
            bbox(180.0, 0.0, 300.0, 45.0),
        ];

        let grid = build_cell_grid(&rows, &columns);

        assert_eq!(grid.len(), 2);
        assert!(grid.iter().all(|r| r.len() == 3));
        for (r, row) in rows.iter().enumerate() {
            for (c, col) in columns.iter().enumerate() {
                let cell = grid[r][c];
                assert_eq!((cell.x0, cell.x1), (col.x0, col.x1));
                assert_eq!((cell.y0, cell.y1), (row.y0, row.y1));
            }
        }
    }

    #[test]
    fn empty_rows_or_columns_give_empty_grid() {
        let one = vec![bbox(0.0, 0.0, 10.0, 10.0)];
        assert!(build_cell_grid(&[], &one).is_empty());
        assert!(build_cell_grid(&one, &[]).is_empty());
        assert!(build_cell_grid(&[], &[]).is_empty());
    }

    #[test]
    fn partition_sorts_and_filters() {
        let detections = vec![
            Detection::new(LABEL_ROW, 0.9, bbox(0.0, 50.0, 100.0, 80.0)),
            Detection::new(LABEL_COLUMN, 0.95, bbox(60.0, 0.0, 100.0, 80.0)),
            Detection::new(LABEL_ROW, 0.8, bbox(0.0, 10.0, 100.0, 50.0)),
            Detection::new(LABEL_COLUMN, 0.75, bbox(0.0, 0.0, 60.0, 80.0)),
            // below threshold
            Detection::new(LABEL_ROW, 0.5, bbox(0.0, 0.0, 100.0, 10.0)),
            // other structure classes are ignored
            Detection::new("table spanning cell", 0.99, bbox(0.0, 0.0, 100.0, 80.0)),
        ];

        let structure = partition_structure(&detections, 0.7);

        assert_eq!(structure.rows.len(), 2);
        assert_eq!(structure.rows[0].y0, 10.0);
        assert_eq!(structure.rows[1].y0, 50.0);
        assert_eq!(structure.columns.len(), 2);
        assert_eq!(structure.columns[0].x0, 0.0);
        assert_eq!(structure.columns[1].x0, 60.0);
    }

    #[test]
    fn rows_without_columns_is_unreconstructable() {
        let detections = vec![Detection::new(LABEL_ROW, 0.9, bbox(0.0, 0.0, 10.0, 5.0))];
        let structure = partition_structure(&detections, 0.7);
        assert!(build_cell_grid(&structure.rows, &structure.columns).is_empty());
    }
}
