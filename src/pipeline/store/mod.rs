//! Result store: the append-only table dataset, and the single source of
//! truth for completed work.
//!
//! Logical schema: `page_number, table_on_page, 0, 1, ...`. The header is
//! written once, sized by the first table appended; later rows are appended
//! without a header.

pub mod csv_store;

pub use csv_store::CsvResultStore;

use std::path::PathBuf;

use thiserror::Error;

use crate::pipeline::extraction::TableRecord;

pub const PAGE_NUMBER_COLUMN: &str = "page_number";
pub const TABLE_ON_PAGE_COLUMN: &str = "table_on_page";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Result store {path} unreadable: {source}")]
    Unreadable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Result store {path} malformed: {reason}")]
    Malformed { path: PathBuf, reason: String },
}

/// Append-only persistence for extracted tables.
pub trait ResultStore: Send + Sync {
    /// Durably append every row of `record`. Returns the number of rows written.
    fn append_table(&self, record: &TableRecord) -> Result<usize, StoreError>;

    /// Highest page number with persisted rows; `None` when the store is
    /// absent or holds no rows. Malformed rows are skipped; an unreadable or
    /// structurally corrupt store is an error.
    fn last_committed_page(&self) -> Result<Option<u32>, StoreError>;

    /// Move a corrupt store out of the way so a fresh one can be started.
    /// Returns where the old data now lives.
    fn quarantine(&self) -> Result<PathBuf, StoreError>;

    fn describe(&self) -> String;
}

/// Header row for a table with `data_columns` cell columns.
pub fn header_row(data_columns: usize) -> Vec<String> {
    [PAGE_NUMBER_COLUMN.to_string(), TABLE_ON_PAGE_COLUMN.to_string()]
        .into_iter()
        .chain((0..data_columns).map(|c| c.to_string()))
        .collect()
}

/// Output rows for one table: identity columns, then the cells of each grid row.
pub fn assemble_rows(record: &TableRecord) -> Vec<Vec<String>> {
    let page = record.page_number.to_string();
    let table = record.table_on_page.to_string();

    record
        .rows
        .iter()
        .map(|cells| {
            [page.clone(), table.clone()]
                .into_iter()
                .chain(cells.iter().cloned())
                .collect()
        })
        .collect()
}

/// Tag a text grid with its page/table identity and flush it to the store
/// immediately, so a stop or crash loses at most the table in flight.
pub fn assemble_and_persist(
    grid: Vec<Vec<String>>,
    page_number: u32,
    table_on_page: u32,
    store: &dyn ResultStore,
) -> Result<TableRecord, StoreError> {
    let record = TableRecord {
        page_number,
        table_on_page,
        rows: grid,
    };
    store.append_table(&record)?;
    Ok(record)
}
