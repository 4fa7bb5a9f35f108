use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use super::{
    assemble_rows, header_row, ResultStore, StoreError, PAGE_NUMBER_COLUMN, TABLE_ON_PAGE_COLUMN,
};
use crate::pipeline::extraction::TableRecord;

/// Comma-separated result store at a user-chosen path.
#[derive(Debug, Clone)]
pub struct CsvResultStore {
    path: PathBuf,
}

impl CsvResultStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when nothing (not even a header) has been written yet.
    fn is_fresh(&self) -> Result<bool, StoreError> {
        match std::fs::metadata(&self.path) {
            Ok(meta) => Ok(meta.len() == 0),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(true),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a trailing row that a forced termination left without its line
    /// terminator, so the next append starts on a fresh line.
    ///
    /// The cut falls at the start of the last record as the CSV reader sees
    /// it, which also covers a torn quoted field spanning several lines.
    fn truncate_torn_tail(&self) -> Result<(), StoreError> {
        let mut file = match OpenOptions::new().read(true).write(true).open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata()?.len();
        if len == 0 {
            return Ok(());
        }
        let mut last = [0u8; 1];
        file.seek(SeekFrom::End(-1))?;
        file.read_exact(&mut last)?;
        if last[0] == b'\n' {
            return Ok(());
        }

        file.seek(SeekFrom::Start(0))?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_reader(&mut file);
        let mut record = csv::ByteRecord::new();
        let mut torn_at = 0;
        loop {
            let start = reader.position().byte();
            if !reader.read_byte_record(&mut record)? {
                break;
            }
            torn_at = start;
        }
        drop(reader);

        file.set_len(torn_at)?;
        file.sync_data()?;
        tracing::warn!(
            path = %self.path.display(),
            dropped_bytes = len - torn_at,
            "Removed unterminated trailing row from result store"
        );
        Ok(())
    }

    /// Width of the existing header row, if one can be read.
    fn header_width(&self) -> Option<usize> {
        let file = File::open(&self.path).ok()?;
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_reader(file);
        reader.records().next()?.ok().map(|h| h.len())
    }
}

impl ResultStore for CsvResultStore {
    fn append_table(&self, record: &TableRecord) -> Result<usize, StoreError> {
        if record.rows.is_empty() {
            return Ok(0);
        }

        self.truncate_torn_tail()?;
        let fresh = self.is_fresh()?;
        let width = record.column_count() + 2;
        if !fresh {
            if let Some(header) = self.header_width().filter(|&h| width > h) {
                tracing::warn!(
                    path = %self.path.display(),
                    page = record.page_number,
                    table = record.table_on_page,
                    header_fields = header,
                    row_fields = width,
                    "Table wider than the existing header; rows appended as-is"
                );
            }
        }

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().flexible(true).from_writer(file);

        if fresh {
            writer.write_record(header_row(record.column_count()))?;
        }

        let rows = assemble_rows(record);
        for row in &rows {
            writer.write_record(row)?;
        }

        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| StoreError::Io(e.into_error()))?;
        file.sync_data()?;

        Ok(rows.len())
    }

    fn last_committed_page(&self) -> Result<Option<u32>, StoreError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(StoreError::Unreadable {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .has_headers(false)
            .from_reader(file);
        let mut records = reader.records();

        match records.next() {
            None => return Ok(None),
            Some(Ok(header)) => {
                let first = header.get(0).map(|f| f.trim_start_matches('\u{feff}').trim());
                let second = header.get(1).map(str::trim);
                if first != Some(PAGE_NUMBER_COLUMN) || second != Some(TABLE_ON_PAGE_COLUMN) {
                    return Err(StoreError::Malformed {
                        path: self.path.clone(),
                        reason: format!(
                            "header must start with {PAGE_NUMBER_COLUMN},{TABLE_ON_PAGE_COLUMN}"
                        ),
                    });
                }
            }
            Some(Err(e)) => {
                return Err(StoreError::Malformed {
                    path: self.path.clone(),
                    reason: format!("unreadable header: {e}"),
                })
            }
        }

        let mut last_page: Option<u32> = None;
        let mut skipped = 0usize;
        for result in records {
            let record = match result {
                Ok(r) => r,
                Err(e) => {
                    if let csv::ErrorKind::Io(_) = e.kind() {
                        return Err(StoreError::Csv(e));
                    }
                    skipped += 1;
                    continue;
                }
            };

            let page = (record.len() >= 2)
                .then(|| record.get(0))
                .flatten()
                .and_then(|f| f.trim().parse::<u32>().ok())
                .filter(|&p| p > 0);

            match page {
                Some(p) => last_page = last_page.max(Some(p)),
                None => skipped += 1,
            }
        }

        if skipped > 0 {
            tracing::warn!(path = %self.path.display(), skipped, "Skipped malformed rows in result store");
        }

        Ok(last_page)
    }

    fn quarantine(&self) -> Result<PathBuf, StoreError> {
        let stem = self
            .path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "results".to_string());
        let stamp = chrono::Local::now().format("%Y%m%d%H%M%S");
        let target = self.path.with_file_name(format!("{stem}.corrupt-{stamp}.csv"));

        std::fs::rename(&self.path, &target)?;
        tracing::warn!(
            from = %self.path.display(),
            to = %target.display(),
            "Corrupt result store moved aside"
        );
        Ok(target)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}
