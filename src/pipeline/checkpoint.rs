//! Checkpoint resolution: where the next worker incarnation starts.
//!
//! The checkpoint is derived from the result store alone (`max(page_number)`),
//! never from worker memory, so any incarnation can be killed and replaced.

use std::fmt;

use crate::pipeline::store::ResultStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// Extract from this page (1-based) onward.
    Start { page: u32 },
    /// Every page is already in the store; nothing to do.
    Complete { last_page: u32, total_pages: usize },
}

impl fmt::Display for ResumePoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Start { page } => write!(f, "start at page {page}"),
            Self::Complete { last_page, total_pages } => {
                write!(f, "complete ({last_page} of {total_pages} pages persisted)")
            }
        }
    }
}

/// Resolved resume point plus any recovery that happened on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub point: ResumePoint,
    /// Set when the store was unreadable and extraction falls back to page 1.
    pub warning: Option<String>,
}

/// Compute the next unprocessed page from the store and the page count.
///
/// An unreadable store is moved aside and extraction restarts at page 1,
/// so resuming never blocks. If the store cannot even be moved, page 1 is
/// still returned and rows may be duplicated.
pub fn resolve_start_page(store: &dyn ResultStore, total_pages: usize) -> Resolution {
    let (last_page, warning) = match store.last_committed_page() {
        Ok(last) => (last, None),
        Err(e) => {
            tracing::warn!(store = %store.describe(), error = %e, "Result store unreadable, restarting from page 1");
            let warning = match store.quarantine() {
                Ok(moved) => format!(
                    "Warning reading result store: {e}. Previous data moved to {}; starting from page 1.",
                    moved.display()
                ),
                Err(q) => {
                    tracing::warn!(error = %q, "Could not move corrupt result store aside");
                    format!(
                        "Warning reading result store: {e}. Starting from page 1; rows may be duplicated."
                    )
                }
            };
            (None, Some(warning))
        }
    };

    let point = resume_after(last_page, total_pages);
    tracing::debug!(%point, total_pages, "Checkpoint resolved");
    Resolution { point, warning }
}

/// Resume point given the last persisted page.
pub fn resume_after(last_page: Option<u32>, total_pages: usize) -> ResumePoint {
    let start = last_page.map_or(1, |p| p.saturating_add(1));
    if start as usize > total_pages {
        ResumePoint::Complete {
            last_page: last_page.unwrap_or(0),
            total_pages,
        }
    } else {
        ResumePoint::Start { page: start }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::store::CsvResultStore;

    fn store_with(content: Option<&str>) -> (tempfile::TempDir, CsvResultStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = CsvResultStore::new(dir.path().join("out.csv"));
        if let Some(content) = content {
            std::fs::write(store.path(), content).unwrap();
        }
        (dir, store)
    }

    #[test]
    fn absent_store_starts_at_first_page() {
        let (_dir, store) = store_with(None);
        let resolution = resolve_start_page(&store, 5);
        assert_eq!(resolution.point, ResumePoint::Start { page: 1 });
        assert!(resolution.warning.is_none());
    }

    #[test]
    fn resumes_after_last_persisted_page() {
        let (_dir, store) = store_with(Some("page_number,table_on_page,0\n1,1,a\n2,1,b\n2,2,c\n"));
        assert_eq!(resolve_start_page(&store, 5).point, ResumePoint::Start { page: 3 });
    }

    #[test]
    fn all_pages_persisted_is_complete() {
        let (_dir, store) = store_with(Some("page_number,table_on_page,0\n3,1,a\n"));
        assert_eq!(
            resolve_start_page(&store, 3).point,
            ResumePoint::Complete { last_page: 3, total_pages: 3 }
        );
    }

    #[test]
    fn empty_document_is_complete() {
        let (_dir, store) = store_with(None);
        assert_eq!(
            resolve_start_page(&store, 0).point,
            ResumePoint::Complete { last_page: 0, total_pages: 0 }
        );
    }

    #[test]
    fn corrupt_store_quarantined_and_restarted() {
        let (dir, store) = store_with(Some("something else entirely\n1,2\n"));

        let resolution = resolve_start_page(&store, 4);

        assert_eq!(resolution.point, ResumePoint::Start { page: 1 });
        assert!(resolution.warning.unwrap().contains("moved to"));
        assert!(!store.path().exists());
        let leftovers = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(leftovers, 1);
    }

    #[test]
    fn display_is_human_readable() {
        assert_eq!(ResumePoint::Start { page: 2 }.to_string(), "start at page 2");
        assert_eq!(
            ResumePoint::Complete { last_page: 3, total_pages: 3 }.to_string(),
            "complete (3 of 3 pages persisted)"
        );
    }
}
