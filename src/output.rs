//! Result types returned by ingestion.

use crate::error::PageError;
use serde::{Deserialize, Serialize};

/// Outcome of ingesting one page.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PageOutcome {
    /// 1-indexed.
    pub page: u32,
    /// Ids of the section rows written for this page.
    pub section_ids: Vec<i64>,
    /// Ids of the image rows written for this page.
    pub image_ids: Vec<i64>,
    pub crops_written: usize,
    /// Image rows whose box was degenerate or whose crop could not be saved.
    pub crops_skipped: usize,
    /// Analyzer calls made (0 when rendering failed first).
    pub attempts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
    /// `Some` when the page was skipped or partially indexed.
    pub error: Option<PageError>,
}

impl PageOutcome {
    pub fn new(page: u32) -> Self {
        Self {
            page,
            ..Default::default()
        }
    }

    /// True when the page contributed its blocks to the index.
    pub fn is_indexed(&self) -> bool {
        !matches!(
            self.error,
            Some(PageError::RenderFailed { .. }) | Some(PageError::ExtractionFailed { .. })
        )
    }
}

/// Aggregate counts for one ingestion call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IngestStats {
    pub total_pages: u32,
    pub indexed_pages: u32,
    pub failed_pages: u32,
    pub sections: usize,
    pub images: usize,
    pub crops_written: usize,
    pub crops_skipped: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_duration_ms: u64,
}

impl IngestStats {
    pub(crate) fn from_pages(total_pages: u32, pages: &[PageOutcome], total_duration_ms: u64) -> Self {
        let indexed = pages.iter().filter(|p| p.is_indexed()).count() as u32;
        IngestStats {
            total_pages,
            indexed_pages: indexed,
            failed_pages: pages.len() as u32 - indexed,
            sections: pages.iter().map(|p| p.section_ids.len()).sum(),
            images: pages.iter().map(|p| p.image_ids.len()).sum(),
            crops_written: pages.iter().map(|p| p.crops_written).sum(),
            crops_skipped: pages.iter().map(|p| p.crops_skipped).sum(),
            total_input_tokens: pages.iter().map(|p| p.input_tokens).sum(),
            total_output_tokens: pages.iter().map(|p| p.output_tokens).sum(),
            total_duration_ms,
        }
    }
}

/// What [`crate::ingest::ManualIngestor::ingest`] returns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutput {
    pub manual_id: i64,
    pub stats: IngestStats,
    /// One entry per page, in page order.
    pub pages: Vec<PageOutcome>,
}

impl IngestOutput {
    pub fn failed_pages(&self) -> impl Iterator<Item = &PageOutcome> {
        self.pages.iter().filter(|p| !p.is_indexed())
    }
}
