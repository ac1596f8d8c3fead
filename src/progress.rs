//! Progress-callback trait for per-page ingestion events.
//!
//! Inject an [`Arc<dyn IngestProgressCallback>`] via
//! [`crate::config::IngestConfigBuilder::progress_callback`] to receive
//! events as the orchestrator walks the manual. Callbacks fire from the
//! single writer, in page order.

use std::sync::Arc;

/// Called by the ingestion orchestrator as it processes each page.
///
/// All methods have default no-op implementations so callers only override
/// what they care about.
pub trait IngestProgressCallback: Send + Sync {
    /// Called once the manual row exists and the page count is known.
    fn on_ingest_start(&self, manual_id: i64, total_pages: u32) {
        let _ = (manual_id, total_pages);
    }

    /// Called when a page's sections and images have been persisted.
    fn on_page_complete(&self, page: u32, total_pages: u32, sections: usize, images: usize) {
        let _ = (page, total_pages, sections, images);
    }

    /// Called when a page was skipped because rendering or extraction failed.
    fn on_page_error(&self, page: u32, total_pages: u32, error: String) {
        let _ = (page, total_pages, error);
    }

    /// Called once after all pages have been attempted.
    fn on_ingest_complete(&self, manual_id: i64, total_pages: u32, success_count: u32) {
        let _ = (manual_id, total_pages, success_count);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl IngestProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::IngestConfig`].
pub type ProgressCallback = Arc<dyn IngestProgressCallback>;
