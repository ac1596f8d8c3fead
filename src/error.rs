//! Error types for the manual-index library.
//!
//! Two distinct error types reflect two distinct failure modes:
//!
//! * [`IngestError`] is **fatal**: the ingestion (or a retrieval call) cannot
//!   proceed at all (invalid input, store unreachable, provider not
//!   configured). Returned as `Err(IngestError)` from the top-level functions.
//!
//! * [`PageError`] is **non-fatal**: a single page failed (render glitch,
//!   analyzer exhausted its retries, crop could not be written) but the rest
//!   of the manual is fine. Stored inside [`crate::output::PageOutcome`] so
//!   callers can compare what was indexed against the page count.
//!
//! [`ExtractionErrorKind`] tags why the Page Analyzer gave up on a page.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the manual-index library.
#[derive(Debug, Error)]
pub enum IngestError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Manual metadata or request parameters are invalid.
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    /// Input file was not found at the given path.
    #[error("PDF file not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// The bytes are not a PDF.
    #[error("Input is not a valid PDF\nFirst bytes: {magic:?}")]
    NotAPdf { magic: Vec<u8> },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    /// pdfium could not open the document at all.
    #[error("PDF is corrupt: {detail}")]
    CorruptPdf { detail: String },

    /// Requested page does not exist in the manual.
    #[error("Page {page} is out of range (manual has {total} pages)")]
    PageOutOfRange { page: u32, total: u32 },

    /// pdfium-render returned an error for a specific page.
    #[error("Rasterisation failed for page {page}: {detail}")]
    RasterisationFailed { page: u32, detail: String },

    // ── Provider errors ───────────────────────────────────────────────────
    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Persistence errors ────────────────────────────────────────────────
    /// The manual store could not be opened, read or written.
    #[error("Manual store unavailable: {0}")]
    StoreUnavailable(#[from] rusqlite::Error),

    /// A blob artifact could not be written.
    #[error("Failed to write artifact '{path}': {source}")]
    ArtifactWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Control flow ──────────────────────────────────────────────────────
    /// Ingestion was cancelled between pages. Rows written so far remain.
    #[error("Ingestion of manual {manual_id} cancelled after {pages_done} pages")]
    Cancelled { manual_id: i64, pages_done: u32 },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Could not bind to a pdfium library.
    #[error("Failed to bind to pdfium library: {0}\nSet PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy.")]
    PdfiumBindingFailed(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Why the Page Analyzer could not produce blocks for a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionErrorKind {
    /// The model reply contained no `{` / `[` delimited region at all.
    NoJson,
    /// Delimiters were found but no fragment parsed as JSON.
    Malformed,
    /// JSON parsed but matched none of the accepted block shapes.
    SchemaMismatch,
    /// The provider call itself failed (network, HTTP status, auth).
    Provider,
    /// The provider call exceeded the per-call timeout.
    Timeout,
}

impl fmt::Display for ExtractionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExtractionErrorKind::NoJson => "no JSON in reply",
            ExtractionErrorKind::Malformed => "malformed JSON",
            ExtractionErrorKind::SchemaMismatch => "unexpected JSON shape",
            ExtractionErrorKind::Provider => "provider error",
            ExtractionErrorKind::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// A single failed attempt inside the analyzer's retry loop.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {detail}")]
pub struct ExtractionError {
    pub kind: ExtractionErrorKind,
    pub detail: String,
}

impl ExtractionError {
    pub fn new(kind: ExtractionErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

/// A non-fatal error for a single page.
///
/// The ingestion continues with the next page; the failure is logged and
/// recorded in [`crate::output::PageOutcome`].
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
pub enum PageError {
    /// Page rasterisation failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: u32, detail: String },

    /// Page Analyzer exhausted its retry budget.
    #[error("Page {page}: extraction failed after {attempts} attempts ({kind}): {detail}")]
    ExtractionFailed {
        page: u32,
        attempts: u32,
        kind: ExtractionErrorKind,
        detail: String,
    },

    /// A crop artifact could not be produced or written. The image row exists.
    #[error("Page {page}: crop for image {image_id} failed: {detail}")]
    CropFailed {
        page: u32,
        image_id: i64,
        detail: String,
    },
}

impl PageError {
    /// 1-indexed page the error belongs to.
    pub fn page(&self) -> u32 {
        match self {
            PageError::RenderFailed { page, .. }
            | PageError::ExtractionFailed { page, .. }
            | PageError::CropFailed { page, .. } => *page,
        }
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T, E = IngestError> = std::result::Result<T, E>;
