//! # manual-index
//!
//! Index vehicle service-manual PDFs into addressable sections and cropped
//! diagram regions using Vision Language Models (VLMs).
//!
//! Each page is rasterised and shown to a VLM, which reports the headings
//! and image regions it sees. Headings become sections keyed by
//! `RAG_<manual_id>_<start_page>`; image regions are stored with normalized
//! geometry and a PNG crop cut from the page raster. Downstream retrieval
//! and action-extraction components read them back through
//! [`ManualLibrary`].
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF bytes + metadata
//!  │
//!  ├─ 1. Validate  metadata, %PDF magic, page count (nothing persisted yet)
//!  ├─ 2. Manual    manual row + <manual_id>.pdf
//!  └─ per page, in order
//!      ├─ 3. Render   pdfium raster (spawn_blocking)
//!      ├─ 4. Analyze  VLM call, retry/backoff/timeout, strict JSON parse
//!      ├─ 5. Sections one row per heading
//!      └─ 6. Images   one row per region + crop artifact
//! ```
//!
//! A page whose analysis fails is logged and skipped; the rest of the
//! manual is still indexed.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use manual_index::{Classification, IngestConfig, ManualIngestor, ManualMetadata};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let ingestor = ManualIngestor::from_config(IngestConfig::default())?;
//!     let metadata = ManualMetadata::new("Ford", "Explorer", 2020, Classification::Police);
//!     let output = ingestor.ingest_file("explorer.pdf", &metadata).await?;
//!
//!     let library = ingestor.library();
//!     for section in library.list_sections(output.manual_id)? {
//!         println!("{}  {}", section.section_ref(), section.name);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature   | Default | Description |
//! |-----------|---------|-------------|
//! | `cli`     | on      | Enables the `manual-index` binary (clap + anyhow + tracing-subscriber + indicatif) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod artifacts;
pub mod config;
pub mod error;
pub mod ingest;
pub mod model;
pub mod output;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod retrieval;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use artifacts::ArtifactStore;
pub use config::{Classification, IngestConfig, IngestConfigBuilder, ManualMetadata};
pub use error::{ExtractionErrorKind, IngestError, PageError};
pub use ingest::{CancellationFlag, ManualIngestor};
pub use model::{ImageInfo, ImagePageRef, ManualInfo, SectionInfo, SectionRef};
pub use output::{IngestOutput, IngestStats, PageOutcome};
pub use pipeline::analyze::{PageAnalyzer, VisionClient};
pub use pipeline::render::Rasterizer;
pub use pipeline::sections::SectionTree;
pub use progress::{IngestProgressCallback, NoopProgressCallback, ProgressCallback};
pub use retrieval::{ImageEntry, ManualLibrary, PageText, SectionContent};
pub use store::ManualStore;
