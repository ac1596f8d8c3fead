//! Pipeline stages for turning a manual PDF into indexed sections and images.
//!
//! Each submodule implements one transformation step and is testable on
//! its own; the orchestration lives in [`crate::ingest`].
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ analyze ──▶ blocks ──▶ sections
//! (bytes)   (pdfium)   (PNG)      (VLM)       (parse)    geometry (crops)
//! ```
//!
//! 1. [`input`]: load a path or URL and check the `%PDF` magic
//! 2. [`render`]: rasterise one page at a time; runs in `spawn_blocking`
//!    because pdfium is not async-safe
//! 3. [`encode`]: PNG-encode the raster, base64-wrap it for the API
//! 4. [`analyze`]: drive the VLM call with retry, backoff and a per-call
//!    timeout; the only stage with network I/O
//! 5. [`blocks`]: strict parse of the model reply into headings and images
//! 6. [`sections`]: headings → section rows; derived hierarchy
//! 7. [`geometry`]: clamp normalized boxes and cut crops from the raster

pub mod analyze;
pub mod blocks;
pub mod encode;
pub mod geometry;
pub mod input;
pub mod render;
pub mod sections;
