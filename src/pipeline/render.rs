//! PDF rasterisation: PDF page → bitmap at a fixed DPI.
//!
//! [`Rasterizer`] is the seam the orchestrator depends on; [`PdfiumRasterizer`]
//! is the production implementation. Page numbers are 1-indexed on every
//! method; the conversion to pdfium's 0-indexed pages happens here and
//! nowhere else.
//!
//! pdfium is not async-safe, so every call runs in `spawn_blocking`.

use crate::error::IngestError;
use async_trait::async_trait;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::Path;
use tracing::debug;

/// Capability: "given a PDF and a page, produce an RGB raster", plus the
/// page's embedded text layer for retrieval.
#[async_trait]
pub trait Rasterizer: Send + Sync {
    /// Number of pages in the document.
    async fn page_count(&self, pdf_path: &Path) -> Result<u32, IngestError>;

    /// Render one 1-indexed page.
    async fn render_page(&self, pdf_path: &Path, page: u32) -> Result<DynamicImage, IngestError>;

    /// Embedded text of several 1-indexed pages, one result per entry of
    /// `pages`. Scanned pages without a text layer yield an empty string.
    async fn pages_text(&self, pdf_path: &Path, pages: &[u32]) -> Vec<Result<String, IngestError>>;

    /// Render several pages of one document. Returns one result per entry
    /// of `pages`, in the same order.
    async fn render_pages(
        &self,
        pdf_path: &Path,
        pages: &[u32],
    ) -> Vec<Result<DynamicImage, IngestError>> {
        let mut out = Vec::with_capacity(pages.len());
        for &page in pages {
            out.push(self.render_page(pdf_path, page).await);
        }
        out
    }
}

/// pdfium-backed rasterizer; binds the library on demand via `pdfium-auto`.
#[derive(Debug, Clone)]
pub struct PdfiumRasterizer {
    dpi: u32,
    max_pixels: u32,
}

impl PdfiumRasterizer {
    pub fn new(dpi: u32, max_pixels: u32) -> Self {
        Self { dpi, max_pixels }
    }
}

#[async_trait]
impl Rasterizer for PdfiumRasterizer {
    async fn page_count(&self, pdf_path: &Path) -> Result<u32, IngestError> {
        let path = pdf_path.to_path_buf();
        tokio::task::spawn_blocking(move || page_count_blocking(&path))
            .await
            .map_err(|e| IngestError::Internal(format!("Page-count task panicked: {}", e)))?
    }

    async fn render_page(&self, pdf_path: &Path, page: u32) -> Result<DynamicImage, IngestError> {
        let path = pdf_path.to_path_buf();
        let (dpi, max_pixels) = (self.dpi, self.max_pixels);
        tokio::task::spawn_blocking(move || render_page_blocking(&path, page, dpi, max_pixels))
            .await
            .map_err(|e| IngestError::Internal(format!("Render task panicked: {}", e)))?
    }

    /// Opens the document once for the whole batch.
    async fn render_pages(
        &self,
        pdf_path: &Path,
        pages: &[u32],
    ) -> Vec<Result<DynamicImage, IngestError>> {
        let path = pdf_path.to_path_buf();
        let wanted = pages.to_vec();
        let (dpi, max_pixels) = (self.dpi, self.max_pixels);
        match tokio::task::spawn_blocking(move || {
            render_pages_blocking(&path, &wanted, dpi, max_pixels)
        })
        .await
        {
            Ok(results) => results,
            Err(e) => pages
                .iter()
                .map(|_| Err(IngestError::Internal(format!("Render task panicked: {}", e))))
                .collect(),
        }
    }

    async fn pages_text(&self, pdf_path: &Path, pages: &[u32]) -> Vec<Result<String, IngestError>> {
        let path = pdf_path.to_path_buf();
        let wanted = pages.to_vec();
        match tokio::task::spawn_blocking(move || pages_text_blocking(&path, &wanted)).await {
            Ok(results) => results,
            Err(e) => pages
                .iter()
                .map(|_| Err(IngestError::Internal(format!("Text task panicked: {}", e))))
                .collect(),
        }
    }
}

fn bind() -> Result<Pdfium, IngestError> {
    pdfium_auto::bind_pdfium_silent().map_err(|e| IngestError::PdfiumBindingFailed(e.to_string()))
}

fn open<'a>(pdfium: &'a Pdfium, path: &Path) -> Result<PdfDocument<'a>, IngestError> {
    pdfium
        .load_pdf_from_file(path, None)
        .map_err(|e| IngestError::CorruptPdf {
            detail: format!("{:?}", e),
        })
}

fn page_count_blocking(pdf_path: &Path) -> Result<u32, IngestError> {
    let pdfium = bind()?;
    let document = open(&pdfium, pdf_path)?;
    Ok(document.pages().len() as u32)
}

fn render_config(dpi: u32, max_pixels: u32) -> PdfRenderConfig {
    PdfRenderConfig::new()
        .scale_page_by_factor(dpi as f32 / 72.0)
        .set_maximum_width(max_pixels as i32)
        .set_maximum_height(max_pixels as i32)
}

fn render_page_blocking(
    pdf_path: &Path,
    page: u32,
    dpi: u32,
    max_pixels: u32,
) -> Result<DynamicImage, IngestError> {
    let pdfium = bind()?;
    let document = open(&pdfium, pdf_path)?;
    render_one(&document, page, &render_config(dpi, max_pixels))
}

fn render_pages_blocking(
    pdf_path: &Path,
    pages: &[u32],
    dpi: u32,
    max_pixels: u32,
) -> Vec<Result<DynamicImage, IngestError>> {
    let document_error = |e: IngestError| -> Vec<Result<DynamicImage, IngestError>> {
        let detail = e.to_string();
        pages
            .iter()
            .map(|&page| {
                Err(IngestError::RasterisationFailed {
                    page,
                    detail: detail.clone(),
                })
            })
            .collect()
    };

    let pdfium = match bind() {
        Ok(pdfium) => pdfium,
        Err(e) => return document_error(e),
    };
    let document = match open(&pdfium, pdf_path) {
        Ok(document) => document,
        Err(e) => return document_error(e),
    };

    let config = render_config(dpi, max_pixels);
    debug!("Rendering {} pages from one document handle", pages.len());
    pages
        .iter()
        .map(|&page| render_one(&document, page, &config))
        .collect()
}

fn pages_text_blocking(pdf_path: &Path, pages: &[u32]) -> Vec<Result<String, IngestError>> {
    let document_error = |e: IngestError| -> Vec<Result<String, IngestError>> {
        let detail = e.to_string();
        pages
            .iter()
            .map(|_| Err(IngestError::CorruptPdf { detail: detail.clone() }))
            .collect()
    };

    let pdfium = match bind() {
        Ok(pdfium) => pdfium,
        Err(e) => return document_error(e),
    };
    let document = match open(&pdfium, pdf_path) {
        Ok(document) => document,
        Err(e) => return document_error(e),
    };

    let doc_pages = document.pages();
    let total = doc_pages.len() as u32;
    pages
        .iter()
        .map(|&page| {
            if page == 0 || page > total {
                return Err(IngestError::PageOutOfRange { page, total });
            }
            let text_error = |e: PdfiumError| IngestError::CorruptPdf {
                detail: format!("page {page} text: {e:?}"),
            };
            let pdf_page = doc_pages.get((page - 1) as u16).map_err(text_error)?;
            let text = pdf_page.text().map_err(text_error)?;
            let all = text.all();
            Ok(all)
        })
        .collect()
}

fn render_one(
    document: &PdfDocument<'_>,
    page: u32,
    render_config: &PdfRenderConfig,
) -> Result<DynamicImage, IngestError> {
    let pages = document.pages();
    let total = pages.len() as u32;

    if page == 0 || page > total {
        return Err(IngestError::PageOutOfRange { page, total });
    }

    let pdf_page = pages
        .get((page - 1) as u16)
        .map_err(|e| IngestError::RasterisationFailed {
            page,
            detail: format!("{:?}", e),
        })?;

    let bitmap = pdf_page
        .render_with_config(render_config)
        .map_err(|e| IngestError::RasterisationFailed {
            page,
            detail: format!("{:?}", e),
        })?;

    let image = bitmap.as_image();
    debug!("Rendered page {} → {}x{} px", page, image.width(), image.height());
    Ok(image)
}
