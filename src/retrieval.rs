//! Read-side query surface over the manual store and its artifacts.
//!
//! Missing rows and missing artifacts are `Ok(None)`: a crop that was never
//! produced (degenerate box) or a page raster that was never stored is a
//! not-found result, never an error.

use crate::artifacts::ArtifactStore;
use crate::error::IngestError;
use crate::model::{ImageInfo, ImagePageRef, ManualInfo, SectionInfo, SectionRef};
use crate::pipeline::encode::encode_png;
use crate::pipeline::render::Rasterizer;
use crate::pipeline::sections::SectionTree;
use crate::store::ManualStore;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, warn};

/// An image region plus whether its crop artifact exists.
#[derive(Debug, Clone, Serialize)]
pub struct ImageEntry {
    #[serde(flatten)]
    pub image: ImageInfo,
    pub has_crop: bool,
}

/// Everything a downstream consumer needs to read one section.
#[derive(Debug, Clone, Serialize)]
pub struct SectionContent {
    pub reference: String,
    pub section: SectionInfo,
    /// `start_page..=end_page`, 1-indexed.
    pub pages: Vec<u32>,
    /// Images whose page lies in the section's range, in page order.
    pub images: Vec<ImageEntry>,
    /// Text layer of the section's pages, each prefixed with a
    /// `--- Page N ---` marker. `None` when the source PDF is missing.
    pub full_text: Option<String>,
}

/// Embedded text of one page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageText {
    pub page: u32,
    pub text: String,
}

#[derive(Clone)]
pub struct ManualLibrary {
    store: Arc<ManualStore>,
    artifacts: ArtifactStore,
    rasterizer: Arc<dyn Rasterizer>,
}

impl ManualLibrary {
    pub fn new(store: Arc<ManualStore>, artifacts: ArtifactStore, rasterizer: Arc<dyn Rasterizer>) -> Self {
        Self {
            store,
            artifacts,
            rasterizer,
        }
    }

    pub fn list_manuals(&self) -> Result<Vec<ManualInfo>, IngestError> {
        self.store.list_manuals()
    }

    pub fn get_manual(&self, manual_id: i64) -> Result<Option<ManualInfo>, IngestError> {
        self.store.get_manual(manual_id)
    }

    /// Sections in reading order (`start_page`, then id).
    pub fn list_sections(&self, manual_id: i64) -> Result<Vec<SectionInfo>, IngestError> {
        self.store.list_sections(manual_id)
    }

    /// The section addressed by `RAG_<manual_id>_<start_page>`: the first one
    /// created on that page.
    pub fn get_section(&self, manual_id: i64, start_page: u32) -> Result<Option<SectionInfo>, IngestError> {
        self.store.get_section(manual_id, start_page, 0)
    }

    pub fn resolve(&self, reference: &SectionRef) -> Result<Option<SectionInfo>, IngestError> {
        self.store.get_section(
            reference.manual_id,
            reference.start_page,
            reference.ordinal.unwrap_or(0),
        )
    }

    /// Parse and resolve a `RAG_...` string. Malformed strings are
    /// [`IngestError::InputInvalid`].
    pub fn resolve_str(&self, reference: &str) -> Result<Option<SectionInfo>, IngestError> {
        self.resolve(&reference.parse()?)
    }

    pub fn sections_in_page_range(
        &self,
        manual_id: i64,
        start_page: u32,
        end_page: u32,
    ) -> Result<Vec<SectionInfo>, IngestError> {
        self.store.sections_in_page_range(manual_id, start_page, end_page)
    }

    /// First section (reading order) whose name contains `needle`,
    /// ignoring case.
    pub fn find_section_by_name(&self, manual_id: i64, needle: &str) -> Result<Option<SectionInfo>, IngestError> {
        Ok(self
            .store
            .find_sections_by_name(Some(manual_id), needle)?
            .into_iter()
            .next())
    }

    /// All matches, across every manual when `manual_id` is `None`.
    pub fn search_sections(&self, manual_id: Option<i64>, needle: &str) -> Result<Vec<SectionInfo>, IngestError> {
        self.store.find_sections_by_name(manual_id, needle)
    }

    pub async fn section_content(&self, reference: &SectionRef) -> Result<Option<SectionContent>, IngestError> {
        let Some(section) = self.resolve(reference)? else {
            return Ok(None);
        };

        let mut images = Vec::new();
        for image in
            self.store
                .images_in_page_range(section.manual_id, section.start_page, section.end_page)?
        {
            let has_crop = self.artifacts.has_crop(image.id).await;
            images.push(ImageEntry { image, has_crop });
        }

        let pages: Vec<u32> = section.pages().collect();
        let full_text = self
            .get_pages_text(section.manual_id, &pages)
            .await?
            .map(|texts| {
                texts
                    .iter()
                    .map(|t| format!("--- Page {} ---\n{}", t.page, t.text.trim_end()))
                    .collect::<Vec<_>>()
                    .join("\n\n")
            });

        Ok(Some(SectionContent {
            reference: section.section_ref().to_string(),
            pages,
            section,
            images,
            full_text,
        }))
    }

    /// Text layer of the given 1-indexed pages, in the order asked.
    ///
    /// `Ok(None)` when the manual or its PDF is missing. Pages outside the
    /// document are left out.
    pub async fn get_pages_text(&self, manual_id: i64, pages: &[u32]) -> Result<Option<Vec<PageText>>, IngestError> {
        if self.store.get_manual(manual_id)?.is_none() || !self.artifacts.has_pdf(manual_id).await {
            debug!("Manual {}: no PDF to read text from", manual_id);
            return Ok(None);
        }

        let pdf_path = self.artifacts.pdf_path(manual_id);
        let texts = self.rasterizer.pages_text(&pdf_path, pages).await;
        let mut out = Vec::with_capacity(pages.len());
        for (&page, text) in pages.iter().zip(texts) {
            match text {
                Ok(text) => out.push(PageText { page, text }),
                Err(IngestError::PageOutOfRange { .. }) => {
                    debug!("Manual {}: page {} is outside the document", manual_id, page)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(Some(out))
    }

    pub fn section_tree(&self, manual_id: i64) -> Result<SectionTree, IngestError> {
        Ok(SectionTree::build(self.store.list_sections(manual_id)?))
    }

    pub fn get_image(&self, image_id: i64) -> Result<Option<ImageInfo>, IngestError> {
        self.store.get_image(image_id)
    }

    pub fn list_images(&self, manual_id: i64) -> Result<Vec<ImageInfo>, IngestError> {
        self.store.list_images(manual_id)
    }

    pub fn images_on_page(&self, reference: &ImagePageRef) -> Result<Vec<ImageInfo>, IngestError> {
        self.store.images_on_page(reference.manual_id, reference.page)
    }

    /// PNG crop for an image region; `None` when the row or artifact is absent.
    pub async fn get_image_crop(&self, image_id: i64) -> Result<Option<Vec<u8>>, IngestError> {
        if self.store.get_image(image_id)?.is_none() {
            return Ok(None);
        }
        self.artifacts.get_crop(image_id).await
    }

    /// PNG raster of a 1-indexed page.
    ///
    /// Served from the stored page artifact; when that is missing but the
    /// manual's PDF is on disk the page is rendered again and cached.
    pub async fn get_page_raster(&self, manual_id: i64, page: u32) -> Result<Option<Vec<u8>>, IngestError> {
        if page == 0 || self.store.get_manual(manual_id)?.is_none() {
            return Ok(None);
        }
        if let Some(png) = self.artifacts.get_page_raster(manual_id, page).await? {
            return Ok(Some(png));
        }
        if !self.artifacts.has_pdf(manual_id).await {
            debug!("Manual {}: no stored raster and no PDF for page {}", manual_id, page);
            return Ok(None);
        }

        let pdf_path = self.artifacts.pdf_path(manual_id);
        let raster = match self.rasterizer.render_page(&pdf_path, page).await {
            Ok(raster) => raster,
            Err(IngestError::PageOutOfRange { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        let png = encode_png(&raster).map_err(|e| IngestError::RasterisationFailed {
            page,
            detail: format!("PNG encoding failed: {e}"),
        })?;

        if let Err(e) = self.artifacts.put_page_raster(manual_id, page, &png).await {
            warn!("Manual {} page {}: re-rendered raster not cached: {}", manual_id, page, e);
        }
        Ok(Some(png))
    }
}
