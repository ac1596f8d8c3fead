//! Ingestion orchestrator: PDF bytes + metadata → manual, sections, images, crops.
//!
//! ## Order of operations
//!
//! 1. validate metadata and the `%PDF` magic; stage the bytes on disk and
//!    count pages. Nothing is persisted if any of this fails.
//! 2. create the manual row, then move the staged PDF to `<manual_id>.pdf`.
//! 3. for each page in order: render (a batch of pages per document open),
//!    encode, optionally save the raster, analyze. A render or extraction
//!    failure is logged and the page is skipped.
//! 4. persist the page's sections, then its image rows, cutting one crop per
//!    image from the in-memory raster.
//!
//! With `concurrency > 1` steps 3 of up to N pages overlap, but step 4 is
//! always applied by this task in page order, so ids and section ordinals
//! come out the same as a sequential run.
//!
//! Store errors abort the call. Rows written before the failure remain; the
//! manual id is only ever returned when the manual row was committed.

use crate::artifacts::ArtifactStore;
use crate::config::{IngestConfig, ManualMetadata};
use crate::error::{IngestError, PageError};
use crate::model::NewImage;
use crate::output::{IngestOutput, IngestStats, PageOutcome};
use crate::pipeline::analyze::{
    resolve_provider, LlmVisionClient, PageAnalysis, PageAnalyzer, PageContext, VisionClient,
};
use crate::pipeline::render::{PdfiumRasterizer, Rasterizer};
use crate::pipeline::{encode, geometry, input, sections};
use crate::retrieval::ManualLibrary;
use crate::store::ManualStore;
use futures::stream::{self, StreamExt};
use image::DynamicImage;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const DOWNLOAD_TIMEOUT_SECS: u64 = 120;

/// Pages rendered per document open, unless `concurrency` is larger.
const RENDER_BATCH_PAGES: usize = 8;

/// Cooperative cancellation, checked between pages.
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Render + analysis result for one page, before anything is persisted.
struct PageWork {
    page: u32,
    raster: Option<DynamicImage>,
    analysis: Result<PageAnalysis, PageError>,
}

pub struct ManualIngestor {
    store: Arc<ManualStore>,
    artifacts: ArtifactStore,
    rasterizer: Arc<dyn Rasterizer>,
    analyzer: PageAnalyzer,
    config: IngestConfig,
}

impl ManualIngestor {
    /// Assemble an ingestor from explicit components.
    pub fn new(
        store: Arc<ManualStore>,
        artifacts: ArtifactStore,
        rasterizer: Arc<dyn Rasterizer>,
        vision: Arc<dyn VisionClient>,
        config: IngestConfig,
    ) -> Self {
        let analyzer = PageAnalyzer::new(vision, &config);
        Self {
            store,
            artifacts,
            rasterizer,
            analyzer,
            config,
        }
    }

    /// Production wiring: SQLite at `database_path`, artifacts under
    /// `storage_dir`, pdfium rendering and the resolved LLM provider.
    pub fn from_config(config: IngestConfig) -> Result<Self, IngestError> {
        let provider = resolve_provider(&config)?;
        let vision: Arc<dyn VisionClient> = Arc::new(LlmVisionClient::new(provider, &config));
        let store = Arc::new(ManualStore::open(&config.database_path)?);
        let artifacts = ArtifactStore::new(&config.storage_dir);
        let rasterizer: Arc<dyn Rasterizer> = Arc::new(PdfiumRasterizer::new(
            config.dpi,
            config.max_rendered_pixels,
        ));
        Ok(Self::new(store, artifacts, rasterizer, vision, config))
    }

    pub fn store(&self) -> &Arc<ManualStore> {
        &self.store
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Read-side view over the same store and artifacts.
    pub fn library(&self) -> ManualLibrary {
        ManualLibrary::new(
            Arc::clone(&self.store),
            self.artifacts.clone(),
            Arc::clone(&self.rasterizer),
        )
    }

    /// Ingest a manual from a local path or `http(s)` URL.
    pub async fn ingest_file(
        &self,
        input_str: &str,
        metadata: &ManualMetadata,
    ) -> Result<IngestOutput, IngestError> {
        metadata.validate()?;
        let bytes = input::load_pdf_bytes(input_str, DOWNLOAD_TIMEOUT_SECS).await?;
        self.ingest(&bytes, metadata).await
    }

    /// Ingest one manual. Returns once every page has been attempted.
    pub async fn ingest(
        &self,
        pdf_bytes: &[u8],
        metadata: &ManualMetadata,
    ) -> Result<IngestOutput, IngestError> {
        self.ingest_with_cancel(pdf_bytes, metadata, &CancellationFlag::new())
            .await
    }

    /// [`ingest`](Self::ingest) with a cancellation flag checked between
    /// pages. A cancelled run returns [`IngestError::Cancelled`]; the rows of
    /// completed pages stay in the store.
    pub async fn ingest_with_cancel(
        &self,
        pdf_bytes: &[u8],
        metadata: &ManualMetadata,
        cancel: &CancellationFlag,
    ) -> Result<IngestOutput, IngestError> {
        let total_start = Instant::now();

        // ── Step 1: Validate before persisting anything ──────────────────
        metadata.validate()?;
        input::validate_pdf_bytes(pdf_bytes)?;

        let staged = self.artifacts.stage_pdf(pdf_bytes).await?;
        let total_pages = self.rasterizer.page_count(staged.path()).await?;
        if total_pages == 0 {
            return Err(IngestError::InputInvalid("PDF has no pages".to_string()));
        }

        // ── Step 2: Manual row + PDF artifact ────────────────────────────
        let manual_id = self.store.create_manual(metadata)?;
        let pdf_path = self.artifacts.commit_pdf(staged, manual_id).await?;
        info!(
            "Ingesting manual {} ({} {} {}, {}): {} pages",
            manual_id,
            metadata.make,
            metadata.model,
            metadata.year,
            metadata.classification,
            total_pages
        );

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_ingest_start(manual_id, total_pages);
        }

        // ── Step 3+4: Analyze in parallel, persist in page order ─────────
        let mut pages: Vec<PageOutcome> = Vec::with_capacity(total_pages as usize);
        let batch_len = self.config.concurrency.max(RENDER_BATCH_PAGES);
        let batches: Vec<Vec<u32>> = (1..=total_pages)
            .collect::<Vec<_>>()
            .chunks(batch_len)
            .map(<[u32]>::to_vec)
            .collect();
        let mut work = std::pin::pin!(stream::iter(batches)
            .then(|batch| self.render_batch(&pdf_path, batch, cancel))
            .flat_map(stream::iter)
            .map(|(page, raster)| self.analyze_page(manual_id, page, total_pages, raster, cancel))
            .buffered(self.config.concurrency.max(1)));

        while let Some(result) = work.next().await {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = self.persist_page(manual_id, total_pages, result).await?;
            pages.push(outcome);
        }
        drop(work);

        if cancel.is_cancelled() && pages.len() < total_pages as usize {
            let pages_done = pages.len() as u32;
            warn!(
                "Manual {}: cancelled after {}/{} pages",
                manual_id, pages_done, total_pages
            );
            return Err(IngestError::Cancelled {
                manual_id,
                pages_done,
            });
        }

        let stats = IngestStats::from_pages(
            total_pages,
            &pages,
            total_start.elapsed().as_millis() as u64,
        );
        info!(
            "Manual {} complete: {}/{} pages, {} sections, {} images, {}ms",
            manual_id,
            stats.indexed_pages,
            total_pages,
            stats.sections,
            stats.images,
            stats.total_duration_ms
        );

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_ingest_complete(manual_id, total_pages, stats.indexed_pages);
        }

        Ok(IngestOutput {
            manual_id,
            stats,
            pages,
        })
    }

    /// Render a run of pages through one document handle.
    async fn render_batch(
        &self,
        pdf_path: &Path,
        pages: Vec<u32>,
        cancel: &CancellationFlag,
    ) -> Vec<(u32, Result<DynamicImage, IngestError>)> {
        if cancel.is_cancelled() {
            return pages
                .into_iter()
                .map(|page| (page, Err(IngestError::Internal("cancelled".to_string()))))
                .collect();
        }
        let rasters = self.rasterizer.render_pages(pdf_path, &pages).await;
        if rasters.len() != pages.len() {
            let detail = format!("rasterizer returned {} of {} pages", rasters.len(), pages.len());
            return pages
                .into_iter()
                .map(|page| (page, Err(IngestError::Internal(detail.clone()))))
                .collect();
        }
        pages.into_iter().zip(rasters).collect()
    }

    /// Encode and analyze one rendered page. Touches no store rows.
    async fn analyze_page(
        &self,
        manual_id: i64,
        page: u32,
        total_pages: u32,
        raster: Result<DynamicImage, IngestError>,
        cancel: &CancellationFlag,
    ) -> PageWork {
        let skipped = |detail: &str| PageWork {
            page,
            raster: None,
            analysis: Err(PageError::RenderFailed {
                page,
                detail: detail.to_string(),
            }),
        };
        if cancel.is_cancelled() {
            return skipped("cancelled");
        }

        let raster = match raster {
            Ok(img) => img,
            Err(e) => return skipped(&e.to_string()),
        };
        let png = match encode::encode_png(&raster) {
            Ok(png) => png,
            Err(e) => return skipped(&format!("PNG encoding failed: {e}")),
        };

        if self.config.store_page_rasters {
            if let Err(e) = self.artifacts.put_page_raster(manual_id, page, &png).await {
                warn!("Page {}: raster not saved: {}", page, e);
            }
        }

        let analysis = self
            .analyzer
            .analyze(&png, PageContext { page, total_pages })
            .await;

        PageWork {
            page,
            raster: Some(raster),
            analysis,
        }
    }

    /// Write the sections, images and crops of one analysed page.
    async fn persist_page(
        &self,
        manual_id: i64,
        total_pages: u32,
        work: PageWork,
    ) -> Result<PageOutcome, IngestError> {
        let PageWork {
            page,
            raster,
            analysis,
        } = work;
        let mut outcome = PageOutcome::new(page);

        let (analysis, raster) = match (analysis, raster) {
            (Ok(analysis), Some(raster)) => (analysis, raster),
            (Err(e), _) => {
                warn!("{}", e);
                if let Some(ref cb) = self.config.progress_callback {
                    cb.on_page_error(page, total_pages, e.to_string());
                }
                if let PageError::ExtractionFailed { attempts, .. } = &e {
                    outcome.attempts = *attempts;
                }
                outcome.error = Some(e);
                return Ok(outcome);
            }
            (Ok(_), None) => {
                return Err(IngestError::Internal(format!(
                    "page {page} analysed without a raster"
                )))
            }
        };

        outcome.attempts = analysis.attempts;
        outcome.input_tokens = analysis.input_tokens;
        outcome.output_tokens = analysis.output_tokens;
        outcome.duration_ms = analysis.duration_ms;

        for section in sections::assemble(page, &analysis.blocks.headings) {
            let info = self.store.add_section(manual_id, &section)?;
            debug!(
                "Page {}: section {} '{}' ({})",
                page,
                info.id,
                info.name,
                info.section_ref()
            );
            outcome.section_ids.push(info.id);
        }

        for block in analysis.blocks.images {
            if !block.bbox.is_within_unit() {
                warn!(
                    "Page {}: image box {:?} outside the page; clamped",
                    page, block.bbox
                );
            }
            let info = self.store.add_image(
                manual_id,
                &NewImage {
                    page,
                    bbox: block.bbox,
                    description: block.description,
                },
            )?;
            outcome.image_ids.push(info.id);

            let crop = match geometry::crop_png(&raster, &info.bbox) {
                Ok(Some(png)) => self.artifacts.put_crop(info.id, &png).await.map_err(|e| e.to_string()),
                Ok(None) => {
                    warn!("Page {}: image {} has a degenerate box; no crop", page, info.id);
                    outcome.crops_skipped += 1;
                    continue;
                }
                Err(e) => Err(format!("crop encoding failed: {e}")),
            };

            match crop {
                Ok(()) => outcome.crops_written += 1,
                Err(detail) => {
                    warn!("Page {}: crop for image {} failed: {}", page, info.id, detail);
                    outcome.crops_skipped += 1;
                    outcome.error.get_or_insert(PageError::CropFailed {
                        page,
                        image_id: info.id,
                        detail,
                    });
                }
            }
        }

        if let Some(ref cb) = self.config.progress_callback {
            cb.on_page_complete(
                page,
                total_pages,
                outcome.section_ids.len(),
                outcome.image_ids.len(),
            );
        }

        Ok(outcome)
    }
}
