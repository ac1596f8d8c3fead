//! Integration tests for the ingestion orchestrator and the read side.
//!
//! Rendering and the vision model are replaced by in-process fakes, so these
//! tests need neither pdfium nor an API key. Storage is a real SQLite store
//! and a real artifact directory under a `TempDir`.

use async_trait::async_trait;
use image::{DynamicImage, Rgba, RgbaImage};
use manual_index::error::ExtractionError;
use manual_index::pipeline::analyze::{PageContext, VisionReply};
use manual_index::{
    ArtifactStore, CancellationFlag, Classification, ExtractionErrorKind, IngestConfig, IngestError,
    IngestProgressCallback, ManualIngestor, ManualMetadata, ManualStore, PageError, Rasterizer,
    SectionRef, VisionClient,
};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

const PAGE_W: u32 = 1000;
const PAGE_H: u32 = 800;
const PDF: &[u8] = b"%PDF-1.7\n% fake manual\n";

// ── Fakes ────────────────────────────────────────────────────────────────────

/// Produces blank `PAGE_W` × `PAGE_H` rasters; fails for pages in `broken`.
/// `batches` counts document opens (calls to `render_pages`).
struct FakeRasterizer {
    pages: u32,
    broken: HashSet<u32>,
    batches: Arc<AtomicU32>,
}

impl FakeRasterizer {
    fn new(pages: u32) -> Self {
        Self {
            pages,
            broken: HashSet::new(),
            batches: Arc::new(AtomicU32::new(0)),
        }
    }
}

#[async_trait]
impl Rasterizer for FakeRasterizer {
    async fn page_count(&self, pdf_path: &Path) -> Result<u32, IngestError> {
        assert!(pdf_path.exists(), "rasterizer must see a real file");
        Ok(self.pages)
    }

    async fn render_page(&self, _pdf_path: &Path, page: u32) -> Result<DynamicImage, IngestError> {
        if page == 0 || page > self.pages {
            return Err(IngestError::PageOutOfRange {
                page,
                total: self.pages,
            });
        }
        if self.broken.contains(&page) {
            return Err(IngestError::RasterisationFailed {
                page,
                detail: "simulated".into(),
            });
        }
        Ok(DynamicImage::ImageRgba8(RgbaImage::from_pixel(
            PAGE_W,
            PAGE_H,
            Rgba([250, 250, 250, 255]),
        )))
    }

    async fn render_pages(
        &self,
        pdf_path: &Path,
        pages: &[u32],
    ) -> Vec<Result<DynamicImage, IngestError>> {
        self.batches.fetch_add(1, Ordering::SeqCst);
        let mut out = Vec::with_capacity(pages.len());
        for &page in pages {
            out.push(self.render_page(pdf_path, page).await);
        }
        out
    }

    async fn pages_text(&self, _pdf_path: &Path, pages: &[u32]) -> Vec<Result<String, IngestError>> {
        pages
            .iter()
            .map(|&page| {
                if page == 0 || page > self.pages {
                    Err(IngestError::PageOutOfRange {
                        page,
                        total: self.pages,
                    })
                } else {
                    Ok(format!("Text layer of page {page}.\n"))
                }
            })
            .collect()
    }
}

/// Answers by page number; pages without a reply fail every attempt.
#[derive(Default)]
struct FakeVision {
    replies: HashMap<u32, String>,
    calls: AtomicU32,
}

impl FakeVision {
    fn with(mut self, page: u32, reply: &str) -> Self {
        self.replies.insert(page, reply.to_string());
        self
    }
}

#[async_trait]
impl VisionClient for FakeVision {
    async fn complete(
        &self,
        _system_prompt: &str,
        page_png: &[u8],
        ctx: PageContext,
    ) -> Result<VisionReply, ExtractionError> {
        assert_eq!(&page_png[1..4], b"PNG");
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.replies.get(&ctx.page) {
            Some(content) => Ok(VisionReply {
                content: content.clone(),
                input_tokens: 100,
                output_tokens: 20,
            }),
            None => Err(ExtractionError::new(
                ExtractionErrorKind::Provider,
                "simulated outage",
            )),
        }
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<ManualStore>,
    artifacts: ArtifactStore,
    ingestor: ManualIngestor,
}

fn harness(rasterizer: FakeRasterizer, vision: Arc<FakeVision>, config: IngestConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(ManualStore::open(dir.path().join("manuals.db")).unwrap());
    let artifacts = ArtifactStore::new(dir.path());
    let ingestor = ManualIngestor::new(
        Arc::clone(&store),
        artifacts.clone(),
        Arc::new(rasterizer),
        vision,
        config,
    );
    Harness {
        dir,
        store,
        artifacts,
        ingestor,
    }
}

impl Harness {
    fn db_path(&self) -> std::path::PathBuf {
        self.dir.path().join("manuals.db")
    }
}

fn fast_config() -> IngestConfig {
    IngestConfig::builder().retry_backoff_ms(1).build().unwrap()
}

fn police_explorer() -> ManualMetadata {
    ManualMetadata::new("Ford", "Explorer", 2020, Classification::Police)
}

const ENGINE_PAGE: &str = r#"{
  "headings": [{"description": "Engine", "level": 1}],
  "images": [{"description": "Engine bay overview", "x": 0.1, "y": 0.1, "w": 0.3, "h": 0.2}]
}"#;
const BRAKES_PAGE: &str = r#"{"headings": [{"description": "Brakes", "level": 1}], "images": []}"#;

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_page_manual_with_failed_middle_page() {
    let vision = Arc::new(FakeVision::default().with(1, ENGINE_PAGE).with(3, BRAKES_PAGE));
    let h = harness(FakeRasterizer::new(3), Arc::clone(&vision), fast_config());

    let output = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap();
    let id = output.manual_id;

    let manual = h.store.get_manual(id).unwrap().unwrap();
    assert_eq!(manual.make, "Ford");
    assert_eq!(manual.classification, Classification::Police);
    assert!(h.artifacts.has_pdf(id).await);

    let sections = h.store.list_sections(id).unwrap();
    let summary: Vec<_> = sections.iter().map(|s| (s.start_page, s.name.as_str())).collect();
    assert_eq!(summary, [(1, "Engine"), (3, "Brakes")]);
    assert!(sections.iter().all(|s| s.end_page == s.start_page && s.level == 1));

    let images = h.store.list_images(id).unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].page, 1);
    assert_eq!(images[0].description, "Engine bay overview");

    let crop = h.artifacts.get_crop(images[0].id).await.unwrap().unwrap();
    let crop = image::load_from_memory(&crop).unwrap();
    assert_eq!((crop.width(), crop.height()), (300, 160));

    // Page 2 used its whole retry budget and was skipped.
    let page2 = &output.pages[1];
    match page2.error {
        Some(PageError::ExtractionFailed {
            page: 2,
            attempts: 3,
            kind: ExtractionErrorKind::Provider,
            ..
        }) => {}
        ref other => panic!("unexpected page 2 outcome {other:?}"),
    }
    assert_eq!(vision.calls.load(Ordering::SeqCst), 1 + 3 + 1);

    assert_eq!(output.stats.total_pages, 3);
    assert_eq!(output.stats.indexed_pages, 2);
    assert_eq!(output.stats.failed_pages, 1);
    assert_eq!(output.stats.sections, 2);
    assert_eq!(output.stats.images, 1);
    assert_eq!(output.stats.crops_written, 1);
    assert_eq!(output.stats.total_input_tokens, 200);
}

#[tokio::test]
async fn reingest_yields_disjoint_ids() {
    let vision = Arc::new(FakeVision::default().with(1, ENGINE_PAGE).with(2, BRAKES_PAGE));
    let h = harness(FakeRasterizer::new(2), vision, fast_config());

    let first = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap();
    let second = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap();
    assert_ne!(first.manual_id, second.manual_id);

    let ids = |manual_id| -> (HashSet<i64>, HashSet<i64>) {
        (
            h.store.list_sections(manual_id).unwrap().iter().map(|s| s.id).collect(),
            h.store.list_images(manual_id).unwrap().iter().map(|i| i.id).collect(),
        )
    };
    let (s1, i1) = ids(first.manual_id);
    let (s2, i2) = ids(second.manual_id);
    assert_eq!((s1.len(), s2.len()), (2, 2));
    assert!(s1.is_disjoint(&s2));
    assert!(i1.is_disjoint(&i2));
}

#[tokio::test]
async fn render_failure_skips_only_that_page() {
    let mut rasterizer = FakeRasterizer::new(3);
    rasterizer.broken.insert(2);
    let vision = Arc::new(
        FakeVision::default()
            .with(1, ENGINE_PAGE)
            .with(2, BRAKES_PAGE)
            .with(3, BRAKES_PAGE),
    );
    let h = harness(rasterizer, Arc::clone(&vision), fast_config());

    let output = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap();
    assert!(matches!(
        output.pages[1].error,
        Some(PageError::RenderFailed { page: 2, .. })
    ));
    let pages: Vec<_> = h
        .store
        .list_sections(output.manual_id)
        .unwrap()
        .iter()
        .map(|s| s.start_page)
        .collect();
    assert_eq!(pages, [1, 3]);
    // The analyzer never saw page 2.
    assert_eq!(vision.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn degenerate_box_keeps_row_without_crop() {
    let reply = r#"{"headings": [], "images": [
        {"description": "flat", "x": 0.5, "y": 0.5, "w": 0.0, "h": 0.3},
        {"description": "off page", "bbox": {"x": 1.4, "y": 0.2, "w": 0.3, "h": 0.3}}
    ]}"#;
    let vision = Arc::new(FakeVision::default().with(1, reply));
    let h = harness(FakeRasterizer::new(1), vision, fast_config());

    let output = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap();
    let images = h.store.list_images(output.manual_id).unwrap();
    assert_eq!(images.len(), 2);
    assert!(images.iter().all(|i| i.bbox.is_within_unit()));

    let library = h.ingestor.library();
    for image in &images {
        assert!(library.get_image_crop(image.id).await.unwrap().is_none());
    }
    assert_eq!(output.stats.crops_written, 0);
    assert_eq!(output.stats.crops_skipped, 2);
    assert!(output.pages[0].error.is_none(), "degenerate boxes are not errors");
}

#[tokio::test]
async fn same_page_headings_get_ordinals() {
    let reply = r#"{"elements": [
        {"type": "heading", "text": "Electrical", "level": 1},
        {"type": "heading", "text": "Fuses", "hierarchy": ["Electrical", "Fuses"]},
        {"type": "image", "description": "Fuse panel", "bbox": [0.0, 0.5, 0.5, 0.5]}
    ]}"#;
    let vision = Arc::new(FakeVision::default().with(1, reply));
    let h = harness(FakeRasterizer::new(1), vision, fast_config());

    let id = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap().manual_id;
    let library = h.ingestor.library();

    let first = library.get_section(id, 1).unwrap().unwrap();
    assert_eq!(first.name, "Electrical");
    assert_eq!(first.section_ref().to_string(), format!("RAG_{id}_1"));

    let second = library
        .resolve(&SectionRef::new(id, 1).with_ordinal(1))
        .unwrap()
        .unwrap();
    assert_eq!(second.name, "Electrical > Fuses");
    assert_eq!(second.level, 2);
    assert_eq!(second.section_ref().to_string(), format!("RAG_{id}_1_1"));

    let content = library
        .section_content(&SectionRef::new(id, 1))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(content.pages, [1]);
    assert_eq!(content.images.len(), 1);
    assert!(content.images[0].has_crop);
    assert_eq!(
        content.full_text.as_deref(),
        Some("--- Page 1 ---\nText layer of page 1.")
    );

    let tree = library.section_tree(id).unwrap();
    assert_eq!(tree.roots.len(), 1);
    assert_eq!(tree.nodes[tree.roots[0]].children.len(), 1);

    let hit = library.find_section_by_name(id, "fuses").unwrap().unwrap();
    assert_eq!(hit.id, second.id);
}

#[tokio::test]
async fn concurrent_analysis_persists_in_page_order() {
    let mut vision = FakeVision::default();
    for page in 1..=6 {
        vision = vision.with(
            page,
            &format!(r#"{{"headings": [{{"description": "Chapter {page}", "level": 1}}]}}"#),
        );
    }
    let config = IngestConfig::builder()
        .retry_backoff_ms(1)
        .concurrency(4)
        .build()
        .unwrap();
    let h = harness(FakeRasterizer::new(6), Arc::new(vision), config);

    let output = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap();
    let sections = h.store.list_sections(output.manual_id).unwrap();
    let pages: Vec<_> = sections.iter().map(|s| s.start_page).collect();
    assert_eq!(pages, [1, 2, 3, 4, 5, 6]);
    assert!(sections.windows(2).all(|w| w[0].id < w[1].id));
    let outcome_pages: Vec<_> = output.pages.iter().map(|p| p.page).collect();
    assert_eq!(outcome_pages, [1, 2, 3, 4, 5, 6]);
}

#[tokio::test]
async fn page_rasters_are_stored_when_enabled() {
    let vision = Arc::new(FakeVision::default().with(1, BRAKES_PAGE));
    let h = harness(FakeRasterizer::new(1), Arc::clone(&vision), fast_config());
    let id = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap().manual_id;
    assert!(h.artifacts.get_page_raster(id, 1).await.unwrap().is_some());

    let config = IngestConfig::builder()
        .retry_backoff_ms(1)
        .store_page_rasters(false)
        .build()
        .unwrap();
    let h = harness(FakeRasterizer::new(1), vision, config);
    let id = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap().manual_id;
    assert!(h.artifacts.get_page_raster(id, 1).await.unwrap().is_none());
    // Re-rendered on demand from the stored PDF.
    let png = h.ingestor.library().get_page_raster(id, 1).await.unwrap().unwrap();
    assert_eq!(image::load_from_memory(&png).unwrap().width(), PAGE_W);
}

// ── Input validation ─────────────────────────────────────────────────────────

#[tokio::test]
async fn invalid_input_persists_nothing() {
    let vision = Arc::new(FakeVision::default());
    let h = harness(FakeRasterizer::new(2), Arc::clone(&vision), fast_config());

    let err = h.ingestor.ingest(b"GIF89a", &police_explorer()).await.unwrap_err();
    assert!(matches!(err, IngestError::NotAPdf { .. }));

    let bad_year = ManualMetadata::new("Ford", "Explorer", 1700, Classification::Police);
    let err = h.ingestor.ingest(PDF, &bad_year).await.unwrap_err();
    assert!(matches!(err, IngestError::InputInvalid(_)));

    let no_make = ManualMetadata::new("  ", "Explorer", 2020, Classification::Police);
    assert!(h.ingestor.ingest(PDF, &no_make).await.is_err());

    assert!(h.store.list_manuals().unwrap().is_empty());
    assert_eq!(vision.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn empty_pdf_is_rejected_before_manual_row() {
    let h = harness(FakeRasterizer::new(0), Arc::new(FakeVision::default()), fast_config());
    let err = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap_err();
    assert!(matches!(err, IngestError::InputInvalid(_)));
    assert!(h.store.list_manuals().unwrap().is_empty());
}

// ── Cancellation & progress ──────────────────────────────────────────────────

/// Records events and cancels once `cancel_after` pages completed.
struct Recorder {
    events: Mutex<Vec<String>>,
    cancel: CancellationFlag,
    cancel_after: u32,
}

impl IngestProgressCallback for Recorder {
    fn on_ingest_start(&self, _manual_id: i64, total_pages: u32) {
        self.events.lock().unwrap().push(format!("start {total_pages}"));
    }

    fn on_page_complete(&self, page: u32, _total: u32, sections: usize, images: usize) {
        self.events
            .lock()
            .unwrap()
            .push(format!("page {page}: {sections}s {images}i"));
        if page >= self.cancel_after {
            self.cancel.cancel();
        }
    }

    fn on_page_error(&self, page: u32, _total: u32, _error: String) {
        self.events.lock().unwrap().push(format!("error {page}"));
    }

    fn on_ingest_complete(&self, _manual_id: i64, total_pages: u32, success_count: u32) {
        self.events
            .lock()
            .unwrap()
            .push(format!("done {success_count}/{total_pages}"));
    }
}

#[tokio::test]
async fn progress_events_in_page_order() {
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
        cancel: CancellationFlag::new(),
        cancel_after: u32::MAX,
    });
    let config = IngestConfig::builder()
        .retry_backoff_ms(1)
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let vision = Arc::new(FakeVision::default().with(1, ENGINE_PAGE).with(3, BRAKES_PAGE));
    let h = harness(FakeRasterizer::new(3), vision, config);

    h.ingestor.ingest(PDF, &police_explorer()).await.unwrap();
    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(
        events,
        ["start 3", "page 1: 1s 1i", "error 2", "page 3: 1s 0i", "done 2/3"]
    );
}

#[tokio::test]
async fn cancellation_between_pages_keeps_finished_rows() {
    let cancel = CancellationFlag::new();
    let recorder = Arc::new(Recorder {
        events: Mutex::new(Vec::new()),
        cancel: cancel.clone(),
        cancel_after: 1,
    });
    let config = IngestConfig::builder()
        .retry_backoff_ms(1)
        .progress_callback(recorder.clone())
        .build()
        .unwrap();
    let vision = Arc::new(
        FakeVision::default()
            .with(1, ENGINE_PAGE)
            .with(2, BRAKES_PAGE)
            .with(3, BRAKES_PAGE),
    );
    let h = harness(FakeRasterizer::new(3), vision, config);

    let err = h
        .ingestor
        .ingest_with_cancel(PDF, &police_explorer(), &cancel)
        .await
        .unwrap_err();
    let manual_id = match err {
        IngestError::Cancelled {
            manual_id,
            pages_done,
        } => {
            assert_eq!(pages_done, 1);
            manual_id
        }
        other => panic!("expected Cancelled, got {other:?}"),
    };

    assert!(h.store.get_manual(manual_id).unwrap().is_some());
    let sections = h.store.list_sections(manual_id).unwrap();
    assert_eq!(sections.len(), 1);
    assert_eq!(sections[0].name, "Engine");
    assert!(!recorder
        .events
        .lock()
        .unwrap()
        .iter()
        .any(|e| e.starts_with("done")));
}

#[tokio::test]
async fn pages_render_in_batches_per_document_open() {
    let mut vision = FakeVision::default();
    for page in 1..=10 {
        vision = vision.with(page, BRAKES_PAGE);
    }
    let rasterizer = FakeRasterizer::new(10);
    let batches = Arc::clone(&rasterizer.batches);
    let h = harness(rasterizer, Arc::new(vision), fast_config());

    let output = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap();
    assert_eq!(output.stats.indexed_pages, 10);
    // 8 pages per open, so 10 pages need two.
    assert_eq!(batches.load(Ordering::SeqCst), 2);
    let pages: Vec<_> = output.pages.iter().map(|p| p.page).collect();
    assert_eq!(pages, (1..=10).collect::<Vec<_>>());
}

#[tokio::test]
async fn page_text_is_served_from_the_stored_pdf() {
    let vision = Arc::new(FakeVision::default().with(1, ENGINE_PAGE).with(2, BRAKES_PAGE));
    let h = harness(FakeRasterizer::new(2), vision, fast_config());
    let id = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap().manual_id;
    let library = h.ingestor.library();

    let texts = library.get_pages_text(id, &[2, 5]).await.unwrap().unwrap();
    assert_eq!(texts.len(), 1);
    assert_eq!(texts[0].page, 2);
    assert_eq!(texts[0].text, "Text layer of page 2.\n");

    assert!(library.get_pages_text(id + 100, &[1]).await.unwrap().is_none());
    std::fs::remove_file(h.artifacts.pdf_path(id)).unwrap();
    assert!(library.get_pages_text(id, &[1]).await.unwrap().is_none());
    let content = library
        .section_content(&SectionRef::new(id, 1))
        .await
        .unwrap()
        .unwrap();
    assert!(content.full_text.is_none());
}

// ── Storage failures ─────────────────────────────────────────────────────────

#[tokio::test]
async fn store_failure_mid_run_aborts_and_keeps_earlier_rows() {
    let vision = Arc::new(FakeVision::default().with(1, BRAKES_PAGE).with(2, ENGINE_PAGE));
    let h = harness(FakeRasterizer::new(2), Arc::clone(&vision), fast_config());

    let raw = rusqlite::Connection::open(h.db_path()).unwrap();
    raw.execute_batch(
        "CREATE TRIGGER refuse_images BEFORE INSERT ON images
         BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
    )
    .unwrap();

    let err = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap_err();
    assert!(
        matches!(err, IngestError::StoreUnavailable(_)),
        "expected StoreUnavailable, got {err:?}"
    );

    let manuals = h.store.list_manuals().unwrap();
    assert_eq!(manuals.len(), 1);
    let id = manuals[0].id;
    let names: Vec<_> = h
        .store
        .list_sections(id)
        .unwrap()
        .into_iter()
        .map(|s| (s.start_page, s.name))
        .collect();
    // Page 1 and the heading of page 2 were committed before its image failed.
    assert_eq!(names, [(1, "Brakes".to_string()), (2, "Engine".to_string())]);
    assert!(h.store.list_images(id).unwrap().is_empty());
}

#[tokio::test]
async fn unwritable_crop_directory_keeps_image_row() {
    let vision = Arc::new(FakeVision::default().with(1, ENGINE_PAGE).with(2, BRAKES_PAGE));
    let h = harness(FakeRasterizer::new(2), vision, fast_config());
    std::fs::write(h.dir.path().join("crops"), b"not a directory").unwrap();

    let output = h.ingestor.ingest(PDF, &police_explorer()).await.unwrap();
    let images = h.store.list_images(output.manual_id).unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].description, "Engine bay overview");

    match &output.pages[0].error {
        Some(PageError::CropFailed { page: 1, image_id, .. }) => assert_eq!(*image_id, images[0].id),
        other => panic!("expected CropFailed on page 1, got {other:?}"),
    }
    assert!(output.pages[0].is_indexed());
    assert!(output.pages[1].error.is_none());
    assert_eq!(output.stats.indexed_pages, 2);
    assert_eq!(output.stats.crops_written, 0);
    assert_eq!(output.stats.crops_skipped, 1);
    assert!(!h.artifacts.has_crop(images[0].id).await);
}
