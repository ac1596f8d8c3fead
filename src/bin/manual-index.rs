//! CLI binary for manual-index.
//!
//! A thin shim over the library crate: `ingest` maps flags onto
//! `IngestConfig` and runs the orchestrator; the other subcommands read
//! back through `ManualLibrary`.

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use manual_index::pipeline::render::PdfiumRasterizer;
use manual_index::{
    ArtifactStore, CancellationFlag, Classification, IngestConfig, IngestError,
    IngestProgressCallback, ManualIngestor, ManualLibrary, ManualMetadata, ManualStore,
    ProgressCallback, SectionRef,
};
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn red(s: &str) -> String {
    format!("\x1b[31m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const TICKS: &[&str] = &["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"];

// ── CLI progress callback using indicatif ────────────────────────────────────

/// Live progress bar plus one log line per page.
struct CliProgressCallback {
    bar: ProgressBar,
    errors: AtomicU32,
}

impl CliProgressCallback {
    fn new_dynamic() -> Arc<Self> {
        let bar = ProgressBar::new(0);
        let spinner_style = ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(TICKS);
        bar.set_style(spinner_style);
        bar.set_prefix("Preparing");
        bar.set_message("Opening PDF…");
        bar.enable_steady_tick(Duration::from_millis(80));

        Arc::new(Self {
            bar,
            errors: AtomicU32::new(0),
        })
    }

    fn activate_bar(&self, total: u32) {
        let progress_style = ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {pos:>3}/{len} pages  \
             ⏱ {elapsed_precise}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS);

        self.bar.set_length(u64::from(total));
        self.bar.set_style(progress_style);
        self.bar.set_prefix("Indexing");
        self.bar.reset_eta();
    }
}

impl IngestProgressCallback for CliProgressCallback {
    fn on_ingest_start(&self, manual_id: i64, total_pages: u32) {
        self.activate_bar(total_pages);
        self.bar.println(format!(
            "{} {}",
            cyan("◆"),
            bold(&format!("Manual {manual_id}: indexing {total_pages} pages…"))
        ));
    }

    fn on_page_complete(&self, page: u32, total: u32, sections: usize, images: usize) {
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            green("✓"),
            page,
            total,
            dim(&format!("{sections} sections, {images} images")),
        ));
        self.bar.inc(1);
    }

    fn on_page_error(&self, page: u32, total: u32, error: String) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let msg: String = if error.chars().count() > 80 {
            error.chars().take(79).chain(std::iter::once('…')).collect()
        } else {
            error
        };
        self.bar.println(format!(
            "  {} Page {:>3}/{:<3}  {}",
            red("✗"),
            page,
            total,
            red(&msg),
        ));
        self.bar.inc(1);
    }

    fn on_ingest_complete(&self, manual_id: i64, total_pages: u32, success_count: u32) {
        let failed = total_pages.saturating_sub(success_count);
        self.bar.finish_and_clear();
        if failed == 0 {
            eprintln!(
                "{} manual {} indexed: {} pages",
                green("✔"),
                bold(&manual_id.to_string()),
                bold(&success_count.to_string())
            );
        } else {
            eprintln!(
                "{} manual {} indexed: {}/{} pages  ({} skipped)",
                cyan("⚠"),
                bold(&manual_id.to_string()),
                bold(&success_count.to_string()),
                total_pages,
                red(&failed.to_string()),
            );
        }
    }
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Index a police-package manual
  manual-index ingest explorer.pdf --make Ford --model Explorer --year 2020 --classification police

  # Index straight from a URL with four pages in flight
  manual-index ingest https://example.com/tahoe.pdf --make Chevrolet --model Tahoe \
      --year 2021 --classification civil --concurrency 4

  # Browse what was indexed
  manual-index manuals
  manual-index sections 1 --tree
  manual-index section RAG_1_12
  manual-index search "brake" --manual 1

  # Export artifacts
  manual-index page 1 12 -o page12.png
  manual-index crop 57 -o wiring.png

ENVIRONMENT VARIABLES:
  OPENAI_API_KEY             OpenAI API key
  ANTHROPIC_API_KEY          Anthropic API key
  GEMINI_API_KEY             Google Gemini API key
  EDGEQUAKE_LLM_PROVIDER     Override provider (openai, anthropic, gemini, ollama)
  EDGEQUAKE_MODEL            Override vision model ID
  MANUAL_INDEX_STORAGE_DIR   Artifact directory (default: ./manual_storage)
  MANUAL_INDEX_DATABASE      SQLite path (default: <storage dir>/manuals.db)
  PDFIUM_LIB_PATH            Path to an existing libpdfium; skips auto-download
"#;

/// Index vehicle service manuals into sections and image regions.
#[derive(Parser, Debug)]
#[command(
    name = "manual-index",
    version,
    about = "Index vehicle service-manual PDFs into sections and image regions using Vision LLMs",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(flatten)]
    storage: StorageArgs,

    /// Print JSON instead of human-readable output.
    #[arg(long, global = true, env = "MANUAL_INDEX_JSON")]
    json: bool,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "MANUAL_INDEX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "MANUAL_INDEX_QUIET")]
    quiet: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Debug)]
struct StorageArgs {
    /// Directory holding PDFs, page rasters and crops.
    #[arg(long, global = true, env = "MANUAL_INDEX_STORAGE_DIR", default_value = "manual_storage")]
    storage_dir: PathBuf,

    /// SQLite database path.
    #[arg(long, global = true, env = "MANUAL_INDEX_DATABASE")]
    database: Option<PathBuf>,

    /// Rendering DPI (72–400), also used when re-rendering pages.
    #[arg(long, global = true, env = "MANUAL_INDEX_DPI", default_value_t = 200,
          value_parser = clap::value_parser!(u32).range(72..=400))]
    dpi: u32,
}

impl StorageArgs {
    fn database_path(&self) -> PathBuf {
        self.database
            .clone()
            .unwrap_or_else(|| self.storage_dir.join("manuals.db"))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest a manual PDF (local path or URL).
    Ingest(IngestArgs),
    /// List ingested manuals.
    Manuals,
    /// Show one manual with section and image counts.
    Show { manual_id: i64 },
    /// List a manual's sections in reading order.
    Sections {
        manual_id: i64,
        /// Indent sections by their derived hierarchy.
        #[arg(long)]
        tree: bool,
    },
    /// Show a section and its images by reference (RAG_<manual>_<page>[_<n>]).
    Section { reference: String },
    /// Case-insensitive search in section names.
    Search {
        needle: String,
        /// Restrict to one manual.
        #[arg(long)]
        manual: Option<i64>,
    },
    /// Write a page raster as PNG.
    Page {
        manual_id: i64,
        page: u32,
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Write an image crop as PNG.
    Crop {
        image_id: i64,
        #[arg(short, long)]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct IngestArgs {
    /// Local PDF file path or HTTP/HTTPS URL.
    input: String,

    /// Vehicle make, e.g. Ford.
    #[arg(long)]
    make: String,

    /// Vehicle model, e.g. Explorer.
    #[arg(long)]
    model: String,

    /// Model year.
    #[arg(long)]
    year: i32,

    /// police or civil.
    #[arg(long)]
    classification: Classification,

    /// Vision LLM model ID.
    #[arg(long, env = "EDGEQUAKE_MODEL")]
    vlm_model: Option<String>,

    /// LLM provider: openai, anthropic, gemini, ollama, azure.
    #[arg(long, env = "EDGEQUAKE_PROVIDER")]
    provider: Option<String>,

    /// Pages whose render + analysis may run at the same time.
    #[arg(short, long, env = "MANUAL_INDEX_CONCURRENCY", default_value_t = 1)]
    concurrency: usize,

    /// Analyzer calls per page before it is skipped.
    #[arg(long, env = "MANUAL_INDEX_MAX_ATTEMPTS", default_value_t = 3)]
    max_attempts: u32,

    /// Per-call analyzer timeout in seconds.
    #[arg(long, env = "MANUAL_INDEX_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Path to a text file containing a custom system prompt.
    #[arg(long, env = "MANUAL_INDEX_SYSTEM_PROMPT")]
    system_prompt: Option<PathBuf>,

    /// Do not keep page rasters on disk.
    #[arg(long)]
    no_page_rasters: bool,

    /// Disable progress bar.
    #[arg(long, env = "MANUAL_INDEX_NO_PROGRESS")]
    no_progress: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let show_progress = matches!(&cli.command, Command::Ingest(a) if !a.no_progress)
        && !cli.quiet
        && !cli.json;
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet || show_progress {
        "error"
    } else {
        "info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match &cli.command {
        Command::Ingest(args) => {
            ensure_pdfium(cli.quiet)?;
            run_ingest(&cli, args, show_progress).await
        }
        Command::Manuals => {
            let library = open_library(&cli.storage)?;
            let manuals = library.list_manuals()?;
            if cli.json {
                return print_json(&manuals);
            }
            for m in manuals {
                println!("{:>4}  {} {} {}  ({})", m.id, m.year, m.make, m.model, m.classification);
            }
            Ok(())
        }
        Command::Show { manual_id } => {
            let library = open_library(&cli.storage)?;
            let Some(manual) = library.get_manual(*manual_id)? else {
                bail!("manual {manual_id} not found");
            };
            let sections = library.list_sections(*manual_id)?;
            let images = library.list_images(*manual_id)?.len();
            if cli.json {
                #[derive(Serialize)]
                struct Summary<'a> {
                    #[serde(flatten)]
                    manual: &'a manual_index::ManualInfo,
                    sections: usize,
                    images: usize,
                }
                return print_json(&Summary {
                    manual: &manual,
                    sections: sections.len(),
                    images,
                });
            }
            println!("Manual:         {}", manual.id);
            println!("Vehicle:        {} {} {}", manual.year, manual.make, manual.model);
            println!("Classification: {}", manual.classification);
            println!("Sections:       {}", sections.len());
            println!("Images:         {}", images);
            Ok(())
        }
        Command::Sections { manual_id, tree } => {
            let library = open_library(&cli.storage)?;
            if *tree {
                let tree = library.section_tree(*manual_id)?;
                if cli.json {
                    return print_json(&tree);
                }
                for (depth, s) in tree.walk() {
                    println!("{}{}  {}", "  ".repeat(depth), dim(&s.section_ref().to_string()), s.name);
                }
            } else {
                let sections = library.list_sections(*manual_id)?;
                if cli.json {
                    return print_json(&sections);
                }
                for s in sections {
                    println!("{:<14} L{}  {}", s.section_ref().to_string(), s.level, s.name);
                }
            }
            Ok(())
        }
        Command::Section { reference } => {
            ensure_pdfium(cli.quiet)?;
            let library = open_library(&cli.storage)?;
            let reference: SectionRef = reference.parse()?;
            let Some(content) = library.section_content(&reference).await? else {
                bail!("section {reference} not found");
            };
            if cli.json {
                return print_json(&content);
            }
            println!("{}  {}", bold(&content.reference), content.section.name);
            println!(
                "Pages {}–{}, level {}",
                content.section.start_page, content.section.end_page, content.section.level
            );
            for entry in &content.images {
                println!(
                    "  image {:>5}  page {:>3}  {}  {}",
                    entry.image.id,
                    entry.image.page,
                    if entry.has_crop { green("crop") } else { dim("no crop") },
                    entry.image.description
                );
            }
            match &content.full_text {
                Some(text) => println!("\n{text}"),
                None => println!("{}", dim("(source PDF missing; no page text)")),
            }
            Ok(())
        }
        Command::Search { needle, manual } => {
            let library = open_library(&cli.storage)?;
            let hits = library.search_sections(*manual, needle)?;
            if cli.json {
                return print_json(&hits);
            }
            for s in hits {
                println!("{:<14} {}", s.section_ref().to_string(), s.name);
            }
            Ok(())
        }
        Command::Page {
            manual_id,
            page,
            output,
        } => {
            ensure_pdfium(cli.quiet)?;
            let library = open_library(&cli.storage)?;
            let Some(png) = library.get_page_raster(*manual_id, *page).await? else {
                bail!("page {page} of manual {manual_id} not found");
            };
            write_output(output, &png).await
        }
        Command::Crop { image_id, output } => {
            let library = open_library(&cli.storage)?;
            let Some(png) = library.get_image_crop(*image_id).await? else {
                bail!("no crop for image {image_id}");
            };
            write_output(output, &png).await
        }
    }
}

async fn run_ingest(cli: &Cli, args: &IngestArgs, show_progress: bool) -> Result<()> {
    let metadata = ManualMetadata::new(&args.make, &args.model, args.year, args.classification);

    let progress_cb: Option<ProgressCallback> = if show_progress {
        let cb = CliProgressCallback::new_dynamic();
        Some(cb as Arc<dyn IngestProgressCallback>)
    } else {
        None
    };
    let config = build_config(cli, args, progress_cb).await?;
    let ingestor = ManualIngestor::from_config(config).context("Failed to set up ingestion")?;

    let bytes = manual_index::pipeline::input::load_pdf_bytes(&args.input, 120)
        .await
        .with_context(|| format!("Failed to load '{}'", args.input))?;

    let cancel = CancellationFlag::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    let output = match ingestor.ingest_with_cancel(&bytes, &metadata, &cancel).await {
        Ok(output) => output,
        Err(IngestError::Cancelled {
            manual_id,
            pages_done,
        }) => {
            eprintln!(
                "{} cancelled: manual {} keeps its first {} pages",
                cyan("⚠"),
                manual_id,
                pages_done
            );
            return Ok(());
        }
        Err(e) => return Err(e).context("Ingestion failed"),
    };

    if cli.json {
        return print_json(&output);
    }
    if !cli.quiet {
        let s = &output.stats;
        eprintln!(
            "{}  manual {}  {}/{} pages  {} sections  {} images ({} crops)  {}ms",
            if s.failed_pages == 0 { green("✔") } else { cyan("⚠") },
            bold(&output.manual_id.to_string()),
            s.indexed_pages,
            s.total_pages,
            s.sections,
            s.images,
            s.crops_written,
            s.total_duration_ms,
        );
        eprintln!(
            "   {} tokens in  /  {} tokens out",
            dim(&s.total_input_tokens.to_string()),
            dim(&s.total_output_tokens.to_string()),
        );
        for failed in output.failed_pages() {
            if let Some(ref e) = failed.error {
                eprintln!("   {} {}", red("✗"), e);
            }
        }
    }
    println!("{}", output.manual_id);
    Ok(())
}

/// Map CLI args to `IngestConfig`.
async fn build_config(
    cli: &Cli,
    args: &IngestArgs,
    progress: Option<ProgressCallback>,
) -> Result<IngestConfig> {
    let mut builder = IngestConfig::builder()
        .dpi(cli.storage.dpi)
        .concurrency(args.concurrency)
        .max_attempts(args.max_attempts)
        .api_timeout_secs(args.api_timeout)
        .storage_dir(&cli.storage.storage_dir)
        .database_path(cli.storage.database_path())
        .store_page_rasters(!args.no_page_rasters);

    if let Some(ref path) = args.system_prompt {
        let prompt = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read system prompt from {:?}", path))?;
        builder = builder.system_prompt(prompt);
    }
    if let Some(ref model) = args.vlm_model {
        builder = builder.model(model);
    }
    if let Some(ref provider) = args.provider {
        builder = builder.provider_name(provider);
    }
    if let Some(cb) = progress {
        builder = builder.progress_callback(cb);
    }

    builder.build().context("Invalid configuration")
}

/// Read-only access; does not need an LLM provider.
fn open_library(storage: &StorageArgs) -> Result<ManualLibrary> {
    let database = storage.database_path();
    if !database.exists() {
        bail!("no manual database at {}", database.display());
    }
    let store = ManualStore::open(&database)
        .with_context(|| format!("Failed to open {}", database.display()))?;
    Ok(ManualLibrary::new(
        Arc::new(store),
        ArtifactStore::new(&storage.storage_dir),
        Arc::new(PdfiumRasterizer::new(storage.dpi, 2000)),
    ))
}

/// Download pdfium on first use, with a byte-level progress bar.
fn ensure_pdfium(quiet: bool) -> Result<()> {
    if pdfium_auto::is_pdfium_cached() {
        return Ok(());
    }
    if quiet {
        tokio::task::block_in_place(|| pdfium_auto::ensure_pdfium_library(None))
            .context("Failed to download PDFium engine")?;
        return Ok(());
    }

    let dl_bar = ProgressBar::new(0);
    dl_bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} {prefix:.bold}  \
             [{bar:42.green/238}] {bytes}/{total_bytes}  ETA {eta_precise}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▉▊▋▌▍▎▏  ")
        .tick_strings(TICKS),
    );
    dl_bar.set_prefix("PDF engine");
    dl_bar.enable_steady_tick(Duration::from_millis(80));

    let bar = dl_bar.clone();
    tokio::task::block_in_place(|| {
        pdfium_auto::ensure_pdfium_library(Some(&|downloaded, total| {
            if let Some(t) = total {
                if bar.length().unwrap_or(0) != t {
                    bar.set_length(t);
                }
            }
            bar.set_position(downloaded);
        }))
    })
    .context("Failed to download PDFium engine")?;

    dl_bar.finish_with_message("ready ✓");
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("Failed to serialise output")?
    );
    Ok(())
}

async fn write_output(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    eprintln!("{} {}", green("✔"), path.display());
    Ok(())
}
