//! Configuration types for manual ingestion.
//!
//! All ingestion behaviour is controlled through [`IngestConfig`], built via
//! its [`IngestConfigBuilder`]. The metadata describing *which* manual is
//! being ingested lives separately in [`ManualMetadata`] because it changes
//! on every call while the config is usually shared for a whole process.

use crate::error::IngestError;
use crate::progress::ProgressCallback;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// Model used when neither the config nor the environment names one.
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

/// Upper bound for [`IngestConfig::max_attempts`].
pub const MAX_ATTEMPTS_LIMIT: u32 = 10;

/// Configuration for an ingestion run.
///
/// # Example
/// ```rust
/// use manual_index::IngestConfig;
///
/// let config = IngestConfig::builder()
///     .dpi(200)
///     .storage_dir("/var/lib/manuals")
///     .model("gpt-4o-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct IngestConfig {
    /// Rendering DPI for page rasters. Range: 72–400. Default: 200.
    pub dpi: u32,

    /// Cap on the longest edge of a rendered page in pixels. Default: 2000.
    ///
    /// Service manuals are occasionally scanned at poster sizes; the cap keeps
    /// raster memory bounded independent of the physical page size.
    pub max_rendered_pixels: u32,

    /// LLM model identifier. If None, uses [`DEFAULT_MODEL`].
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic", "ollama").
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0 (extraction, not generation).
    pub temperature: f32,

    /// Maximum tokens the model may generate per page. Default: 2000.
    pub max_tokens: usize,

    /// Total analyzer attempts per page, first call included. Default: 3.
    pub max_attempts: u32,

    /// Base backoff in milliseconds; doubles after each failed attempt. Default: 2000.
    pub retry_backoff_ms: u64,

    /// Per analyzer call timeout in seconds. Default: 60.
    pub api_timeout_secs: u64,

    /// Custom system prompt. If None, uses the built-in extraction prompt.
    pub system_prompt: Option<String>,

    /// Directory holding `{manual_id}.pdf`, page rasters and crops.
    pub storage_dir: PathBuf,

    /// SQLite database file for the manual store.
    pub database_path: PathBuf,

    /// Persist `{manual_id}_{page}.png` for every rendered page. Default: true.
    pub store_page_rasters: bool,

    /// Pages rasterised and analysed concurrently. Default: 1.
    ///
    /// Results are always written to the store in page order regardless.
    pub concurrency: usize,

    /// Optional per-page progress events.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let storage_dir = PathBuf::from("manual_storage");
        Self {
            dpi: 200,
            max_rendered_pixels: 2000,
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 2000,
            max_attempts: 3,
            retry_backoff_ms: 2000,
            api_timeout_secs: 60,
            system_prompt: None,
            database_path: storage_dir.join("manuals.db"),
            storage_dir,
            store_page_rasters: true,
            concurrency: 1,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for IngestConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IngestConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("max_attempts", &self.max_attempts)
            .field("retry_backoff_ms", &self.retry_backoff_ms)
            .field("api_timeout_secs", &self.api_timeout_secs)
            .field("storage_dir", &self.storage_dir)
            .field("database_path", &self.database_path)
            .field("store_page_rasters", &self.store_page_rasters)
            .field("concurrency", &self.concurrency)
            .finish()
    }
}

impl IngestConfig {
    /// Create a new builder for `IngestConfig`.
    pub fn builder() -> IngestConfigBuilder {
        IngestConfigBuilder {
            config: Self::default(),
        }
    }

    /// Model name to request, falling back to [`DEFAULT_MODEL`].
    pub fn model_or_default(&self) -> &str {
        self.model.as_deref().unwrap_or(DEFAULT_MODEL)
    }
}

/// Builder for [`IngestConfig`].
pub struct IngestConfigBuilder {
    config: IngestConfig,
}

impl fmt::Debug for IngestConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.config.fmt(f)
    }
}

impl IngestConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = Some(model.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = t.clamp(0.0, 2.0);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.max_attempts = n;
        self
    }

    pub fn retry_backoff_ms(mut self, ms: u64) -> Self {
        self.config.retry_backoff_ms = ms;
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    /// Set the artifact directory. The database path follows it unless it
    /// is set explicitly afterwards.
    pub fn storage_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        self.config.database_path = dir.join("manuals.db");
        self.config.storage_dir = dir;
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = path.into();
        self
    }

    pub fn store_page_rasters(mut self, v: bool) -> Self {
        self.config.store_page_rasters = v;
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn progress_callback(mut self, cb: ProgressCallback) -> Self {
        self.config.progress_callback = Some(cb);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<IngestConfig, IngestError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(IngestError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.max_attempts == 0 || c.max_attempts > MAX_ATTEMPTS_LIMIT {
            return Err(IngestError::InvalidConfig(format!(
                "max_attempts must be 1–{}, got {}",
                MAX_ATTEMPTS_LIMIT, c.max_attempts
            )));
        }
        if c.api_timeout_secs == 0 {
            return Err(IngestError::InvalidConfig(
                "api_timeout_secs must be ≥ 1".into(),
            ));
        }
        Ok(self.config)
    }
}

// ── Manual metadata ──────────────────────────────────────────────────────

/// Whether a manual covers a police-package or a civilian vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Police,
    Civil,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Police => "police",
            Classification::Civil => "civil",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Classification {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "police" => Ok(Classification::Police),
            "civil" | "civilian" => Ok(Classification::Civil),
            other => Err(IngestError::InputInvalid(format!(
                "classification must be 'police' or 'civil', got '{other}'"
            ))),
        }
    }
}

/// Descriptive metadata supplied with each ingested manual.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualMetadata {
    pub make: String,
    pub model: String,
    pub year: i32,
    pub classification: Classification,
}

impl ManualMetadata {
    pub fn new(
        make: impl Into<String>,
        model: impl Into<String>,
        year: i32,
        classification: Classification,
    ) -> Self {
        Self {
            make: make.into(),
            model: model.into(),
            year,
            classification,
        }
    }

    /// Reject metadata that must never reach the store.
    pub fn validate(&self) -> Result<(), IngestError> {
        if self.make.trim().is_empty() {
            return Err(IngestError::InputInvalid("make must not be empty".into()));
        }
        if self.model.trim().is_empty() {
            return Err(IngestError::InputInvalid("model must not be empty".into()));
        }
        if !(1886..=2100).contains(&self.year) {
            return Err(IngestError::InputInvalid(format!(
                "year must be 1886–2100, got {}",
                self.year
            )));
        }
        Ok(())
    }
}
