//! Page analysis: page raster → typed heading/image blocks.
//!
//! Two layers:
//!
//! * [`VisionClient`]: one raw model call: page PNG in, reply text out.
//!   [`LlmVisionClient`] implements it over any `edgequake_llm` provider.
//!   Tests substitute scripted clients.
//! * [`PageAnalyzer`]: owns the retry budget, per-call timeout and the
//!   strict parse step. Every failure (provider error, timeout, reply with
//!   no usable JSON) consumes one attempt; after the last one the page fails
//!   with [`PageError::ExtractionFailed`], which the orchestrator treats as
//!   a skippable page.
//!
//! ## Retry Strategy
//!
//! `max_attempts` calls in total with exponential backoff between them:
//! `retry_backoff_ms * 2^(attempt-1)`, so 2 s → 4 s with the defaults.

use crate::config::IngestConfig;
use crate::error::{ExtractionError, ExtractionErrorKind, IngestError, PageError};
use crate::pipeline::blocks::{parse_page_blocks, PageBlocks};
use crate::pipeline::encode::to_image_data;
use crate::prompts::{page_context, EXTRACTION_SYSTEM_PROMPT};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, warn};

/// Where in the manual the page being analysed sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageContext {
    /// 1-indexed.
    pub page: u32,
    pub total_pages: u32,
}

/// Raw reply from one vision call.
#[derive(Debug, Clone, Default)]
pub struct VisionReply {
    pub content: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Capability: send one page image to a vision model and return its reply.
#[async_trait]
pub trait VisionClient: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        page_png: &[u8],
        ctx: PageContext,
    ) -> Result<VisionReply, ExtractionError>;
}

/// [`VisionClient`] backed by an `edgequake_llm` provider.
pub struct LlmVisionClient {
    provider: Arc<dyn LLMProvider>,
    options: CompletionOptions,
}

impl LlmVisionClient {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &IngestConfig) -> Self {
        Self {
            provider,
            options: CompletionOptions {
                temperature: Some(config.temperature),
                max_tokens: Some(config.max_tokens),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl VisionClient for LlmVisionClient {
    async fn complete(
        &self,
        system_prompt: &str,
        page_png: &[u8],
        ctx: PageContext,
    ) -> Result<VisionReply, ExtractionError> {
        let messages = vec![
            ChatMessage::system(system_prompt),
            ChatMessage::user_with_images(
                page_context(ctx.page, ctx.total_pages),
                vec![to_image_data(page_png)],
            ),
        ];

        let response = self
            .provider
            .chat(&messages, Some(&self.options))
            .await
            .map_err(|e| ExtractionError::new(ExtractionErrorKind::Provider, e.to_string()))?;

        Ok(VisionReply {
            content: response.content,
            input_tokens: response.prompt_tokens as u64,
            output_tokens: response.completion_tokens as u64,
        })
    }
}

/// Blocks extracted from one page plus call accounting.
#[derive(Debug, Clone, Default)]
pub struct PageAnalysis {
    pub blocks: PageBlocks,
    /// Attempts used, 1 when the first call succeeded.
    pub attempts: u32,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub duration_ms: u64,
}

/// Retrying, timeout-bounded, parse-validating page analyzer.
pub struct PageAnalyzer {
    client: Arc<dyn VisionClient>,
    system_prompt: String,
    max_attempts: u32,
    retry_backoff: Duration,
    call_timeout: Duration,
}

impl PageAnalyzer {
    pub fn new(client: Arc<dyn VisionClient>, config: &IngestConfig) -> Self {
        Self {
            client,
            system_prompt: config
                .system_prompt
                .clone()
                .unwrap_or_else(|| EXTRACTION_SYSTEM_PROMPT.to_string()),
            max_attempts: config.max_attempts.max(1),
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            call_timeout: Duration::from_secs(config.api_timeout_secs),
        }
    }

    /// Override the per-call timeout (sub-second values are useful in tests).
    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Analyse one page, retrying until a reply parses or the budget is spent.
    pub async fn analyze(&self, page_png: &[u8], ctx: PageContext) -> Result<PageAnalysis, PageError> {
        let start = Instant::now();
        let mut last_err = ExtractionError::new(ExtractionErrorKind::Provider, "no attempt made");
        let (mut input_tokens, mut output_tokens) = (0u64, 0u64);

        for attempt in 1..=self.max_attempts {
            if attempt > 1 {
                let backoff = backoff_delay(self.retry_backoff, attempt);
                warn!(
                    "Page {}: retry {}/{} after {}ms",
                    ctx.page,
                    attempt - 1,
                    self.max_attempts - 1,
                    backoff.as_millis()
                );
                sleep(backoff).await;
            }

            let call = self.client.complete(&self.system_prompt, page_png, ctx);
            let outcome = match timeout(self.call_timeout, call).await {
                Ok(Ok(reply)) => {
                    input_tokens += reply.input_tokens;
                    output_tokens += reply.output_tokens;
                    parse_page_blocks(&reply.content)
                }
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ExtractionError::new(
                    ExtractionErrorKind::Timeout,
                    format!("no reply within {}ms", self.call_timeout.as_millis()),
                )),
            };

            match outcome {
                Ok(blocks) => {
                    debug!(
                        "Page {}: {} headings, {} images on attempt {}",
                        ctx.page,
                        blocks.headings.len(),
                        blocks.images.len(),
                        attempt
                    );
                    return Ok(PageAnalysis {
                        blocks,
                        attempts: attempt,
                        input_tokens,
                        output_tokens,
                        duration_ms: start.elapsed().as_millis() as u64,
                    });
                }
                Err(e) => {
                    warn!("Page {}: attempt {} failed: {}", ctx.page, attempt, e);
                    last_err = e;
                }
            }
        }

        Err(PageError::ExtractionFailed {
            page: ctx.page,
            attempts: self.max_attempts,
            kind: last_err.kind,
            detail: last_err.detail,
        })
    }
}

/// Delay before `attempt` (2-based): `base * 2^(attempt - 2)`, saturating.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt.saturating_sub(2)).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

// ── Provider resolution ──────────────────────────────────────────────────

fn create_vision_provider(
    provider_name: &str,
    model: &str,
) -> Result<Arc<dyn LLMProvider>, IngestError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        IngestError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

/// Resolve the LLM provider, from most-specific to least-specific:
///
/// 1. pre-built `config.provider`;
/// 2. `config.provider_name` + model;
/// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set;
/// 4. OpenAI when `OPENAI_API_KEY` is present;
/// 5. `ProviderFactory::from_env` auto-detection.
pub fn resolve_provider(config: &IngestConfig) -> Result<Arc<dyn LLMProvider>, IngestError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        return create_vision_provider(name, config.model_or_default());
    }

    if let (Ok(prov), Ok(model)) = (
        std::env::var("EDGEQUAKE_LLM_PROVIDER"),
        std::env::var("EDGEQUAKE_MODEL"),
    ) {
        if !prov.is_empty() && !model.is_empty() {
            return create_vision_provider(&prov, &model);
        }
    }

    if let Ok(openai_key) = std::env::var("OPENAI_API_KEY") {
        if !openai_key.is_empty() {
            return create_vision_provider("openai", config.model_or_default());
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| IngestError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No LLM provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or configure a provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Replays a fixed script of replies, one per call.
    struct ScriptedClient {
        script: Mutex<VecDeque<Result<String, ExtractionError>>>,
        calls: AtomicU32,
    }

    impl ScriptedClient {
        fn new(script: Vec<Result<&str, ExtractionError>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into_iter().map(|r| r.map(String::from)).collect()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl VisionClient for ScriptedClient {
        async fn complete(
            &self,
            _system_prompt: &str,
            _page_png: &[u8],
            _ctx: PageContext,
        ) -> Result<VisionReply, ExtractionError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Ok(content)) => Ok(VisionReply {
                    content,
                    input_tokens: 10,
                    output_tokens: 5,
                }),
                Some(Err(e)) => Err(e),
                None => Err(ExtractionError::new(ExtractionErrorKind::Provider, "script exhausted")),
            }
        }
    }

    struct SlowClient;

    #[async_trait]
    impl VisionClient for SlowClient {
        async fn complete(
            &self,
            _system_prompt: &str,
            _page_png: &[u8],
            _ctx: PageContext,
        ) -> Result<VisionReply, ExtractionError> {
            sleep(Duration::from_secs(5)).await;
            Ok(VisionReply::default())
        }
    }

    fn fast_config() -> IngestConfig {
        IngestConfig::builder().retry_backoff_ms(1).build().unwrap()
    }

    const CTX: PageContext = PageContext {
        page: 4,
        total_pages: 10,
    };

    #[tokio::test]
    async fn first_attempt_success() {
        let client = ScriptedClient::new(vec![Ok(r#"{"headings":[{"description":"Engine"}]}"#)]);
        let analyzer = PageAnalyzer::new(client.clone(), &fast_config());
        let out = analyzer.analyze(b"png", CTX).await.unwrap();
        assert_eq!(out.attempts, 1);
        assert_eq!(out.blocks.headings[0].title, "Engine");
        assert_eq!(out.input_tokens, 10);
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_reply_is_retried() {
        let client = ScriptedClient::new(vec![
            Ok("not json at all"),
            Err(ExtractionError::new(ExtractionErrorKind::Provider, "503")),
            Ok(r#"{"images":[]}"#),
        ]);
        let analyzer = PageAnalyzer::new(client.clone(), &fast_config());
        let out = analyzer.analyze(b"png", CTX).await.unwrap();
        assert_eq!(out.attempts, 3);
        assert!(out.blocks.is_empty());
        assert_eq!(out.input_tokens, 20, "tokens of both answered calls count");
    }

    #[tokio::test]
    async fn exhausted_budget_fails_with_last_kind() {
        let client = ScriptedClient::new(vec![Ok("nope"), Ok("still nope"), Ok("{\"x\":1}")]);
        let analyzer = PageAnalyzer::new(client.clone(), &fast_config());
        let err = analyzer.analyze(b"png", CTX).await.unwrap_err();
        match err {
            PageError::ExtractionFailed {
                page,
                attempts,
                kind,
                ..
            } => {
                assert_eq!(page, 4);
                assert_eq!(attempts, 3);
                assert_eq!(kind, ExtractionErrorKind::SchemaMismatch);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn slow_calls_time_out() {
        let config = IngestConfig::builder()
            .retry_backoff_ms(1)
            .max_attempts(2)
            .build()
            .unwrap();
        let analyzer = PageAnalyzer::new(Arc::new(SlowClient), &config)
            .with_call_timeout(Duration::from_millis(20));
        let err = analyzer.analyze(b"png", CTX).await.unwrap_err();
        assert!(matches!(
            err,
            PageError::ExtractionFailed {
                kind: ExtractionErrorKind::Timeout,
                attempts: 2,
                ..
            }
        ));
    }

    #[test]
    fn backoff_doubles_and_saturates() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 2), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 4), Duration::from_millis(400));
        assert_eq!(backoff_delay(base, 40), base.saturating_mul(u32::MAX));
        assert_eq!(backoff_delay(Duration::MAX, 3), Duration::MAX);
    }

    #[test]
    fn prebuilt_provider_is_not_required_for_custom_prompt() {
        let config = IngestConfig::builder()
            .system_prompt("custom")
            .build()
            .unwrap();
        let analyzer = PageAnalyzer::new(ScriptedClient::new(vec![]), &config);
        assert_eq!(analyzer.system_prompt, "custom");
        assert_eq!(analyzer.max_attempts, 3);
        assert_eq!(analyzer.retry_backoff, Duration::from_secs(2));
    }
}
