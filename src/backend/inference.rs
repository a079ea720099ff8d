//! Vision-model inference: one page image + one instruction in, text out.
//!
//! [`InferenceClient`] is the seam the extraction stage calls through.
//! [`LlmInference`] implements it over any `edgequake_llm` provider and sorts
//! provider failures into the three classes the stage cares about:
//!
//! | class | examples | handling |
//! |-------|----------|----------|
//! | `Throttled`   | HTTP 429, "rate limit", "overloaded" | local backoff, then queue redelivery |
//! | `Rejected`    | HTTP 400/401/403/413, validation     | page marked `ERROR` |
//! | `Unavailable` | network, 5xx, timeout                | propagated as infrastructure failure |
//!
//! ## Message layout
//!
//! 1. **System message**: the invariant preamble. Identical bytes on every
//!    call so providers with prompt caching serve it from cache.
//! 2. **User message**: the page JPEG as a base64 attachment plus the page
//!    instruction.

use crate::config::PipelineConfig;
use crate::error::{InferenceError, PipelineError};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use edgequake_llm::{ChatMessage, CompletionOptions, ImageData, LLMProvider, ProviderFactory};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A base64-encoded image attachment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImagePayload {
    pub base64: String,
    pub mime_type: String,
}

impl ImagePayload {
    pub fn new(bytes: &[u8], mime_type: impl Into<String>) -> Self {
        Self {
            base64: STANDARD.encode(bytes),
            mime_type: mime_type.into(),
        }
    }

    /// Size of the encoded attachment as sent on the wire.
    pub fn encoded_len(&self) -> usize {
        self.base64.len()
    }
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    /// Cacheable system preamble.
    pub preamble: Arc<str>,
    pub instruction: String,
    pub image: ImagePayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceReply {
    pub text: String,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceReply, InferenceError>;
}

/// [`InferenceClient`] over an `edgequake_llm` provider.
pub struct LlmInference {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    max_tokens: usize,
    timeout: Duration,
}

impl std::fmt::Debug for LlmInference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LlmInference")
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LlmInference {
    pub fn new(provider: Arc<dyn LLMProvider>, config: &PipelineConfig) -> Self {
        Self {
            provider,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.api_timeout_secs.max(1)),
        }
    }

    /// Resolve the provider from the config, from most to least specific:
    ///
    /// 1. a pre-built `config.provider`;
    /// 2. `config.provider_name` + `config.model`;
    /// 3. `EDGEQUAKE_LLM_PROVIDER` + `EDGEQUAKE_MODEL` when both are set;
    /// 4. OpenAI when `OPENAI_API_KEY` is set;
    /// 5. `ProviderFactory::from_env()` auto-detection.
    pub fn from_config(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let provider = resolve_provider(config)?;
        Ok(Self::new(provider, config))
    }

    fn options(&self) -> CompletionOptions {
        CompletionOptions {
            temperature: Some(self.temperature),
            max_tokens: Some(self.max_tokens),
            ..Default::default()
        }
    }
}

#[async_trait]
impl InferenceClient for LlmInference {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceReply, InferenceError> {
        let start = Instant::now();
        let image = ImageData::new(request.image.base64.clone(), request.image.mime_type.as_str())
            .with_detail("high");
        let messages = vec![
            ChatMessage::system(request.preamble.as_ref()),
            ChatMessage::user_with_images(&request.instruction, vec![image]),
        ];
        let options = self.options();

        let response = tokio::time::timeout(self.timeout, self.provider.chat(&messages, Some(&options)))
            .await
            .map_err(|_| {
                InferenceError::Unavailable(format!("timed out after {}s", self.timeout.as_secs()))
            })?
            .map_err(|e| classify_error(&e.to_string()))?;

        debug!(
            "inference: {} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        Ok(InferenceReply {
            text: response.content,
            input_tokens: response.prompt_tokens as usize,
            output_tokens: response.completion_tokens as usize,
        })
    }
}

static RETRY_AFTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)retry[- _]after\D{0,5}(\d+(?:\.\d+)?)\s*(ms|s)?").unwrap());

static STATUS_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b([45]\d\d)\b").unwrap());

static THROTTLE_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"rate[ _-]?limit|throttl|too many requests|overloaded|quota exceeded|exceeded your (current )?quota|insufficient_quota")
        .unwrap()
});

static TRANSIENT_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"timed out|timeout|connection (reset|refused|closed|aborted)|broken pipe|service unavailable|bad gateway|gateway timeout|internal server error|temporarily unavailable|upstream")
        .unwrap()
});

static REJECT_PHRASE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"bad request|validation failed|payload too large|request entity too large|invalid_request_error|unauthorized|forbidden|unsupported (image|media|content)")
        .unwrap()
});

/// Sort a provider error message into an [`InferenceError`] class.
///
/// Providers surface HTTP status and rate-limit signals only in the error
/// text, so this works on the rendered message. Status codes only count as
/// standalone numbers. Outage signals win over rejection wording, since a
/// transient fault must go back to the queue instead of failing the page.
pub fn classify_error(detail: &str) -> InferenceError {
    let lower = detail.to_lowercase();
    let detail = detail.to_string();

    let statuses: Vec<u16> = STATUS_CODE
        .captures_iter(&lower)
        .filter_map(|caps| caps.get(1)?.as_str().parse().ok())
        .collect();

    if statuses.contains(&429) || THROTTLE_PHRASE.is_match(&lower) {
        return InferenceError::Throttled {
            retry_after_ms: retry_after_ms(&lower),
            detail,
        };
    }

    if statuses.iter().any(|s| *s >= 500 || *s == 408) || TRANSIENT_PHRASE.is_match(&lower) {
        return InferenceError::Unavailable(detail);
    }

    if statuses.iter().any(|s| (400..500).contains(s)) || REJECT_PHRASE.is_match(&lower) {
        return InferenceError::Rejected(detail);
    }

    InferenceError::Unavailable(detail)
}

fn retry_after_ms(lower: &str) -> Option<u64> {
    let caps = RETRY_AFTER.captures(lower)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let ms = match caps.get(2).map(|m| m.as_str()) {
        Some("ms") => value,
        _ => value * 1000.0,
    };
    Some(ms.round() as u64)
}

fn create_vision_provider(provider_name: &str, model: &str) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    ProviderFactory::create_llm_provider(provider_name, model).map_err(|e| {
        PipelineError::ProviderNotConfigured {
            provider: provider_name.to_string(),
            hint: format!("{e}"),
        }
    })
}

const DEFAULT_MODEL: &str = "gpt-4.1-mini";

fn resolve_provider(config: &PipelineConfig) -> Result<Arc<dyn LLMProvider>, PipelineError> {
    if let Some(ref provider) = config.provider {
        return Ok(Arc::clone(provider));
    }

    if let Some(ref name) = config.provider_name {
        let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
        return create_vision_provider(name, model);
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
            let model = config.model.as_deref().unwrap_or(DEFAULT_MODEL);
            return create_vision_provider("openai", model);
        }
    }

    let (llm_provider, _embedding) =
        ProviderFactory::from_env().map_err(|e| PipelineError::ProviderNotConfigured {
            provider: "auto".to_string(),
            hint: format!(
                "No vision provider could be auto-detected from environment.\n\
                Set OPENAI_API_KEY, ANTHROPIC_API_KEY, or pass --provider.\n\
                Error: {}",
                e
            ),
        })?;

    Ok(llm_provider)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limits_are_throttled() {
        for msg in [
            "HTTP 429 Too Many Requests",
            "Rate limit exceeded for model",
            "ThrottlingException: slow down",
            "Anthropic API overloaded",
        ] {
            assert!(classify_error(msg).is_throttled(), "{msg}");
        }
    }

    #[test]
    fn retry_after_hint_is_parsed() {
        match classify_error("429: rate limited, retry after 7s") {
            InferenceError::Throttled { retry_after_ms, .. } => assert_eq!(retry_after_ms, Some(7000)),
            other => panic!("expected throttled, got {other:?}"),
        }
        match classify_error("rate limit; Retry-After: 250ms") {
            InferenceError::Throttled { retry_after_ms, .. } => assert_eq!(retry_after_ms, Some(250)),
            other => panic!("expected throttled, got {other:?}"),
        }
    }

    #[test]
    fn client_errors_are_rejected() {
        assert!(matches!(
            classify_error("400 Bad Request: invalid image payload"),
            InferenceError::Rejected(_)
        ));
        assert!(matches!(
            classify_error("Request validation failed"),
            InferenceError::Rejected(_)
        ));
    }

    #[test]
    fn everything_else_is_unavailable() {
        assert!(matches!(
            classify_error("connection reset by peer"),
            InferenceError::Unavailable(_)
        ));
        assert!(matches!(
            classify_error("502 gateway error"),
            InferenceError::Unavailable(_)
        ));
    }

    #[test]
    fn transient_faults_are_never_rejected() {
        for msg in [
            "timed out after 120400ms",
            "invalid response from upstream (502)",
            "503 Service Unavailable: invalid backend state",
            "request id req_400abc failed: connection refused",
        ] {
            assert!(matches!(classify_error(msg), InferenceError::Unavailable(_)), "{msg}");
        }
    }

    #[test]
    fn embedded_digits_are_not_status_codes() {
        assert!(!classify_error("request 7f429e failed after 4290ms").is_throttled());
        assert!(matches!(
            classify_error("unsupported image format (HTTP 415)"),
            InferenceError::Rejected(_)
        ));
    }

    #[test]
    fn image_payload_is_base64() {
        let payload = ImagePayload::new(b"\xff\xd8\xff", "image/jpeg");
        assert_eq!(payload.base64, "/9j/");
        assert_eq!(payload.encoded_len(), 4);
    }
}
