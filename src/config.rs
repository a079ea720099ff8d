//! Configuration for the ingestion pipeline.
//!
//! All stage behaviour is controlled through [`PipelineConfig`], built via
//! [`PipelineConfigBuilder`]. Every worker process builds one config at
//! start-up and passes it by reference into each stage entry point alongside
//! the [`crate::backend::Backends`].

use crate::error::PipelineError;
use crate::model::{DocumentId, EncodingKind, ObjectLocation};
use crate::pipeline::encode::CompressionPolicy;
use crate::pipeline::retry::RetryPolicy;
use crate::progress::PipelineObserver;
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Configuration shared by intake, conversion and extraction workers.
///
/// # Example
/// ```rust
/// use medingest::PipelineConfig;
///
/// let config = PipelineConfig::builder()
///     .dpi(144)
///     .max_attempts(5)
///     .model("gpt-4.1-mini")
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct PipelineConfig {
    /// Rendering DPI. Range: 72–400. Default: 144.
    ///
    /// Chosen for inference fidelity rather than display: small print on lab
    /// reports stays legible to the model at this density.
    pub dpi: u32,

    /// Cap on the longest rendered edge in pixels. Default: 3000.
    pub max_rendered_pixels: u32,

    /// Lossy-rendition size control used at conversion time.
    pub compression: CompressionPolicy,

    /// Payload ceiling enforced again right before the inference call.
    /// Default: 4.5 MiB.
    ///
    /// May differ from `compression.ceiling_bytes` when the provider limit
    /// changed after a page was converted.
    pub inference_payload_ceiling: usize,

    /// Local retry schedule for throttled inference calls.
    pub retry: RetryPolicy,

    /// Delay the queue waits before redelivering a nacked item. Default: 60 s.
    pub redelivery_delay_ms: u64,

    /// Bytes per page assumed when the page count cannot be parsed.
    /// Default: 100 KiB.
    pub fallback_bytes_per_page: usize,

    /// Storage buckets.
    pub storage: StorageLayout,

    /// LLM model identifier, e.g. "gpt-4.1-mini", "claude-sonnet-4-20250514".
    pub model: Option<String>,

    /// LLM provider name (e.g. "openai", "anthropic").
    /// If None along with `provider`, uses `ProviderFactory::from_env()`.
    pub provider_name: Option<String>,

    /// Pre-constructed LLM provider. Takes precedence over `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Sampling temperature. Default: 0.0.
    pub temperature: f32,

    /// Maximum tokens per response. Default: 4096.
    pub max_tokens: usize,

    /// Per-inference-call timeout in seconds. Default: 120.
    pub api_timeout_secs: u64,

    /// Custom system preamble. If None, uses [`crate::prompts::SYSTEM_PREAMBLE`].
    pub system_preamble: Option<String>,

    /// Work items processed at once by [`crate::worker::drain`]. Default: 10.
    pub concurrency: usize,

    /// Receives page-level progress events.
    pub observer: Option<Arc<dyn PipelineObserver>>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dpi: 144,
            max_rendered_pixels: 3000,
            compression: CompressionPolicy::default(),
            inference_payload_ceiling: CompressionPolicy::DEFAULT_CEILING_BYTES,
            retry: RetryPolicy::default(),
            redelivery_delay_ms: 60_000,
            fallback_bytes_per_page: 100 * 1024,
            storage: StorageLayout::default(),
            model: None,
            provider_name: None,
            provider: None,
            temperature: 0.0,
            max_tokens: 4096,
            api_timeout_secs: 120,
            system_preamble: None,
            concurrency: 10,
            observer: None,
        }
    }
}

impl fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("dpi", &self.dpi)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("compression", &self.compression)
            .field("inference_payload_ceiling", &self.inference_payload_ceiling)
            .field("retry", &self.retry)
            .field("redelivery_delay_ms", &self.redelivery_delay_ms)
            .field("storage", &self.storage)
            .field("model", &self.model)
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("temperature", &self.temperature)
            .field("max_tokens", &self.max_tokens)
            .field("concurrency", &self.concurrency)
            .field("observer", &self.observer.as_ref().map(|_| "<dyn PipelineObserver>"))
            .finish()
    }
}

impl PipelineConfig {
    /// Create a new builder for `PipelineConfig`.
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder {
            config: Self::default(),
        }
    }

    pub fn redelivery_delay(&self) -> Duration {
        Duration::from_millis(self.redelivery_delay_ms)
    }

    pub fn preamble(&self) -> &str {
        self.system_preamble
            .as_deref()
            .unwrap_or(crate::prompts::SYSTEM_PREAMBLE)
    }
}

/// Buckets used for canonical uploads and page renditions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageLayout {
    pub documents_bucket: String,
    pub renditions_bucket: String,
}

impl StorageLayout {
    /// Canonical long-term copy of an upload: `documents/{doc}/{filename}`.
    pub fn document_location(&self, document_id: DocumentId, filename: &str) -> ObjectLocation {
        ObjectLocation::new(
            self.documents_bucket.as_str(),
            format!("documents/{document_id}/{filename}"),
        )
    }

    /// `renditions/{doc}/page_{NNNN}.{png|jpg}`. Deterministic, so a retried
    /// conversion overwrites its own earlier output.
    pub fn rendition_location(&self, document_id: DocumentId, ordinal: u32, kind: EncodingKind) -> ObjectLocation {
        ObjectLocation::new(
            self.renditions_bucket.as_str(),
            format!("renditions/{document_id}/page_{ordinal:04}.{}", kind.extension()),
        )
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        Self {
            documents_bucket: "documents".to_string(),
            renditions_bucket: "renditions".to_string(),
        }
    }
}

/// Builder for [`PipelineConfig`].
#[derive(Debug)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn dpi(mut self, dpi: u32) -> Self {
        self.config.dpi = dpi.clamp(72, 400);
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn compression(mut self, policy: CompressionPolicy) -> Self {
        self.config.compression = policy;
        self
    }

    pub fn payload_ceiling(mut self, bytes: usize) -> Self {
        self.config.compression.ceiling_bytes = bytes;
        self.config.inference_payload_ceiling = bytes;
        self
    }

    pub fn inference_payload_ceiling(mut self, bytes: usize) -> Self {
        self.config.inference_payload_ceiling = bytes;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.config.retry = policy;
        self
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.config.retry.max_attempts = n.max(1);
        self
    }

    pub fn backoff(mut self, base_ms: u64, max_ms: u64) -> Self {
        self.config.retry.base_delay_ms = base_ms;
        self.config.retry.max_delay_ms = max_ms;
        self
    }

    pub fn redelivery_delay_ms(mut self, ms: u64) -> Self {
        self.config.redelivery_delay_ms = ms;
        self
    }

    pub fn fallback_bytes_per_page(mut self, bytes: usize) -> Self {
        self.config.fallback_bytes_per_page = bytes.max(1);
        self
    }

    pub fn storage(mut self, layout: StorageLayout) -> Self {
        self.config.storage = layout;
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

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api_timeout_secs = secs;
        self
    }

    pub fn system_preamble(mut self, preamble: impl Into<String>) -> Self {
        self.config.system_preamble = Some(preamble.into());
        self
    }

    pub fn concurrency(mut self, n: usize) -> Self {
        self.config.concurrency = n.max(1);
        self
    }

    pub fn observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.config.observer = Some(observer);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<PipelineConfig, PipelineError> {
        let c = &self.config;
        if c.dpi < 72 || c.dpi > 400 {
            return Err(PipelineError::InvalidConfig(format!(
                "DPI must be 72–400, got {}",
                c.dpi
            )));
        }
        if c.concurrency == 0 {
            return Err(PipelineError::InvalidConfig(
                "Concurrency must be ≥ 1".into(),
            ));
        }
        c.compression.validate()?;
        c.retry.validate()?;
        if c.inference_payload_ceiling == 0 {
            return Err(PipelineError::InvalidConfig(
                "Inference payload ceiling must be > 0".into(),
            ));
        }
        if c.storage.documents_bucket.is_empty() || c.storage.renditions_bucket.is_empty() {
            return Err(PipelineError::InvalidConfig(
                "Storage bucket names must not be empty".into(),
            ));
        }
        Ok(self.config)
    }
}
