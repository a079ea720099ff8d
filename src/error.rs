//! Error types for the medingest pipeline.
//!
//! Failures are sorted by who is expected to act on them:
//!
//! * [`PipelineError`]: the work item could not be finished and the
//!   surrounding queue should decide what happens next. Infrastructure
//!   outages and exhausted throttling retries land here, and the worker
//!   nacks the delivery so the queue redelivers it later.
//!
//! * [`PageError`]: a deterministic, terminal failure for one page (render
//!   glitch, payload that cannot be squeezed under the ceiling, a request the
//!   inference API rejected). Stored on the page record with status `ERROR`;
//!   retrying would only reproduce it, so the work item is acknowledged.
//!
//! * [`InferenceError`]: the classification of a single inference call.
//!   Only [`InferenceError::Throttled`] is retried locally.
//!
//! The backend errors ([`ObjectStoreError`], [`QueueError`], [`StoreError`])
//! convert into [`PipelineError`] with `?`.

use crate::model::DocumentId;
use crate::work::Stage;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned from stage entry points.
///
/// Page-level terminal failures use [`PageError`] and are recorded on the
/// page instead of being returned here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Infrastructure ────────────────────────────────────────────────────
    /// Object storage put/get/copy failed.
    #[error("Object storage error: {0}")]
    ObjectStore(#[from] ObjectStoreError),

    /// Publishing to or acknowledging on a work queue failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The record store rejected or could not serve a request.
    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    /// The inference API could not be reached or answered with a server fault.
    #[error("Inference API unavailable for page {ordinal} of {document_id}: {detail}")]
    InferenceUnavailable {
        document_id: DocumentId,
        ordinal: u32,
        detail: String,
    },

    // ── Escalation ────────────────────────────────────────────────────────
    /// Local backoff gave up on a throttled inference call. The queue's own
    /// redelivery is expected to try again at a slower cadence.
    #[error("Inference throttled {attempts} times for page {ordinal} of {document_id}: {detail}")]
    ThrottlingExhausted {
        document_id: DocumentId,
        ordinal: u32,
        attempts: u32,
        detail: String,
    },

    // ── Input errors ──────────────────────────────────────────────────────
    /// A queue message body could not be decoded into a work item.
    #[error("Malformed {stage} work item: {detail}")]
    MalformedWorkItem { stage: Stage, detail: String },

    /// The upload trigger referenced a local file that could not be read.
    #[error("Failed to read upload '{path}': {source}")]
    UploadReadFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Downloading an upload from a URL failed.
    #[error("Failed to download '{url}': {reason}")]
    DownloadFailed { url: String, reason: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configured LLM provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error (e.g. a blocking task panicked).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Whether the delivery that produced this error should be handed back
    /// to the queue for redelivery.
    ///
    /// Malformed messages and configuration problems fail identically on
    /// every delivery, so they are dropped instead.
    pub fn is_redeliverable(&self) -> bool {
        !matches!(
            self,
            PipelineError::MalformedWorkItem { .. }
                | PipelineError::InvalidConfig(_)
                | PipelineError::ProviderNotConfigured { .. }
        )
    }
}

/// A terminal failure for a single page, stored on the page record.
#[derive(Debug, Clone, PartialEq, Eq, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// Rasterisation of the page failed.
    #[error("Page {page}: rasterisation failed: {detail}")]
    RenderFailed { page: u32, detail: String },

    /// The lossy rendition stayed above the ceiling after every quality step
    /// and the downscaled attempt.
    #[error("Page {page}: payload {bytes} bytes exceeds ceiling {ceiling} bytes after compression")]
    PayloadTooLarge {
        page: u32,
        bytes: usize,
        ceiling: usize,
    },

    /// A stored rendition could not be decoded or re-encoded.
    #[error("Page {page}: image encoding failed: {detail}")]
    EncodeFailed { page: u32, detail: String },

    /// The inference API rejected the request (validation, malformed input).
    #[error("Page {page}: inference request rejected: {detail}")]
    InferenceRejected { page: u32, detail: String },
}

/// Outcome classification of one inference call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InferenceError {
    /// Rate limit / throttling signal. Retried with backoff.
    #[error("throttled: {detail}")]
    Throttled {
        detail: String,
        retry_after_ms: Option<u64>,
    },

    /// Deterministic client-side rejection. Never retried.
    #[error("rejected: {0}")]
    Rejected(String),

    /// Network failure, timeout or server fault.
    #[error("unavailable: {0}")]
    Unavailable(String),
}

impl InferenceError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, InferenceError::Throttled { .. })
    }
}

/// Errors from an [`crate::backend::ObjectStore`].
#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("object not found: {bucket}/{key}")]
    NotFound { bucket: String, key: String },

    #[error("I/O error on {bucket}/{key}: {source}")]
    Io {
        bucket: String,
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("object storage unavailable: {0}")]
    Unavailable(String),
}

/// Errors from a [`crate::backend::WorkQueue`].
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue unavailable: {0}")]
    Unavailable(String),

    /// Ack/nack for a receipt that is not in flight (already acked or expired).
    #[error("unknown receipt handle: {0}")]
    UnknownReceipt(String),

    #[error("failed to encode work item: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Errors from a [`crate::backend::RecordStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{entity} '{id}' not found")]
    NotFound { entity: &'static str, id: String },

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}
