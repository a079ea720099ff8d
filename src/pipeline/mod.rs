//! The three pipeline stages and the algorithms they share.
//!
//! ## Data Flow
//!
//! ```text
//! upload ──▶ intake ──▶ [conversion queue] ──▶ convert ──▶ [extraction queue] ──▶ extract ──▶ records
//!            (count)                           (render,                          (infer,
//!                                               encode)                           parse)
//! ```
//!
//! Stage entry points:
//! 1. [`intake::ingest`]: register the document, enqueue one item per page
//! 2. [`convert::convert_page`]: render one page to PNG + size-bounded JPEG
//! 3. [`extract::extract_page`]: call the vision model, store subject/tags/facts
//!
//! Shared building blocks:
//! * [`render`]: pdfium rasterisation and the page-count fallback chain
//! * [`encode`]: PNG/JPEG encoding and the compression ladder
//! * [`retry`]: throttling-only exponential backoff with jitter
//! * [`response`]: lenient parsing of the model's JSON
//! * [`input`]: reading uploads from local paths or URLs
//!
//! Every stage is stateless: it takes the [`crate::backend::Backends`] and
//! [`crate::config::PipelineConfig`] by reference and finishes one work item
//! per call.

pub mod convert;
pub mod encode;
pub mod extract;
pub mod input;
pub mod intake;
pub mod render;
pub mod response;
pub mod retry;

use crate::backend::Backends;
use crate::error::PipelineError;
use crate::model::{Counter, DocumentId, DocumentStatus};
use tracing::info;

/// Count a page that reached `PROCESSED` or `ERROR` (or was skipped as past
/// the real page count) and complete the document when every page has.
///
/// The store counts each ordinal once, so redeliveries call this again to
/// finish an earlier attempt that stopped before counting.
pub(crate) async fn record_terminal_page(
    backends: &Backends,
    document_id: DocumentId,
    ordinal: u32,
    total_pages: u32,
) -> Result<u32, PipelineError> {
    let processed = backends
        .records
        .count_page(document_id, ordinal, Counter::PagesProcessed)
        .await?;
    if processed.value >= total_pages {
        let status = backends
            .records
            .advance_status(document_id, DocumentStatus::Complete)
            .await?;
        if processed.newly_counted && processed.value == total_pages {
            info!("Document {} {:?}: {}/{} pages", document_id, status, processed.value, total_pages);
        }
    }
    Ok(processed.value)
}

/// Count a page whose renditions are stored and move the document to
/// `CONVERTING` or `CONVERTED`. Safe to repeat for the same ordinal.
pub(crate) async fn record_converted_page(
    backends: &Backends,
    document_id: DocumentId,
    ordinal: u32,
    total_pages: u32,
) -> Result<u32, PipelineError> {
    let converted = backends
        .records
        .count_page(document_id, ordinal, Counter::PagesConverted)
        .await?;
    let target = if converted.value >= total_pages {
        DocumentStatus::Converted
    } else {
        DocumentStatus::Converting
    };
    backends.records.advance_status(document_id, target).await?;
    Ok(converted.value)
}
