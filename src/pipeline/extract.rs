//! Extraction stage: send one converted page to the vision model and store
//! what comes back.
//!
//! ## Outcomes
//!
//! | model call | page becomes | work item |
//! |------------|--------------|-----------|
//! | answered, parseable       | `PROCESSED`, records stored            | acked |
//! | answered, unparseable     | `PROCESSED`, zero facts, diagnostic    | acked |
//! | rejected (validation)     | `ERROR`                                 | acked |
//! | throttled on every attempt| unchanged                               | escalated, redelivered later |
//! | unavailable               | unchanged                               | propagated, redelivered later |
//!
//! ## Subject resolution
//!
//! The document's subject reference is read once per page into a
//! [`PageContext`] and stamped on every fact. Pages that finish before the
//! first page has attached the subject store [`SubjectRef::Pending`]; the
//! query layer resolves those through the owning document.

use crate::backend::{Backends, ImagePayload, InferenceRequest};
use crate::config::PipelineConfig;
use crate::error::{InferenceError, PageError, PipelineError};
use crate::model::{
    CategoryTag, DocumentId, EncodingKind, Fact, FactFamily, FactId, FactRecord, PageId,
    PageTransition, Subject, SubjectId, SubjectRef, TagId,
};
use crate::pipeline::encode::{self, EncodeError};
use crate::pipeline::record_terminal_page;
use crate::pipeline::response::{self, PageExtraction};
use crate::pipeline::retry::{self, RetryError};
use crate::prompts;
use crate::work::{ExtractionWork, Stage};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What [`extract_page`] did with a work item.
#[derive(Debug, Clone, PartialEq)]
pub enum ExtractionOutcome {
    Processed {
        facts: usize,
        categories: usize,
        /// Inference attempts, including throttled ones.
        attempts: u32,
        subject: SubjectRef,
        diagnostic: Option<String>,
    },
    /// The page was already `PROCESSED` or `ERROR`.
    AlreadyTerminal,
    /// The page was recorded as `ERROR`.
    Failed(PageError),
}

/// Everything the writes for one page need, resolved once.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageContext {
    pub document_id: DocumentId,
    pub page_id: PageId,
    pub subject: SubjectRef,
    pub created_at: DateTime<Utc>,
}

/// Process one [`ExtractionWork`] item.
pub async fn extract_page(
    backends: &Backends,
    config: &PipelineConfig,
    item: &ExtractionWork,
) -> Result<ExtractionOutcome, PipelineError> {
    let page = backends.records.get_page(item.page_id).await?;
    if page.status.is_terminal() {
        debug!(
            "Document {}: page {} already {:?}, skipping",
            item.document_id, item.ordinal, page.status
        );
        // An earlier delivery may have stopped between the transition and the count.
        record_terminal_page(backends, item.document_id, item.ordinal, item.total_pages).await?;
        return Ok(ExtractionOutcome::AlreadyTerminal);
    }

    let image = match payload_for(backends, config, item).await? {
        Ok(image) => image,
        Err(error) => return fail_page(backends, config, item, error).await,
    };

    let request = InferenceRequest {
        preamble: Arc::from(config.preamble()),
        instruction: prompts::page_instruction(item.is_subject_page()),
        image,
    };

    let inference = backends.inference.as_ref();
    let request = &request;
    let observer = config.observer.clone();
    let result = retry::with_backoff(
        &config.retry,
        move |_attempt| inference.infer(request),
        |attempt, delay| {
            if let Some(ref obs) = observer {
                obs.on_throttled(item.document_id, item.ordinal, attempt, delay);
            }
        },
    )
    .await;

    let (reply, attempts) = match result {
        Ok(ok) => ok,
        Err(RetryError::Exhausted { attempts, last }) => {
            return Err(PipelineError::ThrottlingExhausted {
                document_id: item.document_id,
                ordinal: item.ordinal,
                attempts,
                detail: last.to_string(),
            });
        }
        Err(RetryError::Fatal {
            error: InferenceError::Rejected(detail),
            ..
        }) => {
            let error = PageError::InferenceRejected {
                page: item.ordinal,
                detail,
            };
            return fail_page(backends, config, item, error).await;
        }
        Err(RetryError::Fatal { error, .. }) => {
            return Err(PipelineError::InferenceUnavailable {
                document_id: item.document_id,
                ordinal: item.ordinal,
                detail: error.to_string(),
            });
        }
    };
    debug!(
        "Document {}: page {} answered after {} attempt(s), {} input / {} output tokens",
        item.document_id, item.ordinal, attempts, reply.input_tokens, reply.output_tokens
    );

    let extraction = response::parse_response(&reply.text);
    if let Some(ref diagnostic) = extraction.diagnostic {
        warn!(
            "Document {}: page {}: {}",
            item.document_id, item.ordinal, diagnostic
        );
    }

    let context = resolve_context(backends, item, &extraction).await?;
    let facts = store_records(backends, &context, &extraction).await?;

    let transition = PageTransition::Processed {
        categories: extraction.labels(),
        diagnostic: extraction.diagnostic.clone(),
    };
    let transitioned = backends.records.transition_page(item.page_id, transition).await?;
    let processed = record_terminal_page(backends, item.document_id, item.ordinal, item.total_pages).await?;
    if transitioned {
        info!(
            "Document {}: page {}/{} processed, {} facts ({} pages done)",
            item.document_id, item.ordinal, item.total_pages, facts, processed
        );
        if let Some(ref observer) = config.observer {
            observer.on_page_processed(item.document_id, item.ordinal, item.total_pages, facts);
        }
    }

    Ok(ExtractionOutcome::Processed {
        facts,
        categories: extraction.categories.len(),
        attempts,
        subject: context.subject,
        diagnostic: extraction.diagnostic,
    })
}

/// Load the lossy rendition, recompressing it if the ceiling shrank since
/// conversion. The inner `Err` is a terminal page failure.
async fn payload_for(
    backends: &Backends,
    config: &PipelineConfig,
    item: &ExtractionWork,
) -> Result<Result<ImagePayload, PageError>, PipelineError> {
    let stored = backends.objects.get(&item.lossy.location).await?;
    let ceiling = config.inference_payload_ceiling;
    if stored.len() <= ceiling {
        return Ok(Ok(ImagePayload::new(&stored, EncodingKind::Lossy.content_type())));
    }

    warn!(
        "Document {}: page {} rendition is {} bytes, over the {} byte ceiling; recompressing",
        item.document_id,
        item.ordinal,
        stored.len(),
        ceiling
    );
    let policy = config.compression.with_ceiling(ceiling);
    let recompressed = tokio::task::spawn_blocking(move || encode::recompress(&stored, &policy))
        .await
        .map_err(|e| PipelineError::Internal(format!("Recompress task panicked: {}", e)))?;

    Ok(match recompressed {
        Ok(c) => Ok(ImagePayload::new(&c.bytes, EncodingKind::Lossy.content_type())),
        Err(EncodeError::OverCeiling { smallest, ceiling, .. }) => Err(PageError::PayloadTooLarge {
            page: item.ordinal,
            bytes: smallest,
            ceiling,
        }),
        Err(EncodeError::Image(e)) => Err(PageError::EncodeFailed {
            page: item.ordinal,
            detail: e.to_string(),
        }),
    })
}

/// Attach the subject (first page only) and read the document's subject
/// reference once for every write that follows.
async fn resolve_context(
    backends: &Backends,
    item: &ExtractionWork,
    extraction: &PageExtraction,
) -> Result<PageContext, PipelineError> {
    let created_at = Utc::now();
    let attached = match extraction.subject {
        Some(ref attributes) if item.is_subject_page() && attributes.is_populated() => {
            let subject = Subject {
                id: SubjectId::for_document(item.document_id),
                document_id: item.document_id,
                attributes: attributes.clone(),
                created_at,
            };
            let id = backends.records.attach_subject(subject).await?;
            info!("Document {}: subject {} attached", item.document_id, id);
            Some(id)
        }
        Some(_) if item.is_subject_page() => {
            debug!("Document {}: subject attributes too sparse to store", item.document_id);
            None
        }
        _ => None,
    };

    let subject = match attached {
        Some(id) => SubjectRef::Resolved(id),
        None => backends.records.get_document(item.document_id).await?.subject,
    };

    Ok(PageContext {
        document_id: item.document_id,
        page_id: item.page_id,
        subject,
        created_at,
    })
}

/// Write tags and facts with position-derived ids. Returns the fact count.
async fn store_records(
    backends: &Backends,
    ctx: &PageContext,
    extraction: &PageExtraction,
) -> Result<usize, PipelineError> {
    for (i, category) in extraction.categories.iter().enumerate() {
        backends
            .records
            .put_category(CategoryTag {
                id: TagId::for_position(ctx.page_id, i),
                page_id: ctx.page_id,
                label: category.label,
                justification: category.justification.clone(),
            })
            .await?;
    }

    let mut facts: Vec<Fact> = Vec::with_capacity(extraction.fact_count());
    facts.extend(
        extraction
            .medications
            .iter()
            .enumerate()
            .map(|(i, m)| Fact::Medication(envelope(ctx, FactFamily::Medication, i, m.clone()))),
    );
    facts.extend(
        extraction
            .diagnoses
            .iter()
            .enumerate()
            .map(|(i, d)| Fact::Diagnosis(envelope(ctx, FactFamily::Diagnosis, i, d.clone()))),
    );
    facts.extend(
        extraction
            .test_results
            .iter()
            .enumerate()
            .map(|(i, t)| Fact::TestResult(envelope(ctx, FactFamily::TestResult, i, t.clone()))),
    );

    let count = facts.len();
    for fact in facts {
        backends.records.put_fact(fact).await?;
    }
    Ok(count)
}

fn envelope<T>(ctx: &PageContext, family: FactFamily, index: usize, attributes: T) -> FactRecord<T> {
    FactRecord {
        id: FactId::for_position(ctx.page_id, family, index),
        subject: ctx.subject,
        document_id: ctx.document_id,
        page_id: ctx.page_id,
        created_at: ctx.created_at,
        attributes,
    }
}

async fn fail_page(
    backends: &Backends,
    config: &PipelineConfig,
    item: &ExtractionWork,
    error: PageError,
) -> Result<ExtractionOutcome, PipelineError> {
    warn!("Document {}: {}", item.document_id, error);
    let transition = PageTransition::Failed {
        reason: error.to_string(),
    };
    let transitioned = backends.records.transition_page(item.page_id, transition).await?;
    record_terminal_page(backends, item.document_id, item.ordinal, item.total_pages).await?;
    if !transitioned {
        return Ok(ExtractionOutcome::AlreadyTerminal);
    }
    if let Some(ref observer) = config.observer {
        observer.on_page_error(item.document_id, item.ordinal, Stage::Extraction, &error.to_string());
    }
    Ok(ExtractionOutcome::Failed(error))
}
