//! Intake stage: register an uploaded document and fan it out into one
//! conversion work item per page.
//!
//! Order matters for all-or-nothing behaviour: the upload is copied to
//! canonical storage *before* the document record exists, so a failed copy
//! leaves nothing behind and the upload event can simply be redelivered.
//!
//! A redelivered upload event derives the same [`DocumentId`]. The existing
//! record is reused and every page item is published again; the queue's
//! dedup tokens collapse the repeats, and any items lost by a crash between
//! registration and publishing are filled in.

use crate::backend::{Backends, PublishOutcome};
use crate::config::PipelineConfig;
use crate::error::{PipelineError, StoreError};
use crate::model::{Document, DocumentId, DocumentStatus, ObjectLocation, SubjectRef};
use crate::pipeline::render;
use crate::work::{PageWork, WorkItem};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// An upload notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Upload {
    /// Identifies the upload event. Redeliveries carry the same key.
    pub event_key: String,
    /// Where the uploaded bytes currently live.
    pub location: ObjectLocation,
}

impl Upload {
    /// An upload whose event key is its storage location.
    pub fn new(location: ObjectLocation) -> Self {
        Self {
            event_key: location.to_string(),
            location,
        }
    }

    pub fn with_event_key(mut self, key: impl Into<String>) -> Self {
        self.event_key = key.into();
        self
    }

    /// Last path segment of the upload key.
    pub fn filename(&self) -> &str {
        self.location
            .key
            .rsplit('/')
            .find(|s| !s.is_empty())
            .unwrap_or("document.pdf")
    }
}

/// Result of one intake invocation.
#[derive(Debug, Clone)]
pub struct IntakeReport {
    pub document: Document,
    /// `false` when the document already existed (redelivered upload event).
    pub created: bool,
    pub enqueued: usize,
    pub deduplicated: usize,
}

/// Name fragment before the first underscore: `AlexDoe_Records.pdf` → `AlexDoe`.
pub fn subject_hint(filename: &str) -> Option<String> {
    let (head, _) = filename.split_once('_')?;
    let head = head.trim();
    (!head.is_empty()).then(|| head.to_string())
}

/// Register an upload and enqueue its pages.
pub async fn ingest(
    backends: &Backends,
    config: &PipelineConfig,
    upload: &Upload,
) -> Result<IntakeReport, PipelineError> {
    let document_id = DocumentId::for_upload(&upload.event_key);

    let (document, created) = match existing_document(backends, document_id).await? {
        Some(document) => {
            info!(
                "Upload {} already registered as {}, republishing pages",
                upload.event_key, document_id
            );
            (document, false)
        }
        None => register(backends, config, upload, document_id).await?,
    };

    let mut enqueued = 0;
    let mut deduplicated = 0;
    for ordinal in 1..=document.total_pages {
        let item = PageWork {
            document_id,
            source: document.source.clone(),
            filename: document.filename.clone(),
            ordinal,
            total_pages: document.total_pages,
        };
        match backends.conversion_queue.publish(item.to_message()?).await? {
            PublishOutcome::Enqueued => enqueued += 1,
            PublishOutcome::Deduplicated => deduplicated += 1,
        }
    }

    info!(
        "Document {} ({}): {} pages enqueued, {} deduplicated",
        document_id, document.filename, enqueued, deduplicated
    );
    if let Some(ref observer) = config.observer {
        observer.on_document_registered(document_id, document.total_pages);
    }

    Ok(IntakeReport {
        document,
        created,
        enqueued,
        deduplicated,
    })
}

async fn existing_document(
    backends: &Backends,
    id: DocumentId,
) -> Result<Option<Document>, PipelineError> {
    match backends.records.get_document(id).await {
        Ok(doc) => Ok(Some(doc)),
        Err(StoreError::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn register(
    backends: &Backends,
    config: &PipelineConfig,
    upload: &Upload,
    document_id: DocumentId,
) -> Result<(Document, bool), PipelineError> {
    let filename = upload.filename().to_string();
    let canonical = config.storage.document_location(document_id, &filename);

    // (a) canonical copy; nothing is registered if this fails
    backends.objects.copy(&upload.location, &canonical).await?;
    debug!("Copied {} → {}", upload.location, canonical);

    // (b) page count, degrading instead of failing
    let bytes = Arc::new(backends.objects.get(&canonical).await?);
    let (total_pages, page_count_source) = render::count_pages(
        Arc::clone(&backends.rasterizer),
        Arc::clone(&bytes),
        config.fallback_bytes_per_page,
    )
    .await;

    let subject_hint = subject_hint(&filename);
    if subject_hint.is_none() {
        debug!("No subject hint in filename '{}'", filename);
    }

    // (c) document record
    let document = Document {
        id: document_id,
        filename,
        source: canonical,
        total_pages,
        page_count_source,
        status: DocumentStatus::Uploaded,
        pages_converted: 0,
        pages_processed: 0,
        subject: SubjectRef::Pending,
        subject_hint,
        uploaded_at: Utc::now(),
    };

    if backends.records.create_document(document.clone()).await? {
        info!(
            "Registered document {} with {} pages ({:?})",
            document_id, total_pages, page_count_source
        );
        Ok((document, true))
    } else {
        // A concurrent delivery of the same event won the insert.
        warn!("Document {} registered concurrently, using stored record", document_id);
        Ok((backends.records.get_document(document_id).await?, false))
    }
}
