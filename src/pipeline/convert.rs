//! Conversion stage: one page work item in, two stored renditions, one page
//! record and one extraction work item out.
//!
//! ## Duplicate deliveries
//!
//! The queue is at-least-once. A delivery that finds the page record already
//! present does not render again. It finishes whatever the earlier delivery
//! may have left undone: the per-page counters (the store counts each ordinal
//! once) and, while the page is still `CONVERTED`, the extraction item (the
//! dedup token collapses it if the first publish went through).
//!
//! ## Overcounted documents
//!
//! An ordinal past the real page count is recorded as skipped and counted as
//! both converted and finished, so the document still completes.
//!
//! ## Terminal failures
//!
//! A page that cannot be rendered, or whose JPEG cannot be squeezed under the
//! ceiling, gets a page record with status `ERROR` and counts as processed.
//! Sibling pages are unaffected.

use crate::backend::{Backends, PageInsert};
use crate::config::PipelineConfig;
use crate::error::{PageError, PipelineError};
use crate::model::{DocumentStatus, EncodingKind, Page, PageId, PageStatus, Rendition};
use crate::pipeline::encode::{self, Compressed, EncodeError};
use crate::pipeline::{record_converted_page, record_terminal_page};
use crate::pipeline::render::{self, RenderError, RenderSettings};
use crate::work::{ExtractionWork, PageWork, Stage, WorkItem};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What [`convert_page`] did with a work item.
#[derive(Debug, Clone, PartialEq)]
pub enum ConversionOutcome {
    Converted {
        page_id: PageId,
        lossy_quality: u8,
        downscaled: bool,
    },
    /// The page record already existed.
    Duplicate { page_id: PageId, status: PageStatus },
    /// The ordinal lies beyond the real page count (the count was an
    /// overestimate). Recorded as skipped, no page record.
    OutOfRange,
    /// The page was recorded as `ERROR`.
    Failed(PageError),
}

/// Process one [`PageWork`] item.
pub async fn convert_page(
    backends: &Backends,
    config: &PipelineConfig,
    item: &PageWork,
) -> Result<ConversionOutcome, PipelineError> {
    let page_id = PageId::for_ordinal(item.document_id, item.ordinal);

    if let Some(existing) = backends
        .records
        .find_page(item.document_id, item.ordinal)
        .await?
    {
        return redeliver_existing(backends, item, existing).await;
    }

    let pdf = Arc::new(backends.objects.get(&item.source).await?);
    let settings = RenderSettings::from_config(config);

    let image = match render::render_page(Arc::clone(&backends.rasterizer), pdf, item.ordinal, settings).await {
        Ok(image) => image,
        Err(RenderError::PageOutOfRange { ordinal, total }) => {
            if backends.records.mark_skipped(item.document_id, ordinal).await? {
                warn!(
                    "Document {}: page {} beyond real page count {}, skipping",
                    item.document_id, ordinal, total
                );
            }
            record_converted_page(backends, item.document_id, ordinal, item.total_pages).await?;
            record_terminal_page(backends, item.document_id, ordinal, item.total_pages).await?;
            return Ok(ConversionOutcome::OutOfRange);
        }
        Err(e @ (RenderError::Task(_) | RenderError::Binding(_))) => {
            return Err(PipelineError::Internal(e.to_string()));
        }
        Err(e) => {
            let error = PageError::RenderFailed {
                page: item.ordinal,
                detail: e.to_string(),
            };
            return fail_page(backends, config, item, page_id, Vec::new(), error).await;
        }
    };

    // Both encodes are CPU-bound.
    let policy = config.compression.clone();
    let (lossless, lossy) = tokio::task::spawn_blocking(move || {
        (encode::encode_lossless(&image), encode::compress_to_ceiling(&image, &policy))
    })
    .await
    .map_err(|e| PipelineError::Internal(format!("Encode task panicked: {}", e)))?;

    let lossless = match lossless {
        Ok(bytes) => bytes,
        Err(e) => {
            let error = PageError::EncodeFailed {
                page: item.ordinal,
                detail: e.to_string(),
            };
            return fail_page(backends, config, item, page_id, Vec::new(), error).await;
        }
    };

    let lossless_rendition = store_rendition(backends, config, item, EncodingKind::Lossless, lossless).await?;

    let compressed: Compressed = match lossy {
        Ok(c) => c,
        Err(e) => {
            let error = match e {
                EncodeError::OverCeiling {
                    smallest, ceiling, ..
                } => PageError::PayloadTooLarge {
                    page: item.ordinal,
                    bytes: smallest,
                    ceiling,
                },
                EncodeError::Image(err) => PageError::EncodeFailed {
                    page: item.ordinal,
                    detail: err.to_string(),
                },
            };
            return fail_page(backends, config, item, page_id, vec![lossless_rendition], error).await;
        }
    };
    debug!(
        "Page {}: JPEG q={} {}x{} {} bytes after {} attempts",
        item.ordinal,
        compressed.quality,
        compressed.width,
        compressed.height,
        compressed.bytes.len(),
        compressed.attempts
    );
    let lossy_quality = compressed.quality;
    let downscaled = compressed.downscaled;
    let lossy_rendition = store_rendition(backends, config, item, EncodingKind::Lossy, compressed.bytes).await?;

    let page = Page {
        id: page_id,
        document_id: item.document_id,
        ordinal: item.ordinal,
        renditions: vec![lossless_rendition.clone(), lossy_rendition.clone()],
        status: PageStatus::Converted,
        categories: Vec::new(),
        error: None,
        diagnostic: None,
        created_at: Utc::now(),
    };

    if let PageInsert::Existing(existing) = backends.records.create_page(page).await? {
        // Lost a race with a concurrent delivery of the same item.
        return redeliver_existing(backends, item, existing).await;
    }

    let converted = record_converted_page(backends, item.document_id, item.ordinal, item.total_pages).await?;

    let work = ExtractionWork {
        document_id: item.document_id,
        page_id,
        ordinal: item.ordinal,
        total_pages: item.total_pages,
        lossless: lossless_rendition,
        lossy: lossy_rendition,
    };
    backends.extraction_queue.publish(work.to_message()?).await?;

    info!(
        "Document {}: page {}/{} converted ({} converted so far)",
        item.document_id, item.ordinal, item.total_pages, converted
    );
    if let Some(ref observer) = config.observer {
        observer.on_page_converted(item.document_id, item.ordinal, item.total_pages);
    }

    Ok(ConversionOutcome::Converted {
        page_id,
        lossy_quality,
        downscaled,
    })
}

async fn store_rendition(
    backends: &Backends,
    config: &PipelineConfig,
    item: &PageWork,
    kind: EncodingKind,
    bytes: Vec<u8>,
) -> Result<Rendition, PipelineError> {
    let location = config
        .storage
        .rendition_location(item.document_id, item.ordinal, kind);
    let size = bytes.len();
    backends
        .objects
        .put(&location, bytes, kind.content_type())
        .await?;
    Ok(Rendition {
        kind,
        location,
        bytes: size,
    })
}

async fn redeliver_existing(
    backends: &Backends,
    item: &PageWork,
    existing: Page,
) -> Result<ConversionOutcome, PipelineError> {
    debug!(
        "Document {}: page {} already recorded as {:?}",
        item.document_id, item.ordinal, existing.status
    );
    if existing.rendition(EncodingKind::Lossy).is_some() {
        record_converted_page(backends, item.document_id, item.ordinal, item.total_pages).await?;
    }
    if existing.status.is_terminal() {
        record_terminal_page(backends, item.document_id, item.ordinal, item.total_pages).await?;
    }
    if existing.status == PageStatus::Converted {
        if let (Some(lossless), Some(lossy)) = (
            existing.rendition(EncodingKind::Lossless),
            existing.rendition(EncodingKind::Lossy),
        ) {
            let work = ExtractionWork {
                document_id: item.document_id,
                page_id: existing.id,
                ordinal: item.ordinal,
                total_pages: item.total_pages,
                lossless: lossless.clone(),
                lossy: lossy.clone(),
            };
            backends.extraction_queue.publish(work.to_message()?).await?;
        }
    }
    Ok(ConversionOutcome::Duplicate {
        page_id: existing.id,
        status: existing.status,
    })
}

async fn fail_page(
    backends: &Backends,
    config: &PipelineConfig,
    item: &PageWork,
    page_id: PageId,
    renditions: Vec<Rendition>,
    error: PageError,
) -> Result<ConversionOutcome, PipelineError> {
    warn!("Document {}: {}", item.document_id, error);
    let page = Page {
        id: page_id,
        document_id: item.document_id,
        ordinal: item.ordinal,
        renditions,
        status: PageStatus::Error,
        categories: Vec::new(),
        error: Some(error.to_string()),
        diagnostic: None,
        created_at: Utc::now(),
    };
    if let PageInsert::Existing(existing) = backends.records.create_page(page).await? {
        return redeliver_existing(backends, item, existing).await;
    }

    backends
        .records
        .advance_status(item.document_id, DocumentStatus::Converting)
        .await?;
    record_terminal_page(backends, item.document_id, item.ordinal, item.total_pages).await?;

    if let Some(ref observer) = config.observer {
        observer.on_page_error(item.document_id, item.ordinal, Stage::Conversion, &error.to_string());
    }
    Ok(ConversionOutcome::Failed(error))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{InMemoryObjectStore, ObjectStore};
    use crate::model::{Document, DocumentId, ObjectLocation, PageCountSource, SubjectRef};
    use crate::pipeline::test_support::{backends, ScriptedInference};

    async fn seeded(pages: u32) -> (Backends, Arc<InMemoryObjectStore>, PageWork) {
        let objects = Arc::new(InMemoryObjectStore::new());
        let mut b = backends(pages, Arc::new(ScriptedInference::new(vec![Ok("{}".into())])));
        b.objects = objects.clone();

        let doc_id = DocumentId::for_upload("uploads/AlexDoe_Records.pdf");
        let source = ObjectLocation::new("documents", format!("documents/{doc_id}/AlexDoe_Records.pdf"));
        objects.put(&source, b"%PDF-1.7".to_vec(), "application/pdf").await.unwrap();
        b.records
            .create_document(Document {
                id: doc_id,
                filename: "AlexDoe_Records.pdf".into(),
                source: source.clone(),
                total_pages: pages,
                page_count_source: PageCountSource::Parsed,
                status: DocumentStatus::Uploaded,
                pages_converted: 0,
                pages_processed: 0,
                subject: SubjectRef::Pending,
                subject_hint: Some("AlexDoe".into()),
                uploaded_at: Utc::now(),
            })
            .await
            .unwrap();

        let item = PageWork {
            document_id: doc_id,
            source,
            filename: "AlexDoe_Records.pdf".into(),
            ordinal: 1,
            total_pages: pages,
        };
        (b, objects, item)
    }

    #[tokio::test]
    async fn converts_and_enqueues_extraction() {
        let (b, objects, item) = seeded(2).await;
        let config = PipelineConfig::default();

        let outcome = convert_page(&b, &config, &item).await.unwrap();
        assert!(matches!(outcome, ConversionOutcome::Converted { lossy_quality: 85, .. }));

        let doc = item.document_id;
        let png = config.storage.rendition_location(doc, 1, EncodingKind::Lossless);
        let jpg = config.storage.rendition_location(doc, 1, EncodingKind::Lossy);
        assert!(objects.contains(&png));
        assert_eq!(objects.content_type(&jpg).as_deref(), Some("image/jpeg"));

        let stored = b.records.get_document(doc).await.unwrap();
        assert_eq!(stored.pages_converted, 1);
        assert_eq!(stored.pages_processed, 0);
        assert_eq!(stored.status, DocumentStatus::Converting);
        assert_eq!(b.extraction_queue.depth().await.unwrap().visible, 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_does_not_recount() {
        let (b, _objects, item) = seeded(1).await;
        let config = PipelineConfig::default();

        convert_page(&b, &config, &item).await.unwrap();
        let again = convert_page(&b, &config, &item).await.unwrap();
        assert!(matches!(
            again,
            ConversionOutcome::Duplicate {
                status: PageStatus::Converted,
                ..
            }
        ));

        let stored = b.records.get_document(item.document_id).await.unwrap();
        assert_eq!(stored.pages_converted, 1);
        assert_eq!(stored.status, DocumentStatus::Converted);
        assert_eq!(b.records.pages_for_document(item.document_id).await.unwrap().len(), 1);
        // Republished item collapsed by its dedup token.
        assert_eq!(b.extraction_queue.depth().await.unwrap().visible, 1);
    }

    #[tokio::test]
    async fn overcounted_ordinal_is_skipped_and_counted_once() {
        let (b, _objects, mut item) = seeded(2).await;
        item.ordinal = 3;
        item.total_pages = 3;
        let config = PipelineConfig::default();

        for _ in 0..2 {
            let outcome = convert_page(&b, &config, &item).await.unwrap();
            assert_eq!(outcome, ConversionOutcome::OutOfRange);
        }
        assert!(b.records.find_page(item.document_id, 3).await.unwrap().is_none());
        assert_eq!(b.records.skipped_ordinals(item.document_id).await.unwrap(), vec![3]);

        let doc = b.records.get_document(item.document_id).await.unwrap();
        assert_eq!(doc.pages_converted, 1);
        assert_eq!(doc.pages_processed, 1);
        assert_eq!(doc.status, DocumentStatus::Converting);
        assert_eq!(b.extraction_queue.depth().await.unwrap().visible, 0);
    }

    #[tokio::test]
    async fn redelivery_finishes_an_interrupted_conversion() {
        let (b, _objects, item) = seeded(1).await;
        let config = PipelineConfig::default();
        let rendition = |kind| Rendition {
            kind,
            location: config.storage.rendition_location(item.document_id, 1, kind),
            bytes: 10,
        };
        // an earlier delivery stored the page, then failed before counting
        b.records
            .create_page(Page {
                id: PageId::for_ordinal(item.document_id, 1),
                document_id: item.document_id,
                ordinal: 1,
                renditions: vec![rendition(EncodingKind::Lossless), rendition(EncodingKind::Lossy)],
                status: PageStatus::Converted,
                categories: Vec::new(),
                error: None,
                diagnostic: None,
                created_at: Utc::now(),
            })
            .await
            .unwrap();

        let outcome = convert_page(&b, &config, &item).await.unwrap();
        assert!(matches!(outcome, ConversionOutcome::Duplicate { .. }));
        convert_page(&b, &config, &item).await.unwrap();

        let doc = b.records.get_document(item.document_id).await.unwrap();
        assert_eq!(doc.pages_converted, 1);
        assert_eq!(doc.status, DocumentStatus::Converted);
        assert_eq!(b.extraction_queue.depth().await.unwrap().visible, 1);
    }

    #[tokio::test]
    async fn unreachable_ceiling_marks_page_error() {
        let (b, _objects, item) = seeded(1).await;
        let config = PipelineConfig::builder().payload_ceiling(16).build().unwrap();

        let outcome = convert_page(&b, &config, &item).await.unwrap();
        assert!(matches!(
            outcome,
            ConversionOutcome::Failed(PageError::PayloadTooLarge { ceiling: 16, .. })
        ));

        let page = b.records.find_page(item.document_id, 1).await.unwrap().unwrap();
        assert_eq!(page.status, PageStatus::Error);
        assert!(page.error.unwrap().contains("exceeds ceiling"));

        let doc = b.records.get_document(item.document_id).await.unwrap();
        assert_eq!(doc.pages_processed, 1);
        assert_eq!(doc.status, DocumentStatus::Complete);
        assert_eq!(b.extraction_queue.depth().await.unwrap().visible, 0);
    }

    #[tokio::test]
    async fn missing_source_is_infrastructure_failure() {
        let (b, _objects, mut item) = seeded(1).await;
        item.source = ObjectLocation::new("documents", "missing.pdf");
        let err = convert_page(&b, &PipelineConfig::default(), &item).await.unwrap_err();
        assert!(matches!(err, PipelineError::ObjectStore(_)));
        assert!(err.is_redeliverable());
    }
}
