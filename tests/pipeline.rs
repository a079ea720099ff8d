//! End-to-end pipeline scenarios over in-memory backends.
//!
//! A synthetic rasterizer paints page `n` flat grey at luminance `40 * n`, and
//! the scripted inference client recovers the ordinal from the image it is
//! sent. That keeps replies tied to pages even while [`medingest::drain`]
//! processes them concurrently and out of order.
//!
//! Scenarios that hit the throttling backoff run on tokio's paused clock.

use async_trait::async_trait;
use base64::Engine;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use medingest::backend::{
    Backends, InferenceClient, InferenceReply, InferenceRequest, ObjectStore, RecordStore,
    WorkQueue,
};
use medingest::model::{
    DocumentId, DocumentStatus, EncodingKind, FactFamily, ObjectLocation, PageStatus, SubjectRef,
};
use medingest::pipeline::convert::ConversionOutcome;
use medingest::pipeline::extract::ExtractionOutcome;
use medingest::pipeline::render::{PageRasterizer, RenderError, RenderSettings};
use medingest::work::WorkItem;
use medingest::worker::{handle_conversion, Disposition};
use medingest::{
    ExtractionWork, InferenceError, PageWork, Pipeline, PipelineConfig, PipelineError, Upload,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

// ── Test doubles ─────────────────────────────────────────────────────────────

const LUMA_STEP: u32 = 40;

/// Flat pages, optionally failing to open or to render one page.
struct SyntheticRasterizer {
    pages: u32,
    parseable: bool,
    broken_page: Option<u32>,
    textured: bool,
}

impl SyntheticRasterizer {
    fn pages(pages: u32) -> Self {
        Self {
            pages,
            parseable: true,
            broken_page: None,
            textured: false,
        }
    }
}

fn textured_page() -> DynamicImage {
    let img = RgbImage::from_fn(600, 800, |x, y| {
        Rgb([
            ((x * 7 + y * 13) % 256) as u8,
            ((x * y) % 256) as u8,
            ((x ^ y) % 256) as u8,
        ])
    });
    DynamicImage::ImageRgb8(img)
}

impl PageRasterizer for SyntheticRasterizer {
    fn page_count(&self, _pdf: &[u8]) -> Result<u32, RenderError> {
        if self.parseable {
            Ok(self.pages)
        } else {
            Err(RenderError::Unreadable("xref table damaged".into()))
        }
    }

    fn render(&self, _pdf: &[u8], ordinal: u32, _s: &RenderSettings) -> Result<DynamicImage, RenderError> {
        if ordinal == 0 || ordinal > self.pages {
            return Err(RenderError::PageOutOfRange {
                ordinal,
                total: self.pages,
            });
        }
        if self.broken_page == Some(ordinal) {
            return Err(RenderError::Failed {
                ordinal,
                detail: "corrupt content stream".into(),
            });
        }
        if self.textured {
            return Ok(textured_page());
        }
        let luma = (ordinal * LUMA_STEP).min(255) as u8;
        Ok(DynamicImage::ImageRgb8(RgbImage::from_pixel(64, 90, Rgb([luma, luma, luma]))))
    }
}

/// Per-page reply queues; a page with nothing queued gets `fallback`.
struct PageScript {
    replies: Mutex<HashMap<u32, VecDeque<Result<String, InferenceError>>>>,
    fallback: String,
    calls: Mutex<HashMap<u32, u32>>,
    instructions: Mutex<Vec<(u32, String)>>,
}

impl PageScript {
    fn new(fallback: &str) -> Self {
        Self {
            replies: Mutex::new(HashMap::new()),
            fallback: fallback.to_string(),
            calls: Mutex::new(HashMap::new()),
            instructions: Mutex::new(Vec::new()),
        }
    }

    fn on_page(self, ordinal: u32, replies: Vec<Result<String, InferenceError>>) -> Self {
        self.replies.lock().unwrap().insert(ordinal, replies.into());
        self
    }

    fn calls(&self, ordinal: u32) -> u32 {
        self.calls.lock().unwrap().get(&ordinal).copied().unwrap_or(0)
    }

    fn instruction_for(&self, ordinal: u32) -> String {
        self.instructions
            .lock()
            .unwrap()
            .iter()
            .find(|(n, _)| *n == ordinal)
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }
}

fn ordinal_of(request: &InferenceRequest) -> u32 {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(&request.image.base64)
        .unwrap();
    let img = image::load_from_memory(&bytes).unwrap();
    let (w, h) = img.dimensions();
    let luma = img.to_luma8().get_pixel(w / 2, h / 2)[0] as u32;
    (luma + LUMA_STEP / 2) / LUMA_STEP
}

#[async_trait]
impl InferenceClient for PageScript {
    async fn infer(&self, request: &InferenceRequest) -> Result<InferenceReply, InferenceError> {
        let ordinal = ordinal_of(request);
        *self.calls.lock().unwrap().entry(ordinal).or_insert(0) += 1;
        self.instructions
            .lock()
            .unwrap()
            .push((ordinal, request.instruction.clone()));

        let next = self
            .replies
            .lock()
            .unwrap()
            .get_mut(&ordinal)
            .and_then(|q| q.pop_front())
            .unwrap_or_else(|| Ok(self.fallback.clone()));
        next.map(|text| InferenceReply {
            text,
            input_tokens: 900,
            output_tokens: 120,
        })
    }
}

fn throttled() -> Result<String, InferenceError> {
    Err(InferenceError::Throttled {
        detail: "429 Too Many Requests".into(),
        retry_after_ms: None,
    })
}

// ── Helpers ──────────────────────────────────────────────────────────────────

const LAB_PAGE: &str = r#"{"categories":[{"name":"Laboratories","reason":"lab panel"}],"medications":[],"diagnoses":[],"test_results":[]}"#;

const FIRST_PAGE: &str = r#"```json
{
  "subject": {"first_name": "Alex", "last_name": "Doe", "date_of_birth": "1980-04-02", "mrn": "MRN-2231"},
  "categories": [{"name": "Internal Medicine", "reason": "medication reconciliation"}],
  "medications": [
    {"name": "Metformin", "dosage": "500 mg", "frequency": "twice daily", "is_current": true},
    {"name": "Lisinopril", "dosage": "10 mg", "frequency": "daily"}
  ],
  "diagnoses": [],
  "test_results": []
}
```"#;

const DIAGNOSIS_PAGE: &str = r#"{"categories":[{"name":"Endocrinology","reason":"diabetes follow-up"}],
"medications":[],"diagnoses":[{"description":"Type 2 diabetes mellitus","code":"E11.9","is_current":"true"}],"test_results":[]}"#;

struct Harness {
    pipeline: Pipeline,
    inference: Arc<PageScript>,
    upload: Upload,
}

impl Harness {
    async fn new(rasterizer: SyntheticRasterizer, inference: PageScript, config: PipelineConfig) -> Self {
        Self::with_pdf(rasterizer, inference, config, b"%PDF-1.7 synthetic".to_vec()).await
    }

    async fn with_pdf(
        rasterizer: SyntheticRasterizer,
        inference: PageScript,
        config: PipelineConfig,
        pdf: Vec<u8>,
    ) -> Self {
        let inference = Arc::new(inference);
        let backends = Backends::in_memory(inference.clone(), Arc::new(rasterizer));
        let location = ObjectLocation::new("uploads", "incoming/AlexDoe_MedicalRecords.pdf");
        backends
            .objects
            .put(&location, pdf, "application/pdf")
            .await
            .unwrap();
        Self {
            pipeline: Pipeline::new(backends, config),
            inference,
            upload: Upload::new(location),
        }
    }

    fn document_id(&self) -> DocumentId {
        DocumentId::for_upload(&self.upload.event_key)
    }

    fn records(&self) -> &Arc<dyn RecordStore> {
        &self.pipeline.backends().records
    }
}

// ── Scenarios ────────────────────────────────────────────────────────────────

#[tokio::test]
async fn three_page_document_yields_subject_and_facts() {
    let script = PageScript::new(LAB_PAGE)
        .on_page(1, vec![Ok(FIRST_PAGE.into())])
        .on_page(2, vec![Ok(DIAGNOSIS_PAGE.into())])
        .on_page(3, vec![Ok(DIAGNOSIS_PAGE.into())]);
    let h = Harness::new(SyntheticRasterizer::pages(3), script, PipelineConfig::default()).await;

    let intake = h.pipeline.ingest(&h.upload).await.unwrap();
    assert!(intake.created);
    assert_eq!(intake.document.total_pages, 3);
    assert_eq!(intake.document.subject_hint.as_deref(), Some("AlexDoe"));
    assert_eq!(intake.enqueued, 3);

    let report = h.pipeline.drain().await.unwrap();
    assert_eq!(report.conversions, 3);
    assert_eq!(report.extractions, 3);
    assert_eq!(report.redelivered + report.dropped + report.dead_lettered, 0);

    let query = h.pipeline.query();
    let subjects = query.subjects().await.unwrap();
    assert_eq!(subjects.len(), 1);
    let subject = &subjects[0];
    assert_eq!(subject.attributes.first_name.as_str(), "Alex");
    assert_eq!(subject.attributes.blood_type.as_str(), "Unknown");

    let meds = query.subject_medications(subject.id).await.unwrap();
    assert_eq!(meds.len(), 2);
    assert!(meds.iter().all(|m| m.subject == SubjectRef::Resolved(subject.id)));

    let diagnoses = query.subject_diagnoses(subject.id).await.unwrap();
    assert_eq!(diagnoses.len(), 2);
    assert!(diagnoses.iter().all(|d| d.attributes.code.as_str() == "E11.9"));
    assert!(query.subject_test_results(subject.id).await.unwrap().is_empty());

    let pages = query.document_pages(h.document_id()).await.unwrap();
    assert_eq!(pages.iter().map(|p| p.ordinal).collect::<Vec<_>>(), vec![1, 2, 3]);
    assert!(pages.iter().all(|p| p.status == PageStatus::Processed));
    assert!(pages.iter().all(|p| p.rendition(EncodingKind::Lossless).is_some()));

    let tags = query.page_categories(pages[1].id).await.unwrap();
    assert_eq!(tags.len(), 1);
    assert_eq!(tags[0].label.as_str(), "Endocrinology");

    let progress = query.document_progress(h.document_id()).await.unwrap();
    assert_eq!(progress.actual_processed, 3);
    assert_eq!(progress.pages_processed, 3);
    assert_eq!(progress.pages_converted, 3);
    assert_eq!(progress.status, DocumentStatus::Complete);
    assert!(progress.confirmed_complete);

    let document = query.document(h.document_id()).await.unwrap();
    assert_eq!(document.subject, SubjectRef::Resolved(subject.id));
    assert_eq!(query.subject_documents(subject.id).await.unwrap().len(), 1);

    // only the first page is asked for demographics
    assert!(h.inference.instruction_for(1).contains("date_of_birth"));
    assert!(!h.inference.instruction_for(2).contains("date_of_birth"));
}

#[tokio::test(start_paused = true)]
async fn throttled_four_times_then_processed() {
    let script = PageScript::new(LAB_PAGE).on_page(
        1,
        vec![throttled(), throttled(), throttled(), throttled(), Ok(LAB_PAGE.into())],
    );
    let h = Harness::new(SyntheticRasterizer::pages(1), script, PipelineConfig::default()).await;

    h.pipeline.ingest(&h.upload).await.unwrap();
    let report = h.pipeline.drain().await.unwrap();

    assert_eq!(report.redelivered, 0);
    assert_eq!(h.inference.calls(1), 5);
    let pages = h.records().pages_for_document(h.document_id()).await.unwrap();
    assert_eq!(pages[0].status, PageStatus::Processed);
}

#[tokio::test(start_paused = true)]
async fn exhausted_throttling_escalates_to_queue_redelivery() {
    let script = PageScript::new(LAB_PAGE).on_page(1, vec![throttled(); 5]);
    let h = Harness::new(SyntheticRasterizer::pages(1), script, PipelineConfig::default()).await;
    let backends = h.pipeline.backends();
    let config = h.pipeline.config();

    h.pipeline.ingest(&h.upload).await.unwrap();
    let conversion = backends.conversion_queue.receive(1).await.unwrap().remove(0);
    assert_eq!(
        handle_conversion(backends, config, &conversion).await.unwrap(),
        Disposition::Completed
    );

    let delivery = backends.extraction_queue.receive(1).await.unwrap().remove(0);
    let item = ExtractionWork::from_body(&delivery.message.body).unwrap();
    let err = h.pipeline.extract(&item).await.unwrap_err();
    match &err {
        PipelineError::ThrottlingExhausted { attempts, ordinal, .. } => {
            assert_eq!(*attempts, 5);
            assert_eq!(*ordinal, 1);
        }
        other => panic!("expected ThrottlingExhausted, got {other:?}"),
    }
    assert!(err.is_redeliverable());
    assert_eq!(h.inference.calls(1), 5);

    // the page is left for the queue to retry
    let page = h.records().get_page(item.page_id).await.unwrap();
    assert_eq!(page.status, PageStatus::Converted);

    backends
        .extraction_queue
        .nack(&delivery.receipt, config.redelivery_delay())
        .await
        .unwrap();
    let report = h.pipeline.drain().await.unwrap();
    assert_eq!(report.extractions, 1);
    assert_eq!(h.inference.calls(1), 6);

    let page = h.records().get_page(item.page_id).await.unwrap();
    assert_eq!(page.status, PageStatus::Processed);
}

#[tokio::test]
async fn terminal_page_errors_do_not_affect_siblings() {
    let script = PageScript::new(LAB_PAGE).on_page(
        3,
        vec![Err(InferenceError::Rejected("400 invalid image".into()))],
    );
    let rasterizer = SyntheticRasterizer {
        broken_page: Some(2),
        ..SyntheticRasterizer::pages(4)
    };
    let h = Harness::new(rasterizer, script, PipelineConfig::default()).await;

    h.pipeline.ingest(&h.upload).await.unwrap();
    let report = h.pipeline.drain().await.unwrap();
    assert_eq!(report.redelivered, 0);
    assert_eq!(h.inference.calls(3), 1, "rejections are never retried");

    let pages = h.records().pages_for_document(h.document_id()).await.unwrap();
    let status: Vec<_> = pages.iter().map(|p| (p.ordinal, p.status)).collect();
    assert_eq!(
        status,
        vec![
            (1, PageStatus::Processed),
            (2, PageStatus::Error),
            (3, PageStatus::Error),
            (4, PageStatus::Processed),
        ]
    );
    assert!(pages[1].error.as_deref().unwrap().contains("corrupt content stream"));
    assert!(pages[2].error.as_deref().unwrap().contains("rejected"));

    let reconciliation = h.pipeline.query().reconcile(h.document_id()).await.unwrap();
    assert!(reconciliation.is_consistent());
    assert_eq!(reconciliation.failures.len(), 2);
    assert_eq!(reconciliation.progress.status, DocumentStatus::Complete);
    assert!(reconciliation.progress.confirmed_complete);
}

#[tokio::test]
async fn redelivered_work_creates_nothing_twice() {
    let script = PageScript::new(LAB_PAGE).on_page(1, vec![Ok(FIRST_PAGE.into())]);
    let h = Harness::new(SyntheticRasterizer::pages(2), script, PipelineConfig::default()).await;

    let first = h.pipeline.ingest(&h.upload).await.unwrap();
    let again = h.pipeline.ingest(&h.upload).await.unwrap();
    assert!(!again.created);
    assert_eq!(again.document.id, first.document.id);
    assert_eq!(again.enqueued, 0);
    assert_eq!(again.deduplicated, 2);
    assert_eq!(h.pipeline.query().documents().await.unwrap().len(), 1);

    h.pipeline.drain().await.unwrap();
    let meds_before = h
        .records()
        .facts_for_document(h.document_id(), FactFamily::Medication)
        .await
        .unwrap()
        .len();

    // at-least-once: the same page work arrives again after completion
    let document = h.records().get_document(h.document_id()).await.unwrap();
    let page_work = PageWork {
        document_id: document.id,
        source: document.source.clone(),
        filename: document.filename.clone(),
        ordinal: 1,
        total_pages: document.total_pages,
    };
    let outcome = h.pipeline.convert(&page_work).await.unwrap();
    assert!(matches!(
        outcome,
        ConversionOutcome::Duplicate {
            status: PageStatus::Processed,
            ..
        }
    ));

    let page = h.records().find_page(document.id, 1).await.unwrap().unwrap();
    let extraction_work = ExtractionWork {
        document_id: document.id,
        page_id: page.id,
        ordinal: 1,
        total_pages: document.total_pages,
        lossless: page.rendition(EncodingKind::Lossless).unwrap().clone(),
        lossy: page.rendition(EncodingKind::Lossy).unwrap().clone(),
    };
    let outcome = h.pipeline.extract(&extraction_work).await.unwrap();
    assert_eq!(outcome, ExtractionOutcome::AlreadyTerminal);

    let document = h.records().get_document(document.id).await.unwrap();
    assert_eq!(document.pages_converted, 2);
    assert_eq!(document.pages_processed, 2);
    assert_eq!(h.records().pages_for_document(document.id).await.unwrap().len(), 2);
    assert_eq!(h.pipeline.query().subjects().await.unwrap().len(), 1);
    assert_eq!(
        h.records()
            .facts_for_document(document.id, FactFamily::Medication)
            .await
            .unwrap()
            .len(),
        meds_before
    );
}

#[tokio::test]
async fn lossy_rendition_stays_under_the_ceiling() {
    let page = textured_page();
    let at_lowest_rung = medingest::pipeline::encode::encode_lossy(&page, 45).unwrap().len();
    let ceiling = at_lowest_rung - 1;

    let rasterizer = SyntheticRasterizer {
        textured: true,
        ..SyntheticRasterizer::pages(1)
    };
    let config = PipelineConfig::builder().payload_ceiling(ceiling).build().unwrap();
    let h = Harness::new(rasterizer, PageScript::new(LAB_PAGE), config).await;

    h.pipeline.ingest(&h.upload).await.unwrap();
    let page_work = PageWork::from_body(
        &h.pipeline
            .backends()
            .conversion_queue
            .receive(1)
            .await
            .unwrap()
            .remove(0)
            .message
            .body,
    )
    .unwrap();

    match h.pipeline.convert(&page_work).await.unwrap() {
        ConversionOutcome::Converted {
            lossy_quality,
            downscaled,
            ..
        } => {
            assert!(downscaled);
            assert_eq!(lossy_quality, 40);
        }
        other => panic!("expected Converted, got {other:?}"),
    }

    let stored = h.records().find_page(h.document_id(), 1).await.unwrap().unwrap();
    let lossy = stored.rendition(EncodingKind::Lossy).unwrap();
    assert!(lossy.bytes <= ceiling);
    let bytes = h.pipeline.backends().objects.get(&lossy.location).await.unwrap();
    assert_eq!(bytes.len(), lossy.bytes);
    assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (300, 400));
}

#[tokio::test]
async fn overcounted_pages_are_skipped_and_the_document_completes() {
    // pdfium cannot open it, but two page objects are visible in the bytes
    let pdf = b"%PDF-1.4\n1 0 obj << /Type /Pages /Kids [2 0 R 3 0 R 4 0 R] >>\n\
2 0 obj << /Type /Page >>\n3 0 obj << /Type /Page >>\n4 0 obj << /Type /Page >>\n%%EOF"
        .to_vec();
    let rasterizer = SyntheticRasterizer {
        parseable: false,
        ..SyntheticRasterizer::pages(2)
    };
    let h = Harness::with_pdf(rasterizer, PageScript::new(LAB_PAGE), PipelineConfig::default(), pdf).await;

    let intake = h.pipeline.ingest(&h.upload).await.unwrap();
    assert_eq!(intake.document.total_pages, 3);

    let report = h.pipeline.drain().await.unwrap();
    assert_eq!(report.conversions, 3);
    assert_eq!(report.extractions, 2);

    let reconciliation = h.pipeline.query().reconcile(h.document_id()).await.unwrap();
    assert_eq!(reconciliation.skipped_ordinals, vec![3]);
    assert!(reconciliation.missing_ordinals.is_empty());
    assert_eq!(reconciliation.progress.actual_processed, 3);
    assert_eq!(reconciliation.progress.pages_processed, 3);
    assert_eq!(reconciliation.progress.pages_converted, 3);
    assert_eq!(reconciliation.progress.status, DocumentStatus::Complete);
    assert!(reconciliation.progress.confirmed_complete);
    assert!(reconciliation.is_consistent());
    assert_eq!(h.records().pages_for_document(h.document_id()).await.unwrap().len(), 2);
    assert!(h.pipeline.query().incomplete_documents().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_storage_copy_registers_nothing() {
    let backends = Backends::in_memory(
        Arc::new(PageScript::new(LAB_PAGE)),
        Arc::new(SyntheticRasterizer::pages(2)),
    );
    let pipeline = Pipeline::new(backends, PipelineConfig::default());
    let missing = Upload::new(ObjectLocation::new("uploads", "never-arrived.pdf"));

    let err = pipeline.ingest(&missing).await.unwrap_err();
    assert!(matches!(err, PipelineError::ObjectStore(_)), "got {err:?}");
    assert!(err.is_redeliverable());
    assert!(pipeline.query().documents().await.unwrap().is_empty());
    let depth = pipeline.backends().conversion_queue.depth().await.unwrap();
    assert_eq!(depth.outstanding(), 0);
}
