//! Read-only progress and query layer over the record store.
//!
//! Two notions of completion are exposed side by side:
//!
//! * **likely complete**: the raw `pages_processed` counter has reached
//!   `total_pages`. Cheap, but counters are advisory.
//! * **confirmed complete**: every ordinal has a page record in a terminal
//!   state (`PROCESSED` or `ERROR`) or was skipped as past the real page
//!   count, counted from the records themselves.
//!
//! Facts written before their document's subject was known carry
//! [`SubjectRef::Pending`]. The subject queries here pick those up through
//! the subject's documents and return them with the reference filled in.

use crate::backend::RecordStore;
use crate::error::StoreError;
use crate::model::{
    CategoryTag, Diagnosis, Document, DocumentId, DocumentStatus, Fact, FactFamily, FactRecord,
    Medication, Page, PageId, PageStatus, Subject, SubjectId, SubjectRef, TestResult,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

/// Counter and record-derived progress for one document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DocumentProgress {
    pub document_id: DocumentId,
    pub filename: String,
    pub status: DocumentStatus,
    pub total_pages: u32,
    /// Raw counters as incremented by the workers.
    pub pages_converted: u32,
    pub pages_processed: u32,
    /// Page records in `PROCESSED` or `ERROR`, plus skipped ordinals.
    pub actual_processed: u32,
    /// Ordinals past the real page count.
    pub pages_skipped: u32,
    pub pages_errored: u32,
    /// Page records still waiting for extraction.
    pub pages_awaiting_extraction: u32,
    pub likely_complete: bool,
    pub confirmed_complete: bool,
}

/// Page-level failure as surfaced to operators.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageFailure {
    pub ordinal: u32,
    pub page_id: PageId,
    pub reason: String,
}

/// Comparison of a document's counters against its page records.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reconciliation {
    pub progress: DocumentProgress,
    /// Ordinals in `1..=total_pages` without any page record that were not
    /// skipped either.
    pub missing_ordinals: Vec<u32>,
    /// Ordinals conversion found past the real page count.
    pub skipped_ordinals: Vec<u32>,
    pub failures: Vec<PageFailure>,
    /// `pages_processed - actual_processed`. Positive means over-counted.
    pub processed_drift: i64,
}

impl Reconciliation {
    /// Nothing missing, nothing drifted.
    pub fn is_consistent(&self) -> bool {
        self.missing_ordinals.is_empty() && self.processed_drift == 0
    }
}

/// Read-only queries. Holds no state beyond the store handle.
#[derive(Clone)]
pub struct QueryService {
    records: Arc<dyn RecordStore>,
}

impl std::fmt::Debug for QueryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryService").finish_non_exhaustive()
    }
}

impl QueryService {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    // ── Subjects ─────────────────────────────────────────────────────────

    pub async fn subjects(&self) -> Result<Vec<Subject>, StoreError> {
        self.records.list_subjects().await
    }

    pub async fn subject(&self, id: SubjectId) -> Result<Subject, StoreError> {
        self.records.get_subject(id).await
    }

    pub async fn subject_documents(&self, id: SubjectId) -> Result<Vec<Document>, StoreError> {
        self.records.documents_for_subject(id).await
    }

    pub async fn subject_medications(&self, id: SubjectId) -> Result<Vec<FactRecord<Medication>>, StoreError> {
        let facts = self.subject_facts(id, FactFamily::Medication).await?;
        Ok(facts
            .into_iter()
            .filter_map(|f| match f {
                Fact::Medication(r) => Some(r),
                _ => None,
            })
            .collect())
    }

    pub async fn subject_diagnoses(&self, id: SubjectId) -> Result<Vec<FactRecord<Diagnosis>>, StoreError> {
        let facts = self.subject_facts(id, FactFamily::Diagnosis).await?;
        Ok(facts
            .into_iter()
            .filter_map(|f| match f {
                Fact::Diagnosis(r) => Some(r),
                _ => None,
            })
            .collect())
    }

    pub async fn subject_test_results(&self, id: SubjectId) -> Result<Vec<FactRecord<TestResult>>, StoreError> {
        let facts = self.subject_facts(id, FactFamily::TestResult).await?;
        Ok(facts
            .into_iter()
            .filter_map(|f| match f {
                Fact::TestResult(r) => Some(r),
                _ => None,
            })
            .collect())
    }

    /// Facts resolved to `id` plus pending facts of documents that now
    /// reference `id`, in creation order.
    pub async fn subject_facts(&self, id: SubjectId, family: FactFamily) -> Result<Vec<Fact>, StoreError> {
        let mut facts = self.records.facts_for_subject(id, family).await?;
        let mut seen: HashSet<_> = facts.iter().map(Fact::id).collect();

        for document in self.records.documents_for_subject(id).await? {
            for fact in self.records.facts_for_document(document.id, family).await? {
                if fact.subject() == SubjectRef::Pending && seen.insert(fact.id()) {
                    facts.push(fact.resolved_to(id));
                }
            }
        }

        facts.sort_by(|a, b| a.created_at().cmp(&b.created_at()).then_with(|| a.id().cmp(&b.id())));
        Ok(facts)
    }

    // ── Documents and pages ──────────────────────────────────────────────

    pub async fn documents(&self) -> Result<Vec<Document>, StoreError> {
        self.records.list_documents().await
    }

    pub async fn document(&self, id: DocumentId) -> Result<Document, StoreError> {
        self.records.get_document(id).await
    }

    /// Pages ordered by ordinal, with status and error reason.
    pub async fn document_pages(&self, id: DocumentId) -> Result<Vec<Page>, StoreError> {
        self.records.pages_for_document(id).await
    }

    pub async fn page_categories(&self, page_id: PageId) -> Result<Vec<CategoryTag>, StoreError> {
        self.records.categories_for_page(page_id).await
    }

    /// Facts of one family extracted from a document, as stored.
    pub async fn document_facts(&self, id: DocumentId, family: FactFamily) -> Result<Vec<Fact>, StoreError> {
        self.records.facts_for_document(id, family).await
    }

    // ── Progress ─────────────────────────────────────────────────────────

    pub async fn document_progress(&self, id: DocumentId) -> Result<DocumentProgress, StoreError> {
        let document = self.records.get_document(id).await?;
        let pages = self.records.pages_for_document(id).await?;
        let skipped = self.records.skipped_ordinals(id).await?;
        Ok(progress_of(&document, &pages, &skipped))
    }

    /// Compare counters with page records and list what is missing.
    pub async fn reconcile(&self, id: DocumentId) -> Result<Reconciliation, StoreError> {
        let document = self.records.get_document(id).await?;
        let pages = self.records.pages_for_document(id).await?;
        let skipped_ordinals = self.records.skipped_ordinals(id).await?;
        let progress = progress_of(&document, &pages, &skipped_ordinals);

        let present: HashSet<u32> = pages
            .iter()
            .map(|p| p.ordinal)
            .chain(skipped_ordinals.iter().copied())
            .collect();
        let missing_ordinals = (1..=document.total_pages)
            .filter(|n| !present.contains(n))
            .collect();
        let failures = pages
            .iter()
            .filter(|p| p.status == PageStatus::Error)
            .map(|p| PageFailure {
                ordinal: p.ordinal,
                page_id: p.id,
                reason: p.error.clone().unwrap_or_default(),
            })
            .collect();
        let processed_drift = i64::from(progress.pages_processed) - i64::from(progress.actual_processed);

        Ok(Reconciliation {
            progress,
            missing_ordinals,
            skipped_ordinals,
            failures,
            processed_drift,
        })
    }

    /// Documents whose page records do not yet cover every page.
    pub async fn incomplete_documents(&self) -> Result<Vec<DocumentProgress>, StoreError> {
        let mut incomplete = Vec::new();
        for document in self.records.list_documents().await? {
            let pages = self.records.pages_for_document(document.id).await?;
            let skipped = self.records.skipped_ordinals(document.id).await?;
            let progress = progress_of(&document, &pages, &skipped);
            if !progress.confirmed_complete {
                incomplete.push(progress);
            }
        }
        Ok(incomplete)
    }
}

fn progress_of(document: &Document, pages: &[Page], skipped: &[u32]) -> DocumentProgress {
    let count = |f: fn(&Page) -> bool| pages.iter().filter(|p| f(p)).count() as u32;
    let pages_skipped = skipped.len() as u32;
    let actual_processed = count(|p| p.status.is_terminal()) + pages_skipped;
    DocumentProgress {
        document_id: document.id,
        filename: document.filename.clone(),
        status: document.status,
        total_pages: document.total_pages,
        pages_converted: document.pages_converted,
        pages_processed: document.pages_processed,
        actual_processed,
        pages_skipped,
        pages_errored: count(|p| p.status == PageStatus::Error),
        pages_awaiting_extraction: count(|p| p.status == PageStatus::Converted),
        likely_complete: document.pages_processed >= document.total_pages,
        confirmed_complete: actual_processed >= document.total_pages,
    }
}
