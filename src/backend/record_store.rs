//! Key-value / document store for pipeline records.
//!
//! The store is the pipeline's only shared mutable state. The contract it
//! must meet:
//!
//! * counters change by atomic increment, never read-modify-write from the
//!   caller's side;
//! * records keyed by derived ids are written put-if-absent, so a redelivered
//!   work item cannot duplicate them;
//! * `(document id, ordinal)` is unique across pages;
//! * secondary lookups by foreign key (pages of a document ordered by
//!   ordinal, facts of a subject, documents of a subject).

use crate::error::StoreError;
use crate::model::{
    CategoryTag, Counter, Document, DocumentId, DocumentStatus, Fact, FactFamily, FactId, Page,
    PageId, PageStatus, PageTransition, Subject, SubjectId, SubjectRef, TagId,
};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

pub type StoreResult<T> = Result<T, StoreError>;

/// Outcome of [`RecordStore::count_page`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageCount {
    /// Counter value after the call.
    pub value: u32,
    /// `false` if this page had already been counted.
    pub newly_counted: bool,
}

/// Outcome of [`RecordStore::create_page`].
#[derive(Debug, Clone, PartialEq)]
pub enum PageInsert {
    Created,
    /// A page with the same `(document id, ordinal)` already existed; it is
    /// returned unchanged.
    Existing(Page),
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    // ── Documents ────────────────────────────────────────────────────────
    /// Insert a document. Returns `false` if one with the same id exists.
    async fn create_document(&self, document: Document) -> StoreResult<bool>;

    async fn get_document(&self, id: DocumentId) -> StoreResult<Document>;

    async fn list_documents(&self) -> StoreResult<Vec<Document>>;

    /// Move the document's status to `to` if that is a forward move.
    /// Returns the status after the call.
    async fn advance_status(&self, id: DocumentId, to: DocumentStatus) -> StoreResult<DocumentStatus>;

    /// Atomically increment `counter` on behalf of the page at `ordinal`,
    /// unless that page was already counted. The check and the increment are
    /// one step, so a redelivered item can always call this again.
    async fn count_page(&self, id: DocumentId, ordinal: u32, counter: Counter) -> StoreResult<PageCount>;

    /// Remember that `ordinal` lies past the document's real page count.
    /// Returns `false` if it was already recorded.
    async fn mark_skipped(&self, id: DocumentId, ordinal: u32) -> StoreResult<bool>;

    /// Ordinals recorded by [`RecordStore::mark_skipped`], ascending.
    async fn skipped_ordinals(&self, id: DocumentId) -> StoreResult<Vec<u32>>;

    // ── Subjects ─────────────────────────────────────────────────────────
    /// Store the subject and point its document at it, unless the document
    /// already references a subject. Returns the id the document ends up
    /// referencing.
    async fn attach_subject(&self, subject: Subject) -> StoreResult<SubjectId>;

    async fn get_subject(&self, id: SubjectId) -> StoreResult<Subject>;

    async fn list_subjects(&self) -> StoreResult<Vec<Subject>>;

    async fn documents_for_subject(&self, id: SubjectId) -> StoreResult<Vec<Document>>;

    // ── Pages ────────────────────────────────────────────────────────────
    async fn create_page(&self, page: Page) -> StoreResult<PageInsert>;

    async fn get_page(&self, id: PageId) -> StoreResult<Page>;

    async fn find_page(&self, document_id: DocumentId, ordinal: u32) -> StoreResult<Option<Page>>;

    /// All pages of a document, ordered by ordinal.
    async fn pages_for_document(&self, document_id: DocumentId) -> StoreResult<Vec<Page>>;

    /// Apply a transition to a `CONVERTED` page. Returns `false` without
    /// changing anything if the page is already terminal.
    async fn transition_page(&self, id: PageId, transition: PageTransition) -> StoreResult<bool>;

    // ── Tags and facts (append-only) ─────────────────────────────────────
    /// Put-if-absent. Returns `true` if the tag was new.
    async fn put_category(&self, tag: CategoryTag) -> StoreResult<bool>;

    async fn categories_for_page(&self, page_id: PageId) -> StoreResult<Vec<CategoryTag>>;

    /// Put-if-absent. Returns `true` if the fact was new.
    async fn put_fact(&self, fact: Fact) -> StoreResult<bool>;

    async fn facts_for_document(
        &self,
        document_id: DocumentId,
        family: FactFamily,
    ) -> StoreResult<Vec<Fact>>;

    /// Facts whose subject reference is already resolved to `subject`.
    async fn facts_for_subject(&self, subject: SubjectId, family: FactFamily) -> StoreResult<Vec<Fact>>;
}

fn not_found(entity: &'static str, id: impl ToString) -> StoreError {
    StoreError::NotFound {
        entity,
        id: id.to_string(),
    }
}

/// In-process [`RecordStore`] over concurrent maps.
#[derive(Debug, Default)]
pub struct InMemoryRecordStore {
    documents: DashMap<DocumentId, Document>,
    subjects: DashMap<SubjectId, Subject>,
    pages: DashMap<PageId, Page>,
    page_index: DashMap<(DocumentId, u32), PageId>,
    tags: DashMap<TagId, CategoryTag>,
    facts: DashMap<FactId, Fact>,
    counted: DashMap<(DocumentId, Counter, u32), ()>,
    skipped: DashMap<(DocumentId, u32), ()>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_facts(mut facts: Vec<Fact>) -> Vec<Fact> {
        facts.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(&b.id()))
        });
        facts
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn create_document(&self, document: Document) -> StoreResult<bool> {
        match self.documents.entry(document.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(document);
                Ok(true)
            }
        }
    }

    async fn get_document(&self, id: DocumentId) -> StoreResult<Document> {
        self.documents
            .get(&id)
            .map(|d| d.clone())
            .ok_or_else(|| not_found("document", id))
    }

    async fn list_documents(&self) -> StoreResult<Vec<Document>> {
        let mut docs: Vec<Document> = self.documents.iter().map(|d| d.clone()).collect();
        docs.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn advance_status(&self, id: DocumentId, to: DocumentStatus) -> StoreResult<DocumentStatus> {
        let mut doc = self
            .documents
            .get_mut(&id)
            .ok_or_else(|| not_found("document", id))?;
        if to > doc.status {
            doc.status = to;
        }
        Ok(doc.status)
    }

    async fn count_page(&self, id: DocumentId, ordinal: u32, counter: Counter) -> StoreResult<PageCount> {
        // The document guard is held across the marker check.
        let mut doc = self
            .documents
            .get_mut(&id)
            .ok_or_else(|| not_found("document", id))?;
        let slot = match counter {
            Counter::PagesConverted => &mut doc.pages_converted,
            Counter::PagesProcessed => &mut doc.pages_processed,
        };
        let newly_counted = match self.counted.entry((id, counter, ordinal)) {
            Entry::Occupied(_) => false,
            Entry::Vacant(marker) => {
                marker.insert(());
                *slot = slot.saturating_add(1);
                true
            }
        };
        Ok(PageCount {
            value: *slot,
            newly_counted,
        })
    }

    async fn mark_skipped(&self, id: DocumentId, ordinal: u32) -> StoreResult<bool> {
        if !self.documents.contains_key(&id) {
            return Err(not_found("document", id));
        }
        Ok(self.skipped.insert((id, ordinal), ()).is_none())
    }

    async fn skipped_ordinals(&self, id: DocumentId) -> StoreResult<Vec<u32>> {
        let mut ordinals: Vec<u32> = self
            .skipped
            .iter()
            .filter(|entry| entry.key().0 == id)
            .map(|entry| entry.key().1)
            .collect();
        ordinals.sort_unstable();
        Ok(ordinals)
    }

    async fn attach_subject(&self, subject: Subject) -> StoreResult<SubjectId> {
        // The document guard serialises concurrent attaches for one document.
        let mut doc = self
            .documents
            .get_mut(&subject.document_id)
            .ok_or_else(|| not_found("document", subject.document_id))?;
        if let SubjectRef::Resolved(existing) = doc.subject {
            return Ok(existing);
        }
        let id = subject.id;
        self.subjects.entry(id).or_insert(subject);
        doc.subject = SubjectRef::Resolved(id);
        Ok(id)
    }

    async fn get_subject(&self, id: SubjectId) -> StoreResult<Subject> {
        self.subjects
            .get(&id)
            .map(|s| s.clone())
            .ok_or_else(|| not_found("subject", id))
    }

    async fn list_subjects(&self) -> StoreResult<Vec<Subject>> {
        let mut subjects: Vec<Subject> = self.subjects.iter().map(|s| s.clone()).collect();
        subjects.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(subjects)
    }

    async fn documents_for_subject(&self, id: SubjectId) -> StoreResult<Vec<Document>> {
        let mut docs: Vec<Document> = self
            .documents
            .iter()
            .filter(|d| d.subject == SubjectRef::Resolved(id))
            .map(|d| d.clone())
            .collect();
        docs.sort_by(|a, b| a.uploaded_at.cmp(&b.uploaded_at).then(a.id.cmp(&b.id)));
        Ok(docs)
    }

    async fn create_page(&self, page: Page) -> StoreResult<PageInsert> {
        match self.page_index.entry((page.document_id, page.ordinal)) {
            Entry::Occupied(existing) => {
                let id = *existing.get();
                let page = self
                    .pages
                    .get(&id)
                    .map(|p| p.clone())
                    .ok_or_else(|| not_found("page", id))?;
                Ok(PageInsert::Existing(page))
            }
            Entry::Vacant(slot) => {
                slot.insert(page.id);
                self.pages.insert(page.id, page);
                Ok(PageInsert::Created)
            }
        }
    }

    async fn get_page(&self, id: PageId) -> StoreResult<Page> {
        self.pages
            .get(&id)
            .map(|p| p.clone())
            .ok_or_else(|| not_found("page", id))
    }

    async fn find_page(&self, document_id: DocumentId, ordinal: u32) -> StoreResult<Option<Page>> {
        let Some(id) = self.page_index.get(&(document_id, ordinal)).map(|i| *i) else {
            return Ok(None);
        };
        Ok(self.pages.get(&id).map(|p| p.clone()))
    }

    async fn pages_for_document(&self, document_id: DocumentId) -> StoreResult<Vec<Page>> {
        let mut pages: Vec<Page> = self
            .pages
            .iter()
            .filter(|p| p.document_id == document_id)
            .map(|p| p.clone())
            .collect();
        pages.sort_by_key(|p| p.ordinal);
        Ok(pages)
    }

    async fn transition_page(&self, id: PageId, transition: PageTransition) -> StoreResult<bool> {
        let mut page = self
            .pages
            .get_mut(&id)
            .ok_or_else(|| not_found("page", id))?;
        if page.status.is_terminal() {
            return Ok(false);
        }
        match transition {
            PageTransition::Processed {
                categories,
                diagnostic,
            } => {
                page.status = PageStatus::Processed;
                page.categories = categories;
                page.diagnostic = diagnostic;
            }
            PageTransition::Failed { reason } => {
                page.status = PageStatus::Error;
                page.error = Some(reason);
            }
        }
        Ok(true)
    }

    async fn put_category(&self, tag: CategoryTag) -> StoreResult<bool> {
        match self.tags.entry(tag.id) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(tag);
                Ok(true)
            }
        }
    }

    async fn categories_for_page(&self, page_id: PageId) -> StoreResult<Vec<CategoryTag>> {
        let mut tags: Vec<CategoryTag> = self
            .tags
            .iter()
            .filter(|t| t.page_id == page_id)
            .map(|t| t.clone())
            .collect();
        tags.sort_by(|a, b| a.label.as_str().cmp(b.label.as_str()).then(a.id.cmp(&b.id)));
        Ok(tags)
    }

    async fn put_fact(&self, fact: Fact) -> StoreResult<bool> {
        match self.facts.entry(fact.id()) {
            Entry::Occupied(_) => Ok(false),
            Entry::Vacant(slot) => {
                slot.insert(fact);
                Ok(true)
            }
        }
    }

    async fn facts_for_document(
        &self,
        document_id: DocumentId,
        family: FactFamily,
    ) -> StoreResult<Vec<Fact>> {
        let facts = self
            .facts
            .iter()
            .filter(|f| f.document_id() == document_id && f.family() == family)
            .map(|f| f.clone())
            .collect();
        Ok(Self::sorted_facts(facts))
    }

    async fn facts_for_subject(&self, subject: SubjectId, family: FactFamily) -> StoreResult<Vec<Fact>> {
        let facts = self
            .facts
            .iter()
            .filter(|f| f.subject() == SubjectRef::Resolved(subject) && f.family() == family)
            .map(|f| f.clone())
            .collect();
        Ok(Self::sorted_facts(facts))
    }
}
