//! Records persisted by the pipeline: documents, pages, subjects, category
//! tags and the three fact families.
//!
//! ## Identities
//!
//! Every identity is a UUID, and every one except the upload-level
//! [`DocumentId`] is *derived* (UUIDv5) from its parent and position:
//!
//! | id | derived from |
//! |----|--------------|
//! | [`DocumentId`] | upload event key |
//! | [`PageId`]     | document id + ordinal |
//! | [`SubjectId`]  | document id |
//! | [`FactId`]     | page id + family + index in the model response |
//! | [`TagId`]      | page id + index in the model response |
//!
//! A redelivered work item therefore computes the same ids as the first
//! delivery, and put-if-absent writes in the record store collapse the
//! duplicates.
//!
//! ## Unknown values
//!
//! Extracted attributes are [`Attribute`]s, which default to the literal
//! `"Unknown"` instead of being absent. Cross-entity references that may not
//! exist yet use [`SubjectRef::Pending`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Namespace for upload-derived document ids.
const UPLOAD_NAMESPACE: Uuid = Uuid::from_u128(0x6d65_6469_6e67_6573_7400_0000_0000_0001);

/// Sentinel stored for any attribute the model could not read.
pub const UNKNOWN: &str = "Unknown";

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }
    };
}

record_id!(
    /// Identity of one uploaded document.
    DocumentId
);
record_id!(
    /// Identity of one page of a document.
    PageId
);
record_id!(
    /// Identity of the subject a document describes.
    SubjectId
);
record_id!(
    /// Identity of one fact record.
    FactId
);
record_id!(
    /// Identity of one category tag.
    TagId
);

impl DocumentId {
    /// Derive the document id for an upload event.
    ///
    /// The same event key always yields the same id, so a redelivered upload
    /// notification lands on the existing document.
    pub fn for_upload(event_key: &str) -> Self {
        Self(Uuid::new_v5(&UPLOAD_NAMESPACE, event_key.as_bytes()))
    }
}

impl PageId {
    pub fn for_ordinal(document_id: DocumentId, ordinal: u32) -> Self {
        Self(Uuid::new_v5(&document_id.0, format!("page:{ordinal}").as_bytes()))
    }
}

impl SubjectId {
    pub fn for_document(document_id: DocumentId) -> Self {
        Self(Uuid::new_v5(&document_id.0, b"subject"))
    }
}

impl FactId {
    pub fn for_position(page_id: PageId, family: FactFamily, index: usize) -> Self {
        Self(Uuid::new_v5(
            &page_id.0,
            format!("{}:{index}", family.as_str()).as_bytes(),
        ))
    }
}

impl TagId {
    pub fn for_position(page_id: PageId, index: usize) -> Self {
        Self(Uuid::new_v5(&page_id.0, format!("category:{index}").as_bytes()))
    }
}

// ── Locations ────────────────────────────────────────────────────────────

/// A blob address in object storage.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectLocation {
    pub bucket: String,
    pub key: String,
}

impl ObjectLocation {
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for ObjectLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// The two renditions produced for every page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EncodingKind {
    /// PNG, archival quality.
    Lossless,
    /// JPEG, bounded by the inference payload ceiling.
    Lossy,
}

impl EncodingKind {
    pub fn extension(&self) -> &'static str {
        match self {
            EncodingKind::Lossless => "png",
            EncodingKind::Lossy => "jpg",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            EncodingKind::Lossless => "image/png",
            EncodingKind::Lossy => "image/jpeg",
        }
    }
}

/// One stored encoding of a page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rendition {
    pub kind: EncodingKind,
    pub location: ObjectLocation,
    pub bytes: usize,
}

// ── Status ───────────────────────────────────────────────────────────────

/// Document lifecycle. Variants are ordered; a document only moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DocumentStatus {
    Uploaded,
    Converting,
    Converted,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PageStatus {
    Converted,
    Processed,
    Error,
}

impl PageStatus {
    /// `PROCESSED` and `ERROR` are final; nothing in the pipeline moves a
    /// page out of them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, PageStatus::Processed | PageStatus::Error)
    }
}

/// The per-document counters that workers increment concurrently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Counter {
    /// Pages whose renditions were stored.
    PagesConverted,
    /// Pages that reached `PROCESSED` or `ERROR`.
    PagesProcessed,
}

/// How the document's page count was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageCountSource {
    /// Parsed by the PDF engine.
    Parsed,
    /// Counted from raw `/Type /Page` objects.
    Structural,
    /// Estimated from the byte size.
    Estimated,
}

/// Reference to a subject that may not have been extracted yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "state", content = "id", rename_all = "snake_case")]
pub enum SubjectRef {
    /// Not known at write time. Eventually resolvable through the owning
    /// document; never means "no subject".
    #[default]
    Pending,
    Resolved(SubjectId),
}

impl SubjectRef {
    pub fn resolved(&self) -> Option<SubjectId> {
        match self {
            SubjectRef::Pending => None,
            SubjectRef::Resolved(id) => Some(*id),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub filename: String,
    /// Canonical long-term copy of the upload.
    pub source: ObjectLocation,
    pub total_pages: u32,
    pub page_count_source: PageCountSource,
    pub status: DocumentStatus,
    pub pages_converted: u32,
    pub pages_processed: u32,
    pub subject: SubjectRef,
    /// Name fragment from the upload filename (`AlexDoe_Records.pdf` → `AlexDoe`).
    pub subject_hint: Option<String>,
    pub uploaded_at: DateTime<Utc>,
}

impl Document {
    pub fn counter(&self, counter: Counter) -> u32 {
        match counter {
            Counter::PagesConverted => self.pages_converted,
            Counter::PagesProcessed => self.pages_processed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub id: PageId,
    pub document_id: DocumentId,
    /// 1-based position in the document.
    pub ordinal: u32,
    pub renditions: Vec<Rendition>,
    pub status: PageStatus,
    pub categories: Vec<CategoryLabel>,
    /// Terminal failure reason when `status` is `ERROR`.
    pub error: Option<String>,
    /// Non-fatal note, e.g. the model response could not be parsed.
    pub diagnostic: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Page {
    pub fn rendition(&self, kind: EncodingKind) -> Option<&Rendition> {
        self.renditions.iter().find(|r| r.kind == kind)
    }
}

/// A state change applied to an existing page by the extraction stage.
#[derive(Debug, Clone, PartialEq)]
pub enum PageTransition {
    Processed {
        categories: Vec<CategoryLabel>,
        diagnostic: Option<String>,
    },
    Failed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    pub document_id: DocumentId,
    #[serde(flatten)]
    pub attributes: SubjectAttributes,
    pub created_at: DateTime<Utc>,
}

// ── Attributes ───────────────────────────────────────────────────────────

/// An extracted scalar. Missing, null and blank values read as `"Unknown"`;
/// numbers and booleans are kept as their JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Attribute(String);

impl Attribute {
    pub fn unknown() -> Self {
        Self(UNKNOWN.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_known(&self) -> bool {
        let v = self.0.trim();
        !v.is_empty() && !v.eq_ignore_ascii_case(UNKNOWN) && !v.eq_ignore_ascii_case("n/a")
    }
}

impl Default for Attribute {
    fn default() -> Self {
        Self::unknown()
    }
}

impl From<&str> for Attribute {
    fn from(value: &str) -> Self {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            Self::unknown()
        } else {
            Self(trimmed.to_string())
        }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Attribute {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(s) => Attribute::from(s.as_str()),
            serde_json::Value::Null => Attribute::unknown(),
            serde_json::Value::Bool(b) => Attribute(b.to_string()),
            serde_json::Value::Number(n) => Attribute(n.to_string()),
            other => Attribute::from(other.to_string().as_str()),
        })
    }
}

/// Demographics read from the document's first page.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubjectAttributes {
    pub first_name: Attribute,
    pub last_name: Attribute,
    pub date_of_birth: Attribute,
    pub ssn: Attribute,
    pub mrn: Attribute,
    pub medical_facility: Attribute,
    pub gender: Attribute,
    pub blood_type: Attribute,
    pub email: Attribute,
    pub phone_number: Attribute,
    pub address_line1: Attribute,
    pub city: Attribute,
    pub state: Attribute,
    pub postal_code: Attribute,
    pub country: Attribute,
    pub emergency_contact_name: Attribute,
    pub emergency_contact_phone: Attribute,
    pub allergies: Attribute,
    pub document_date: Attribute,
}

impl SubjectAttributes {
    /// A subject is worth storing once at least one identifying attribute
    /// was read.
    pub fn is_populated(&self) -> bool {
        [
            &self.first_name,
            &self.last_name,
            &self.mrn,
            &self.date_of_birth,
        ]
        .iter()
        .any(|a| a.is_known())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Medication {
    pub name: Attribute,
    pub dosage: Attribute,
    pub frequency: Attribute,
    pub start_date: Attribute,
    pub is_current: Attribute,
    pub notes: Attribute,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Diagnosis {
    pub description: Attribute,
    pub code: Attribute,
    pub diagnosed_date: Attribute,
    pub is_current: Attribute,
    pub doctor_first_name: Attribute,
    pub doctor_last_name: Attribute,
    pub facility: Attribute,
    pub notes: Attribute,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TestResult {
    pub name: Attribute,
    pub date: Attribute,
    pub value: Attribute,
    pub unit: Attribute,
    pub is_abnormal: Attribute,
    pub normal_range_low: Attribute,
    pub normal_range_high: Attribute,
    pub notes: Attribute,
}

// ── Facts ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactFamily {
    Medication,
    Diagnosis,
    TestResult,
}

impl FactFamily {
    pub const ALL: [FactFamily; 3] = [
        FactFamily::Medication,
        FactFamily::Diagnosis,
        FactFamily::TestResult,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FactFamily::Medication => "medication",
            FactFamily::Diagnosis => "diagnosis",
            FactFamily::TestResult => "test_result",
        }
    }
}

/// Envelope shared by every fact family. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord<T> {
    pub id: FactId,
    pub subject: SubjectRef,
    pub document_id: DocumentId,
    pub page_id: PageId,
    pub created_at: DateTime<Utc>,
    #[serde(flatten)]
    pub attributes: T,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum Fact {
    Medication(FactRecord<Medication>),
    Diagnosis(FactRecord<Diagnosis>),
    TestResult(FactRecord<TestResult>),
}

impl Fact {
    pub fn family(&self) -> FactFamily {
        match self {
            Fact::Medication(_) => FactFamily::Medication,
            Fact::Diagnosis(_) => FactFamily::Diagnosis,
            Fact::TestResult(_) => FactFamily::TestResult,
        }
    }

    pub fn id(&self) -> FactId {
        match self {
            Fact::Medication(r) => r.id,
            Fact::Diagnosis(r) => r.id,
            Fact::TestResult(r) => r.id,
        }
    }

    pub fn subject(&self) -> SubjectRef {
        match self {
            Fact::Medication(r) => r.subject,
            Fact::Diagnosis(r) => r.subject,
            Fact::TestResult(r) => r.subject,
        }
    }

    pub fn document_id(&self) -> DocumentId {
        match self {
            Fact::Medication(r) => r.document_id,
            Fact::Diagnosis(r) => r.document_id,
            Fact::TestResult(r) => r.document_id,
        }
    }

    pub fn page_id(&self) -> PageId {
        match self {
            Fact::Medication(r) => r.page_id,
            Fact::Diagnosis(r) => r.page_id,
            Fact::TestResult(r) => r.page_id,
        }
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Fact::Medication(r) => r.created_at,
            Fact::Diagnosis(r) => r.created_at,
            Fact::TestResult(r) => r.created_at,
        }
    }

    /// Copy with a `Pending` subject reference replaced by `subject`.
    /// Resolved references are left alone.
    pub fn resolved_to(mut self, subject: SubjectId) -> Self {
        let slot = match &mut self {
            Fact::Medication(r) => &mut r.subject,
            Fact::Diagnosis(r) => &mut r.subject,
            Fact::TestResult(r) => &mut r.subject,
        };
        if *slot == SubjectRef::Pending {
            *slot = SubjectRef::Resolved(subject);
        }
        self
    }
}

// ── Categories ───────────────────────────────────────────────────────────

/// Controlled page-category vocabulary. Anything else becomes [`CategoryLabel::Other`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CategoryLabel {
    Cardiology,
    Dermatology,
    #[serde(rename = "Emergency Medicine")]
    EmergencyMedicine,
    Endocrinology,
    Gastroenterology,
    Hematology,
    Hospitalization,
    #[serde(rename = "Internal Medicine")]
    InternalMedicine,
    Laboratories,
    Neurology,
    Oncology,
    Orthopedics,
    Pathology,
    Radiology,
    Surgery,
    Other,
}

impl CategoryLabel {
    pub const VOCABULARY: [CategoryLabel; 16] = [
        CategoryLabel::Cardiology,
        CategoryLabel::Dermatology,
        CategoryLabel::EmergencyMedicine,
        CategoryLabel::Endocrinology,
        CategoryLabel::Gastroenterology,
        CategoryLabel::Hematology,
        CategoryLabel::Hospitalization,
        CategoryLabel::InternalMedicine,
        CategoryLabel::Laboratories,
        CategoryLabel::Neurology,
        CategoryLabel::Oncology,
        CategoryLabel::Orthopedics,
        CategoryLabel::Pathology,
        CategoryLabel::Radiology,
        CategoryLabel::Surgery,
        CategoryLabel::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CategoryLabel::Cardiology => "Cardiology",
            CategoryLabel::Dermatology => "Dermatology",
            CategoryLabel::EmergencyMedicine => "Emergency Medicine",
            CategoryLabel::Endocrinology => "Endocrinology",
            CategoryLabel::Gastroenterology => "Gastroenterology",
            CategoryLabel::Hematology => "Hematology",
            CategoryLabel::Hospitalization => "Hospitalization",
            CategoryLabel::InternalMedicine => "Internal Medicine",
            CategoryLabel::Laboratories => "Laboratories",
            CategoryLabel::Neurology => "Neurology",
            CategoryLabel::Oncology => "Oncology",
            CategoryLabel::Orthopedics => "Orthopedics",
            CategoryLabel::Pathology => "Pathology",
            CategoryLabel::Radiology => "Radiology",
            CategoryLabel::Surgery => "Surgery",
            CategoryLabel::Other => "Other",
        }
    }

    /// Case- and whitespace-insensitive lookup. Returns `None` for labels
    /// outside the vocabulary.
    pub fn parse(label: &str) -> Option<Self> {
        let wanted: String = label
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_lowercase();
        Self::VOCABULARY
            .into_iter()
            .find(|c| c.as_str().to_lowercase() == wanted)
    }
}

impl fmt::Display for CategoryLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryTag {
    pub id: TagId,
    pub page_id: PageId,
    pub label: CategoryLabel,
    pub justification: String,
}
