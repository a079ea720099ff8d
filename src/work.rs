//! Work items carried between stages on the queues.
//!
//! A work item holds everything its stage needs (document id, storage
//! pointers, ordinal, total count) so a worker never has to look the
//! document up before starting.
//!
//! Each item publishes with:
//! * a **group key** unique per page, so the queue may hand pages of the
//!   same document to different workers at the same time;
//! * a **dedup token** of document id + ordinal + stage, so repeated
//!   publishes of the same logical item collapse inside the queue's
//!   deduplication window.

use crate::backend::QueueMessage;
use crate::error::{PipelineError, QueueError};
use crate::model::{DocumentId, ObjectLocation, PageId, Rendition};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Pipeline stage names, used in dedup tokens and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intake,
    Conversion,
    Extraction,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Intake => "intake",
            Stage::Conversion => "conversion",
            Stage::Extraction => "extraction",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue group for one page. One group per page maximises parallelism.
pub fn group_key(document_id: DocumentId, ordinal: u32) -> String {
    format!("{document_id}-{ordinal:04}")
}

/// Deduplication token for one page at one stage.
pub fn dedup_token(document_id: DocumentId, ordinal: u32, stage: Stage) -> String {
    format!("{document_id}-{ordinal:04}-{stage}")
}

/// Common behaviour of the messages each stage consumes.
pub trait WorkItem: Serialize + DeserializeOwned + Send + Sync {
    /// The stage that consumes this item.
    const STAGE: Stage;

    fn document_id(&self) -> DocumentId;

    fn ordinal(&self) -> u32;

    fn group_key(&self) -> String {
        group_key(self.document_id(), self.ordinal())
    }

    fn dedup_token(&self) -> String {
        dedup_token(self.document_id(), self.ordinal(), Self::STAGE)
    }

    /// Serialise into a queue message.
    fn to_message(&self) -> Result<QueueMessage, QueueError> {
        Ok(QueueMessage {
            group_key: self.group_key(),
            dedup_token: self.dedup_token(),
            body: serde_json::to_string(self)?,
        })
    }

    /// Decode a delivered message body.
    fn from_body(body: &str) -> Result<Self, PipelineError> {
        serde_json::from_str(body).map_err(|e| PipelineError::MalformedWorkItem {
            stage: Self::STAGE,
            detail: e.to_string(),
        })
    }
}

/// Render one page. Emitted by intake, consumed by conversion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageWork {
    pub document_id: DocumentId,
    pub source: ObjectLocation,
    pub filename: String,
    /// 1-based.
    pub ordinal: u32,
    pub total_pages: u32,
}

impl WorkItem for PageWork {
    const STAGE: Stage = Stage::Conversion;

    fn document_id(&self) -> DocumentId {
        self.document_id
    }

    fn ordinal(&self) -> u32 {
        self.ordinal
    }
}

/// Extract records from one converted page. Emitted by conversion,
/// consumed by extraction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionWork {
    pub document_id: DocumentId,
    pub page_id: PageId,
    pub ordinal: u32,
    pub total_pages: u32,
    pub lossless: Rendition,
    pub lossy: Rendition,
}

impl ExtractionWork {
    /// Pages with this ordinal also carry the subject-attribute request.
    pub const SUBJECT_ORDINAL: u32 = 1;

    pub fn is_subject_page(&self) -> bool {
        self.ordinal == Self::SUBJECT_ORDINAL
    }
}

impl WorkItem for ExtractionWork {
    const STAGE: Stage = Stage::Extraction;

    fn document_id(&self) -> DocumentId {
        self.document_id
    }

    fn ordinal(&self) -> u32 {
        self.ordinal
    }
}
