//! Progress-callback trait for per-page pipeline events.
//!
//! Inject an [`Arc<dyn PipelineObserver>`] via
//! [`crate::config::PipelineConfigBuilder::observer`] to receive events as
//! workers finish pages. Stages call these hooks after the corresponding
//! record-store write succeeded, so an observer never sees a page the store
//! does not know about.
//!
//! Observers are advisory. The store's counters and page statuses remain the
//! source of truth (see [`crate::query`]).
//!
//! # Example
//!
//! ```rust
//! use medingest::{PipelineConfig, PipelineObserver};
//! use medingest::model::DocumentId;
//! use std::sync::{Arc, atomic::{AtomicUsize, Ordering}};
//!
//! struct Counting(AtomicUsize);
//!
//! impl PipelineObserver for Counting {
//!     fn on_page_processed(&self, _doc: DocumentId, ordinal: u32, total: u32, facts: usize) {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         eprintln!("page {ordinal}/{total}: {facts} facts");
//!     }
//! }
//!
//! let config = PipelineConfig::builder()
//!     .observer(Arc::new(Counting(AtomicUsize::new(0))))
//!     .build()
//!     .unwrap();
//! ```

use crate::model::DocumentId;
use crate::work::Stage;
use std::sync::Arc;
use std::time::Duration;

/// Called by the stages as they process work items.
///
/// Implementations must be `Send + Sync`: many workers report concurrently.
/// All methods default to no-ops.
pub trait PipelineObserver: Send + Sync {
    /// Intake registered a document and enqueued its pages.
    fn on_document_registered(&self, document_id: DocumentId, total_pages: u32) {
        let _ = (document_id, total_pages);
    }

    /// Conversion stored both renditions of a page.
    fn on_page_converted(&self, document_id: DocumentId, ordinal: u32, total_pages: u32) {
        let _ = (document_id, ordinal, total_pages);
    }

    /// Extraction marked a page `PROCESSED`.
    ///
    /// `facts` counts records written across all three fact families.
    fn on_page_processed(&self, document_id: DocumentId, ordinal: u32, total_pages: u32, facts: usize) {
        let _ = (document_id, ordinal, total_pages, facts);
    }

    /// A page was marked `ERROR` by `stage`.
    fn on_page_error(&self, document_id: DocumentId, ordinal: u32, stage: Stage, error: &str) {
        let _ = (document_id, ordinal, stage, error);
    }

    /// An inference call was throttled and will be retried after `delay`.
    fn on_throttled(&self, document_id: DocumentId, ordinal: u32, attempt: u32, delay: Duration) {
        let _ = (document_id, ordinal, attempt, delay);
    }
}

/// A no-op observer.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Convenience alias matching the type stored in [`crate::config::PipelineConfig`].
pub type SharedObserver = Arc<dyn PipelineObserver>;
