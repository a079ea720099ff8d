//! External collaborators of the pipeline and their in-process implementations.
//!
//! The stages never talk to storage, queues or the model directly; they go
//! through the traits defined here:
//!
//! | trait | contract |
//! |-------|----------|
//! | [`ObjectStore`]    | put/get/copy of blobs by (bucket, key) |
//! | [`WorkQueue`]      | grouped FIFO delivery with dedup tokens, at-least-once |
//! | [`RecordStore`]    | point lookups, foreign-key queries, atomic counters |
//! | [`InferenceClient`]| one image + instruction in, text out, distinguishable throttling |
//!
//! [`Backends`] bundles one handle to each. A worker process builds it once
//! and passes it by reference into every stage entry point.

pub mod inference;
pub mod object_store;
pub mod queue;
pub mod record_store;

pub use inference::{ImagePayload, InferenceClient, InferenceReply, InferenceRequest, LlmInference};
pub use object_store::{InMemoryObjectStore, LocalObjectStore, ObjectStore};
pub use queue::{Delivery, InMemoryQueue, PublishOutcome, QueueDepth, QueueMessage, WorkQueue};
pub use record_store::{InMemoryRecordStore, PageCount, PageInsert, RecordStore, StoreResult};

use crate::pipeline::render::PageRasterizer;
use std::sync::Arc;

/// Client handles shared by all stages of one worker process.
#[derive(Clone)]
pub struct Backends {
    pub objects: Arc<dyn ObjectStore>,
    /// Carries [`crate::work::PageWork`] items from intake to conversion.
    pub conversion_queue: Arc<dyn WorkQueue>,
    /// Carries [`crate::work::ExtractionWork`] items from conversion to extraction.
    pub extraction_queue: Arc<dyn WorkQueue>,
    pub records: Arc<dyn RecordStore>,
    pub inference: Arc<dyn InferenceClient>,
    pub rasterizer: Arc<dyn PageRasterizer>,
}

impl Backends {
    /// Fully in-process backends around the given model and rasterizer.
    pub fn in_memory(
        inference: Arc<dyn InferenceClient>,
        rasterizer: Arc<dyn PageRasterizer>,
    ) -> Self {
        Self {
            objects: Arc::new(InMemoryObjectStore::new()),
            conversion_queue: Arc::new(InMemoryQueue::new("conversion")),
            extraction_queue: Arc::new(InMemoryQueue::new("extraction")),
            records: Arc::new(InMemoryRecordStore::new()),
            inference,
            rasterizer,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
