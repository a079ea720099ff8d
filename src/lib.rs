//! # medingest
//!
//! Queue-driven ingestion of multi-page medical documents into structured
//! records using a vision LLM.
//!
//! ## Why this crate?
//!
//! Scanned records, lab reports and discharge summaries arrive as PDFs whose
//! text layer is missing or garbled. Instead of text extraction this crate
//! rasterises each page and lets a vision model read it, returning the
//! patient, page categories, medications, diagnoses and test results as
//! typed records. Pages are independent units of work, so a 300-page upload
//! fans out across as many workers as the queue substrate provides.
//!
//! ## Pipeline Overview
//!
//! ```text
//! upload
//!  │
//!  ├─ 1. Intake      canonical copy, page count (with fallbacks), Document record,
//!  │                 one conversion item per page
//!  ├─ 2. Conversion  render at 144 DPI → PNG + JPEG under the payload ceiling,
//!  │                 Page record, one extraction item
//!  └─ 3. Extraction  vision call with throttling-only backoff, lenient JSON parse,
//!                    Subject / CategoryTag / fact records, page PROCESSED
//! ```
//!
//! Every stage takes a [`Backends`] bundle (object store, two queues, record
//! store, inference client, rasterizer) by reference; nothing is global.
//! [`query::QueryService`] reads the results back without write access.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use medingest::backend::{Backends, LlmInference, ObjectStore};
//! use medingest::model::ObjectLocation;
//! use medingest::pipeline::render::PdfiumRasterizer;
//! use medingest::{Pipeline, PipelineConfig, Upload};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = PipelineConfig::default();
//!     let inference = Arc::new(LlmInference::from_config(&config)?);
//!     let backends = Backends::in_memory(inference, Arc::new(PdfiumRasterizer::new()));
//!
//!     let location = ObjectLocation::new("uploads", "AlexDoe_Records.pdf");
//!     let bytes = std::fs::read("AlexDoe_Records.pdf")?;
//!     backends.objects.put(&location, bytes, "application/pdf").await?;
//!
//!     let pipeline = Pipeline::new(backends, config);
//!     let intake = pipeline.ingest(&Upload::new(location)).await?;
//!     pipeline.drain().await?;
//!
//!     let progress = pipeline.query().document_progress(intake.document.id).await?;
//!     eprintln!("{}/{} pages done", progress.actual_processed, progress.total_pages);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `medingest` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when embedding the stages in your own workers:
//! ```toml
//! medingest = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod backend;
pub mod config;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod query;
pub mod work;
pub mod worker;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use backend::Backends;
pub use config::{PipelineConfig, PipelineConfigBuilder, StorageLayout};
pub use error::{InferenceError, PageError, PipelineError};
pub use pipeline::encode::CompressionPolicy;
pub use pipeline::intake::{IntakeReport, Upload};
pub use pipeline::retry::RetryPolicy;
pub use progress::{NoopObserver, PipelineObserver};
pub use query::{DocumentProgress, QueryService, Reconciliation};
pub use work::{ExtractionWork, PageWork, Stage};
pub use worker::{drain, DrainReport, Pipeline};
