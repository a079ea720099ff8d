//! Queue-driven dispatch: receive → stage entry point → ack/nack.
//!
//! Each delivery is settled in exactly one of three ways:
//!
//! | stage result | queue action | [`Disposition`] |
//! |--------------|--------------|-----------------|
//! | `Ok(_)` (including pages recorded as `ERROR`) | ack | `Completed` |
//! | `Err(e)` with `e.is_redeliverable()` | nack after `redelivery_delay` | `Redelivered` |
//! | any other `Err` | ack | `Dropped` |
//!
//! Escalated throttling lands in the second row, so the queue's own
//! redelivery is the outer retry tier behind the local backoff.
//!
//! [`drain`] runs both stages in-process until neither queue has work left.
//! Deployments that hand deliveries to short-lived workers call
//! [`handle_conversion`] / [`handle_extraction`] directly instead.

use crate::backend::{Backends, Delivery, WorkQueue};
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::pipeline::convert::{self, ConversionOutcome};
use crate::pipeline::extract::{self, ExtractionOutcome};
use crate::pipeline::intake::{self, IntakeReport, Upload};
use crate::query::QueryService;
use crate::work::{ExtractionWork, PageWork, Stage, WorkItem};
use futures::stream::{self, StreamExt};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Interval between depth checks while only delayed redeliveries remain.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// How a delivery was settled with its queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    Redelivered,
    Dropped,
}

/// Totals from one [`drain`] run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub conversions: usize,
    pub extractions: usize,
    pub redelivered: usize,
    pub dropped: usize,
    /// Messages sitting in either dead-letter list when the drain finished.
    pub dead_lettered: usize,
}

impl DrainReport {
    fn record(&mut self, stage: Stage, disposition: Disposition) {
        match (stage, disposition) {
            (_, Disposition::Redelivered) => self.redelivered += 1,
            (_, Disposition::Dropped) => self.dropped += 1,
            (Stage::Extraction, Disposition::Completed) => self.extractions += 1,
            (_, Disposition::Completed) => self.conversions += 1,
        }
    }
}

/// Run one conversion delivery and settle it on the conversion queue.
pub async fn handle_conversion(
    backends: &Backends,
    config: &PipelineConfig,
    delivery: &Delivery,
) -> Result<Disposition, PipelineError> {
    let result = match PageWork::from_body(&delivery.message.body) {
        Ok(item) => convert::convert_page(backends, config, &item).await.map(|outcome| {
            if let ConversionOutcome::Failed(ref e) = outcome {
                debug!("Conversion recorded page error: {}", e);
            }
        }),
        Err(e) => Err(e),
    };
    settle(backends.conversion_queue.as_ref(), config, delivery, result).await
}

/// Run one extraction delivery and settle it on the extraction queue.
pub async fn handle_extraction(
    backends: &Backends,
    config: &PipelineConfig,
    delivery: &Delivery,
) -> Result<Disposition, PipelineError> {
    let result = match ExtractionWork::from_body(&delivery.message.body) {
        Ok(item) => extract::extract_page(backends, config, &item).await.map(|outcome| {
            if let ExtractionOutcome::Failed(ref e) = outcome {
                debug!("Extraction recorded page error: {}", e);
            }
        }),
        Err(e) => Err(e),
    };
    settle(backends.extraction_queue.as_ref(), config, delivery, result).await
}

async fn settle(
    queue: &dyn WorkQueue,
    config: &PipelineConfig,
    delivery: &Delivery,
    result: Result<(), PipelineError>,
) -> Result<Disposition, PipelineError> {
    match result {
        Ok(()) => {
            queue.ack(&delivery.receipt).await?;
            Ok(Disposition::Completed)
        }
        Err(e) if e.is_redeliverable() => {
            warn!(
                "{} failed (delivery {}), redelivering in {:?}: {}",
                delivery.message.dedup_token,
                delivery.receive_count,
                config.redelivery_delay(),
                e
            );
            queue.nack(&delivery.receipt, config.redelivery_delay()).await?;
            Ok(Disposition::Redelivered)
        }
        Err(e) => {
            error!("Dropping {}: {}", delivery.message.dedup_token, e);
            queue.ack(&delivery.receipt).await?;
            Ok(Disposition::Dropped)
        }
    }
}

async fn handle(
    backends: &Backends,
    config: &PipelineConfig,
    stage: Stage,
    delivery: Delivery,
) -> (Stage, Result<Disposition, PipelineError>) {
    let result = match stage {
        Stage::Extraction => handle_extraction(backends, config, &delivery).await,
        _ => handle_conversion(backends, config, &delivery).await,
    };
    (stage, result)
}

/// Process both queues until nothing is visible, delayed or in flight.
///
/// Up to `config.concurrency` deliveries run at once. Errors from a stage are
/// settled on the queue; only a failure to ack or nack is returned.
pub async fn drain(backends: &Backends, config: &PipelineConfig) -> Result<DrainReport, PipelineError> {
    let mut report = DrainReport::default();

    loop {
        let mut batch: Vec<(Stage, Delivery)> = backends
            .extraction_queue
            .receive(config.concurrency)
            .await?
            .into_iter()
            .map(|d| (Stage::Extraction, d))
            .collect();
        let room = config.concurrency.saturating_sub(batch.len()).max(1);
        batch.extend(
            backends
                .conversion_queue
                .receive(room)
                .await?
                .into_iter()
                .map(|d| (Stage::Conversion, d)),
        );

        if batch.is_empty() {
            let conversion = backends.conversion_queue.depth().await?;
            let extraction = backends.extraction_queue.depth().await?;
            if conversion.outstanding() + extraction.outstanding() == 0 {
                report.dead_lettered = conversion.dead_lettered + extraction.dead_lettered;
                break;
            }
            tokio::time::sleep(IDLE_POLL).await;
            continue;
        }

        debug!("Dispatching {} deliveries", batch.len());
        let results: Vec<_> = stream::iter(
            batch
                .into_iter()
                .map(|(stage, delivery)| handle(backends, config, stage, delivery)),
        )
        .buffer_unordered(config.concurrency)
        .collect()
        .await;

        for (stage, result) in results {
            report.record(stage, result?);
        }
    }

    info!(
        "Drain finished: {} conversions, {} extractions, {} redelivered, {} dropped, {} dead-lettered",
        report.conversions, report.extractions, report.redelivered, report.dropped, report.dead_lettered
    );
    Ok(report)
}

/// Owns the backends and configuration of one worker process.
#[derive(Debug, Clone)]
pub struct Pipeline {
    backends: Backends,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(backends: Backends, config: PipelineConfig) -> Self {
        Self { backends, config }
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn ingest(&self, upload: &Upload) -> Result<IntakeReport, PipelineError> {
        intake::ingest(&self.backends, &self.config, upload).await
    }

    pub async fn convert(&self, item: &PageWork) -> Result<ConversionOutcome, PipelineError> {
        convert::convert_page(&self.backends, &self.config, item).await
    }

    pub async fn extract(&self, item: &ExtractionWork) -> Result<ExtractionOutcome, PipelineError> {
        extract::extract_page(&self.backends, &self.config, item).await
    }

    pub async fn drain(&self) -> Result<DrainReport, PipelineError> {
        drain(&self.backends, &self.config).await
    }

    /// Read-only view over the record store.
    pub fn query(&self) -> QueryService {
        QueryService::new(self.backends.records.clone())
    }
}
