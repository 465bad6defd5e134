//! Stage wiring
//!
//! ```text
//! source ──raw──▶ normalizer ──canonical──▶ batcher ──▶ uploader
//!    ▲                 ▲                       ▲
//!    └──────── CancellationBus (any stage may signal) ────────┘
//! ```
//!
//! Each stage runs as its own task. The queues between them are bounded, so a
//! slow uploader holds back the source instead of letting records pile up.

use crate::batch::{BatchStats, Batcher};
use crate::cancellation::CancellationBus;
use crate::config::PipelineConfig;
use crate::error::{IngestError, Result};
use crate::normalize::{NormalizerStats, RecordNormalizer};
use crate::source::{RecordSource, SourceStats};
use crate::upload::Uploader;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Totals for one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineReport {
    pub source: SourceStats,
    pub normalizer: NormalizerStats,
    pub batches: BatchStats,
}

impl PipelineReport {
    pub fn records_fetched(&self) -> u64 {
        self.source.records
    }

    pub fn records_normalized(&self) -> u64 {
        self.normalizer.emitted
    }

    pub fn records_dropped(&self) -> u64 {
        self.normalizer.dropped
    }

    pub fn records_uploaded(&self) -> u64 {
        self.batches.records_uploaded
    }
}

/// A source, the normalizer, and a batcher over one uploader.
pub struct Pipeline<S> {
    source: S,
    normalizer: RecordNormalizer,
    batcher: Batcher,
    config: PipelineConfig,
    bus: CancellationBus,
}

impl<S: RecordSource> Pipeline<S> {
    pub fn new(
        source: S,
        normalizer: RecordNormalizer,
        uploader: Arc<dyn Uploader>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let batcher = Batcher::new(uploader, config.batch_size)?;

        Ok(Self {
            source,
            normalizer,
            batcher,
            config,
            bus: CancellationBus::new(),
        })
    }

    /// Handle for requesting cancellation from outside the run.
    pub fn bus(&self) -> CancellationBus {
        self.bus.clone()
    }

    /// Run every stage to completion.
    ///
    /// Returns [`IngestError::Cancelled`] if any stage, or a holder of
    /// [`Pipeline::bus`], requested cancellation. The error is only returned
    /// after all three stages have stopped.
    pub async fn run(self) -> Result<PipelineReport> {
        let Self {
            source,
            normalizer,
            batcher,
            config,
            bus,
        } = self;

        let (raw_tx, raw_rx) = mpsc::channel(config.channel_capacity);
        let (canonical_tx, canonical_rx) = mpsc::channel(config.channel_capacity);

        info!(
            source = source.name(),
            batch_size = batcher.batch_size(),
            channel_capacity = config.channel_capacity,
            "Starting pipeline"
        );

        let source_task = tokio::spawn(source.run(bus.clone(), raw_tx));
        let normalizer_task = tokio::spawn(normalizer.run(bus.clone(), raw_rx, canonical_tx));
        let batcher_task = tokio::spawn(batcher.run(bus.clone(), canonical_rx));

        let (source, normalizer, batches) = tokio::join!(source_task, normalizer_task, batcher_task);
        let report = PipelineReport {
            source: source?,
            normalizer: normalizer?,
            batches: batches?,
        };

        if let Some(reason) = bus.reason() {
            error!(
                reason = %reason,
                fetched = report.records_fetched(),
                uploaded = report.records_uploaded(),
                "Pipeline cancelled"
            );
            return Err(IngestError::Cancelled(reason));
        }

        info!(
            fetched = report.records_fetched(),
            skipped = report.source.skipped,
            retries = report.source.retries,
            normalized = report.records_normalized(),
            dropped = report.records_dropped(),
            batches = report.batches.batches_flushed,
            failed_batches = report.batches.batches_failed,
            uploaded = report.records_uploaded(),
            "Pipeline finished"
        );

        Ok(report)
    }
}
