//! Fixed-size batching in front of the uploader

use crate::cancellation::CancellationBus;
use crate::error::{IngestError, Result};
use crate::record::CanonicalRecord;
use crate::upload::Uploader;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Counters for one batcher run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batches_flushed: u64,
    pub batches_failed: u64,
    pub records_uploaded: u64,
    /// Records held in the partial batch when cancellation arrived
    pub records_discarded: u64,
}

/// Accumulates canonical records and flushes them in batches.
pub struct Batcher {
    uploader: Arc<dyn Uploader>,
    batch_size: usize,
}

impl Batcher {
    pub fn new(uploader: Arc<dyn Uploader>, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(IngestError::validation("Batch size must be greater than 0"));
        }
        Ok(Self {
            uploader,
            batch_size,
        })
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Consume `rx` until it closes, flushing every full batch and the final
    /// partial one. On cancellation the partial batch is discarded.
    pub async fn run(
        self,
        bus: CancellationBus,
        mut rx: mpsc::Receiver<CanonicalRecord>,
    ) -> BatchStats {
        let mut stats = BatchStats::default();
        let mut batch = Vec::with_capacity(self.batch_size);

        while let Some(record) = bus.recv(&mut rx).await {
            if bus.is_requested() {
                break;
            }
            batch.push(record);

            if batch.len() == self.batch_size && !self.flush(&bus, &mut batch, &mut stats).await {
                break;
            }
        }

        if bus.is_requested() {
            stats.records_discarded += batch.len() as u64;
            if !batch.is_empty() {
                warn!(records = batch.len(), "Cancelled, discarding partial batch");
            }
            return stats;
        }

        if !batch.is_empty() {
            self.flush(&bus, &mut batch, &mut stats).await;
        }

        info!(
            batches = stats.batches_flushed,
            failed = stats.batches_failed,
            records = stats.records_uploaded,
            "Batching finished"
        );
        stats
    }

    /// Returns `false` if cancellation was observed instead of flushing.
    async fn flush(
        &self,
        bus: &CancellationBus,
        batch: &mut Vec<CanonicalRecord>,
        stats: &mut BatchStats,
    ) -> bool {
        if bus.is_requested() {
            return false;
        }

        match self.uploader.upload(batch).await {
            Ok(()) => {
                stats.batches_flushed += 1;
                stats.records_uploaded += batch.len() as u64;
                debug!(records = batch.len(), total = stats.records_uploaded, "Flushed batch");
            },
            Err(e) => {
                stats.batches_failed += 1;
                error!(error = %e, records = batch.len(), "Failed to upload batch");
            },
        }

        batch.clear();
        true
    }
}
