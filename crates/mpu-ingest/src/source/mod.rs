//! Mixpanel export sources
//!
//! A source walks its pagination cursor strictly in order, retrying the same
//! cursor position until the response is usable, and pushes raw records into
//! the pipeline one at a time.
//!
//! Failure handling is the same for both exports:
//! - a request that cannot be built is fatal and cancels the run
//! - transport errors, rejected statuses, and unparseable pages are retried
//!   after a fixed delay, with no attempt limit
//! - a single malformed record is logged and skipped

pub mod events;
pub mod lines;
pub mod profiles;

pub use events::EventExport;
pub use lines::{Line, LineSplitter};
pub use profiles::{ProfileCursor, ProfileExport};

use crate::cancellation::CancellationBus;
use crate::record::SourceRecord;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

/// Value of the `Authorization` header for a project secret.
pub fn basic_auth(secret: &str) -> String {
    format!("Basic {}", STANDARD.encode(secret))
}

/// Counters for one source run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStats {
    /// Requests issued, retries included
    pub requests: u64,
    pub retries: u64,
    /// Records handed to the normalizer
    pub records: u64,
    /// Lines that could not be parsed
    pub skipped: u64,
}

/// A producer of raw records.
///
/// `run` owns the sending half of the raw channel; returning drops it, which
/// is how the normalizer learns the stream has ended.
#[async_trait]
pub trait RecordSource: Send + 'static {
    /// Stage name used in logs and fatal cancellation reasons.
    fn name(&self) -> &'static str;

    async fn run(self, bus: CancellationBus, tx: mpsc::Sender<SourceRecord>) -> SourceStats;
}

/// Why a single attempt at a cursor position did not produce records.
#[derive(Debug, Error)]
pub(crate) enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("unparseable response: {0}")]
    Parse(String),

    #[error("failed reading body: {0}")]
    Body(String),
}

/// Fixed-delay retry with no attempt limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    delay: Duration,
}

impl RetryPolicy {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Count a failed attempt and wait out the delay. `false` if cancelled
    /// while waiting.
    pub async fn wait(&self, bus: &CancellationBus, stats: &mut SourceStats) -> bool {
        stats.retries += 1;
        bus.sleep(self.delay).await
    }
}

/// Forward one record, counting it. `false` once downstream is gone or the run
/// is cancelled.
pub(crate) async fn emit(
    bus: &CancellationBus,
    tx: &mpsc::Sender<SourceRecord>,
    record: SourceRecord,
    stats: &mut SourceStats,
) -> bool {
    match bus.send(tx, record).await {
        Ok(()) => {
            stats.records += 1;
            true
        },
        Err(reason) => {
            debug!(?reason, "Source stopping, downstream unavailable");
            false
        },
    }
}
