//! Destination uploaders
//!
//! The batcher hands each full batch to an [`Uploader`]. Delivery policy
//! (auth, retries) belongs to the uploader; the batcher only counts outcomes.

use crate::config::UploadConfig;
use crate::error::{IngestError, Result};
use crate::record::CanonicalRecord;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Receives batches of canonical records.
#[async_trait]
pub trait Uploader: Send + Sync {
    /// Write one batch. Records are in stream order.
    async fn upload(&self, batch: &[CanonicalRecord]) -> Result<()>;
}

#[derive(Serialize)]
struct UploadBody<'a> {
    d: &'a [CanonicalRecord],
}

/// Uploads batches to the CleverTap upload API.
pub struct HttpUploader {
    client: Client,
    config: UploadConfig,
}

impl HttpUploader {
    pub fn new(config: UploadConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("mpu-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self { client, config })
    }

    async fn send_once(&self, batch: &[CanonicalRecord]) -> Result<()> {
        let response = self
            .client
            .post(&self.config.url)
            .header("X-CleverTap-Account-Id", &self.config.account_id)
            .header("X-CleverTap-Passcode", &self.config.passcode)
            .json(&UploadBody { d: batch })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(IngestError::Upload {
                status: status.as_u16(),
                body,
            });
        }

        // A 200 can still carry per-record rejections.
        if let Ok(summary) = serde_json::from_str::<serde_json::Value>(&body) {
            let unprocessed = summary
                .get("unprocessed")
                .and_then(|u| u.as_array())
                .map_or(0, |u| u.len());
            if unprocessed > 0 {
                warn!(unprocessed, batch = batch.len(), response = %body, "Destination rejected some records");
            }
        }

        Ok(())
    }
}

fn is_retryable(err: &IngestError) -> bool {
    match err {
        IngestError::Http(_) => true,
        IngestError::Upload { status, .. } => *status == 429 || *status >= 500,
        _ => false,
    }
}

#[async_trait]
impl Uploader for HttpUploader {
    async fn upload(&self, batch: &[CanonicalRecord]) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.send_once(batch).await {
                Ok(()) => {
                    debug!(records = batch.len(), attempt, "Batch uploaded");
                    return Ok(());
                },
                Err(e) if attempt < self.config.max_attempts && is_retryable(&e) => {
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.config.max_attempts,
                        "Upload attempt failed, retrying"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}

/// Logs batches instead of uploading them (dry runs).
#[derive(Debug, Default)]
pub struct LoggingUploader;

#[async_trait]
impl Uploader for LoggingUploader {
    async fn upload(&self, batch: &[CanonicalRecord]) -> Result<()> {
        info!(records = batch.len(), "Dry run, batch not uploaded");
        if let Some(first) = batch.first() {
            debug!(record = %serde_json::to_string(first)?, "First record of batch");
        }
        Ok(())
    }
}

/// Keeps every batch in memory, for tests and local runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryUploader {
    batches: Arc<Mutex<Vec<Vec<CanonicalRecord>>>>,
}

impl MemoryUploader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all batches received so far.
    pub async fn batches(&self) -> Vec<Vec<CanonicalRecord>> {
        self.batches.lock().await.clone()
    }

    /// All records received so far, flattened in arrival order.
    pub async fn records(&self) -> Vec<CanonicalRecord> {
        self.batches.lock().await.iter().flatten().cloned().collect()
    }
}

#[async_trait]
impl Uploader for MemoryUploader {
    async fn upload(&self, batch: &[CanonicalRecord]) -> Result<()> {
        self.batches.lock().await.push(batch.to_vec());
        Ok(())
    }
}
