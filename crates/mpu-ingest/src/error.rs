//! Error types for the ingestion pipeline

use crate::cancellation::CancelReason;
use mpu_common::MpuError;
use thiserror::Error;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Errors surfaced to the caller of the pipeline.
///
/// Failures inside a running stage are not returned through this type; they
/// are retried, dropped, or broadcast on the cancellation bus. The pipeline
/// converts a fatal broadcast into [`IngestError::Cancelled`] once every stage
/// has unwound.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid date '{0}', expected YYYY-MM-DD")]
    InvalidDate(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Common(#[from] MpuError),

    #[error("Upload rejected with status {status}: {body}")]
    Upload { status: u16, body: String },

    #[error("Pipeline cancelled: {0}")]
    Cancelled(CancelReason),

    #[error("Pipeline task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl IngestError {
    pub fn validation(msg: impl Into<String>) -> Self {
        IngestError::Validation(msg.into())
    }
}
