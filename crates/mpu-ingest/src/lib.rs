//! MPU Ingest Library
//!
//! Moves user profiles and events out of a Mixpanel project and into
//! CleverTap through a chain of concurrently running stages:
//!
//! - [`source`]: paginated export from the Mixpanel profile and event APIs
//! - [`normalize`]: conversion into the CleverTap upload shape
//! - [`batch`]: fixed-size batching in front of an [`upload::Uploader`]
//!
//! Stages share one [`cancellation::CancellationBus`]; a fatal error in any
//! stage or an external shutdown request stops all of them.
//!
//! # Example
//!
//! ```no_run
//! use mpu_ingest::{
//!     HttpUploader, Pipeline, PipelineConfig, ProfileExport, RecordNormalizer, SourceConfig,
//!     UploadConfig,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let source = ProfileExport::new(&SourceConfig::from_env()?)?;
//!     let uploader = Arc::new(HttpUploader::new(UploadConfig::from_env()?)?);
//!
//!     let pipeline = Pipeline::new(
//!         source,
//!         RecordNormalizer::default(),
//!         uploader,
//!         PipelineConfig::default(),
//!     )?;
//!     let report = pipeline.run().await?;
//!     println!("uploaded {} records", report.records_uploaded());
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod batch;
pub mod cancellation;
pub mod config;
pub mod error;
pub mod normalize;
pub mod pipeline;
pub mod record;
pub mod source;
pub mod upload;

pub use batch::{BatchStats, Batcher};
pub use cancellation::{CancelReason, CancellationBus};
pub use config::{PipelineConfig, SourceConfig, UploadConfig};
pub use error::{IngestError, Result};
pub use normalize::{NormalizationRules, RecordNormalizer};
pub use pipeline::{Pipeline, PipelineReport};
pub use record::{CanonicalRecord, EventRecord, ProfileRecord, PropertyValue, SourceRecord};
pub use source::{EventExport, Line, LineSplitter, ProfileExport, RecordSource};
pub use upload::{HttpUploader, LoggingUploader, MemoryUploader, Uploader};
