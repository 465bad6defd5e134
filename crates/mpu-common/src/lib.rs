//! MPU Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling and logging for the MPU workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`MpuError`] and the [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Environment**: typed lookups of optional environment variables
//!
//! # Example
//!
//! ```no_run
//! use mpu_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = LogConfig::from_env()?;
//!     init_logging(&config)?;
//!     Ok(())
//! }
//! ```

pub mod env;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{MpuError, Result};
