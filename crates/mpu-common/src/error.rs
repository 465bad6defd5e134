//! Error types for MPU

use thiserror::Error;

/// Result type alias for MPU operations
pub type Result<T> = std::result::Result<T, MpuError>;

/// Main error type for MPU
#[derive(Error, Debug)]
pub enum MpuError {
    #[error("Invalid value for {name}: '{value}'")]
    InvalidEnv { name: String, value: String },
}
