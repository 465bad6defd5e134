//! Environment variable helpers
//!
//! Configuration structs across the workspace follow the same shape: start
//! from defaults, then override each field whose variable is set. These
//! helpers keep the parse-or-fail behaviour consistent.

use crate::error::{MpuError, Result};
use std::str::FromStr;

/// Read a variable, treating an empty value as unset.
pub fn var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Read and parse a variable.
///
/// Returns `Ok(None)` when the variable is unset and
/// [`MpuError::InvalidEnv`] when it is set but does not parse.
pub fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match var(name) {
        Some(value) => value.trim().parse::<T>().map(Some).map_err(|_| MpuError::InvalidEnv {
            name: name.to_string(),
            value,
        }),
        None => Ok(None),
    }
}
