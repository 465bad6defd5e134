//! Ingestion configuration
//!
//! Source credentials, export range, endpoints, and pipeline sizing. Values
//! start from defaults and are overridden from the environment or the CLI.

use crate::error::{IngestError, Result};
use chrono::NaiveDate;
use mpu_common::env;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// Source Constants
// ============================================================================

/// Mixpanel engage (profile) export endpoint.
pub const DEFAULT_PROFILES_URL: &str = "https://mixpanel.com/api/2.0/engage/";

/// Mixpanel raw event export endpoint.
pub const DEFAULT_EVENTS_URL: &str = "https://data.mixpanel.com/api/2.0/export/";

/// Per-request timeout for a profile page.
pub const DEFAULT_PROFILES_TIMEOUT_SECS: u64 = 60;

/// Per-request timeout for one day of events. A busy day streams for hours.
pub const DEFAULT_EVENTS_TIMEOUT_SECS: u64 = 240 * 60;

/// Fixed delay before retrying a failed page or day.
pub const DEFAULT_RETRY_DELAY_SECS: u64 = 20;

/// Longest event line kept in memory. Longer lines are skipped.
pub const DEFAULT_MAX_EVENT_LINE_BYTES: usize = 1024 * 1024;

// ============================================================================
// Pipeline Constants
// ============================================================================

/// Records per upload batch.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Depth of the inter-stage queues. Tokio channels cannot be zero-sized, so
/// one slot is the closest to a synchronous handoff.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

// ============================================================================
// Upload Constants
// ============================================================================

/// CleverTap upload endpoint.
pub const DEFAULT_UPLOAD_URL: &str = "https://api.clevertap.com/1/upload";

pub const DEFAULT_UPLOAD_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_UPLOAD_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_UPLOAD_RETRY_DELAY_SECS: u64 = 5;

/// Parse a `YYYY-MM-DD` date.
pub fn parse_date(value: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map_err(|_| IngestError::InvalidDate(value.to_string()))
}

/// Configuration for the Mixpanel export sources
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Project API secret, sent base64-encoded as basic auth
    pub secret: String,

    /// First day of the event export (YYYY-MM-DD)
    pub start_date: Option<String>,

    /// Last day of the event export (YYYY-MM-DD); today when unset
    pub end_date: Option<String>,

    pub profiles_url: String,

    pub events_url: String,

    pub profiles_timeout: Duration,

    pub events_timeout: Duration,

    /// Delay between attempts at the same page or day
    pub retry_delay: Duration,

    /// Event lines longer than this are skipped without being buffered
    pub max_event_line_bytes: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            start_date: None,
            end_date: None,
            profiles_url: DEFAULT_PROFILES_URL.to_string(),
            events_url: DEFAULT_EVENTS_URL.to_string(),
            profiles_timeout: Duration::from_secs(DEFAULT_PROFILES_TIMEOUT_SECS),
            events_timeout: Duration::from_secs(DEFAULT_EVENTS_TIMEOUT_SECS),
            retry_delay: Duration::from_secs(DEFAULT_RETRY_DELAY_SECS),
            max_event_line_bytes: DEFAULT_MAX_EVENT_LINE_BYTES,
        }
    }
}

impl SourceConfig {
    pub fn builder() -> SourceConfigBuilder {
        SourceConfigBuilder::default()
    }

    /// Load configuration from environment variables
    ///
    /// - `MIXPANEL_SECRET`
    /// - `MIXPANEL_START_DATE`, `MIXPANEL_END_DATE`
    /// - `MIXPANEL_PROFILES_URL`, `MIXPANEL_EVENTS_URL`
    /// - `MIXPANEL_RETRY_DELAY_SECS`
    /// - `MIXPANEL_MAX_EVENT_LINE_BYTES`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(secret) = env::var("MIXPANEL_SECRET") {
            config.secret = secret;
        }
        config.start_date = env::var("MIXPANEL_START_DATE");
        config.end_date = env::var("MIXPANEL_END_DATE");
        if let Some(url) = env::var("MIXPANEL_PROFILES_URL") {
            config.profiles_url = url;
        }
        if let Some(url) = env::var("MIXPANEL_EVENTS_URL") {
            config.events_url = url;
        }
        if let Some(secs) = env::parse_var::<u64>("MIXPANEL_RETRY_DELAY_SECS")? {
            config.retry_delay = Duration::from_secs(secs);
        }
        if let Some(bytes) = env::parse_var::<usize>("MIXPANEL_MAX_EVENT_LINE_BYTES")? {
            config.max_event_line_bytes = bytes;
        }

        Ok(config)
    }

    /// Validate the settings shared by both sources.
    ///
    /// Endpoint URLs are only checked for presence; a malformed URL surfaces as
    /// a fatal request-construction error when the export starts.
    pub fn validate(&self) -> Result<()> {
        if self.secret.trim().is_empty() {
            return Err(IngestError::validation("Mixpanel secret cannot be empty"));
        }

        if self.profiles_url.is_empty() || self.events_url.is_empty() {
            return Err(IngestError::validation("Export endpoints cannot be empty"));
        }

        if self.profiles_timeout.is_zero() || self.events_timeout.is_zero() {
            return Err(IngestError::validation("Timeouts must be greater than 0"));
        }

        if self.max_event_line_bytes == 0 {
            return Err(IngestError::validation("Event line limit must be greater than 0"));
        }

        if let Some(start) = &self.start_date {
            parse_date(start)?;
        }
        if let Some(end) = &self.end_date {
            parse_date(end)?;
        }

        Ok(())
    }

    /// Inclusive day range for the event export.
    pub fn event_range(&self, today: NaiveDate) -> Result<(NaiveDate, NaiveDate)> {
        let start = self
            .start_date
            .as_deref()
            .ok_or_else(|| IngestError::validation("Start date is required for event export"))
            .and_then(parse_date)?;

        let end = match &self.end_date {
            Some(end) => parse_date(end)?,
            None => today,
        };

        Ok((start, end))
    }
}

/// Builder for SourceConfig
#[derive(Debug, Default)]
pub struct SourceConfigBuilder {
    config: SourceConfig,
}

impl SourceConfigBuilder {
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.config.secret = secret.into();
        self
    }

    pub fn start_date(mut self, date: impl Into<String>) -> Self {
        self.config.start_date = Some(date.into());
        self
    }

    pub fn end_date(mut self, date: impl Into<String>) -> Self {
        self.config.end_date = Some(date.into());
        self
    }

    pub fn profiles_url(mut self, url: impl Into<String>) -> Self {
        self.config.profiles_url = url.into();
        self
    }

    pub fn events_url(mut self, url: impl Into<String>) -> Self {
        self.config.events_url = url.into();
        self
    }

    pub fn profiles_timeout(mut self, timeout: Duration) -> Self {
        self.config.profiles_timeout = timeout;
        self
    }

    pub fn events_timeout(mut self, timeout: Duration) -> Self {
        self.config.events_timeout = timeout;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn max_event_line_bytes(mut self, bytes: usize) -> Self {
        self.config.max_event_line_bytes = bytes;
        self
    }

    pub fn build(self) -> SourceConfig {
        self.config
    }
}

/// Pipeline sizing
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Records per upload batch
    pub batch_size: usize,

    /// Depth of each inter-stage queue
    pub channel_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(IngestError::validation("Batch size must be greater than 0"));
        }
        if self.channel_capacity == 0 {
            return Err(IngestError::validation("Channel capacity must be greater than 0"));
        }
        Ok(())
    }
}

/// Configuration for the CleverTap uploader
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    pub url: String,

    pub account_id: String,

    pub passcode: String,

    pub timeout: Duration,

    /// Attempts per batch before the batch is reported as failed
    pub max_attempts: u32,

    pub retry_delay: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPLOAD_URL.to_string(),
            account_id: String::new(),
            passcode: String::new(),
            timeout: Duration::from_secs(DEFAULT_UPLOAD_TIMEOUT_SECS),
            max_attempts: DEFAULT_UPLOAD_MAX_ATTEMPTS,
            retry_delay: Duration::from_secs(DEFAULT_UPLOAD_RETRY_DELAY_SECS),
        }
    }
}

impl UploadConfig {
    /// Load configuration from environment variables
    ///
    /// - `CLEVERTAP_ACCOUNT_ID`, `CLEVERTAP_PASSCODE`
    /// - `CLEVERTAP_UPLOAD_URL`
    /// - `CLEVERTAP_MAX_ATTEMPTS`
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(account_id) = env::var("CLEVERTAP_ACCOUNT_ID") {
            config.account_id = account_id;
        }
        if let Some(passcode) = env::var("CLEVERTAP_PASSCODE") {
            config.passcode = passcode;
        }
        if let Some(url) = env::var("CLEVERTAP_UPLOAD_URL") {
            config.url = url;
        }
        if let Some(attempts) = env::parse_var::<u32>("CLEVERTAP_MAX_ATTEMPTS")? {
            config.max_attempts = attempts;
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.account_id.trim().is_empty() || self.passcode.trim().is_empty() {
            return Err(IngestError::validation(
                "CleverTap account id and passcode are required",
            ));
        }
        if self.url.is_empty() {
            return Err(IngestError::validation("Upload URL cannot be empty"));
        }
        if self.max_attempts == 0 {
            return Err(IngestError::validation("Upload attempts must be at least 1"));
        }
        Ok(())
    }
}
