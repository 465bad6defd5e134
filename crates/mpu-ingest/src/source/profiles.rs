//! Mixpanel engage (profile) export

use super::{basic_auth, emit, FetchError, RecordSource, RetryPolicy, SourceStats};
use crate::cancellation::CancellationBus;
use crate::config::SourceConfig;
use crate::error::Result;
use crate::record::{ProfileRecord, SourceRecord};
use async_trait::async_trait;
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Request};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

const STAGE: &str = "profile export";

/// Position in the engage export.
///
/// The first request carries no parameters. The session id and page size are
/// learned from the first response and fixed for the rest of the run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfileCursor {
    pub session_id: Option<String>,
    pub page: u64,
    pub page_size: Option<usize>,
}

impl ProfileCursor {
    fn is_first(&self) -> bool {
        self.page == 0
    }

    fn query(&self) -> Vec<(&'static str, String)> {
        if self.is_first() {
            return Vec::new();
        }

        let mut query = Vec::with_capacity(2);
        if let Some(session_id) = &self.session_id {
            query.push(("session_id", session_id.clone()));
        }
        query.push(("page", self.page.to_string()));
        query
    }

    /// Record what the first page told us about the session.
    fn observe_first(&mut self, page: &ProfilePage) {
        self.session_id = page.session_id.clone().filter(|id| !id.is_empty());
        self.page_size = Some(page.page_size);
    }

    /// Whether a page with `count` results is the last one.
    fn is_last(&self, count: usize) -> bool {
        count == 0 || count < self.page_size.unwrap_or(0)
    }

    fn advance(&mut self) {
        self.page += 1;
    }
}

/// One page of the engage export.
#[derive(Debug, Deserialize)]
struct ProfilePage {
    #[serde(default)]
    page: u64,
    #[serde(default)]
    page_size: usize,
    #[serde(default)]
    results: Vec<ProfileRecord>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    total: Option<u64>,
    #[serde(default)]
    error: Option<String>,
}

/// Pages through every profile in the project.
pub struct ProfileExport {
    client: Client,
    url: String,
    auth: String,
    retry: RetryPolicy,
}

impl ProfileExport {
    pub fn new(config: &SourceConfig) -> Result<Self> {
        config.validate()?;

        let client = Client::builder()
            .timeout(config.profiles_timeout)
            .user_agent(concat!("mpu-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: config.profiles_url.clone(),
            auth: basic_auth(&config.secret),
            retry: RetryPolicy::new(config.retry_delay),
        })
    }

    fn request(&self, cursor: &ProfileCursor) -> reqwest::Result<Request> {
        self.client
            .get(&self.url)
            .header(AUTHORIZATION, &self.auth)
            .query(&cursor.query())
            .build()
    }

    /// Anything up to and including 500 is treated as a parseable page.
    async fn fetch(&self, request: Request) -> std::result::Result<ProfilePage, FetchError> {
        let response = self.client.execute(request).await?;
        let status = response.status();
        let body = response.bytes().await?;

        if status.as_u16() > 500 {
            return Err(FetchError::Rejected {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        let page: ProfilePage =
            serde_json::from_slice(&body).map_err(|e| FetchError::Parse(e.to_string()))?;

        if let Some(message) = page.error {
            return Err(FetchError::Rejected {
                status: status.as_u16(),
                body: message,
            });
        }

        Ok(page)
    }
}

#[async_trait]
impl RecordSource for ProfileExport {
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(self, bus: CancellationBus, tx: mpsc::Sender<SourceRecord>) -> SourceStats {
        let mut stats = SourceStats::default();
        let mut cursor = ProfileCursor::default();

        while !bus.is_requested() {
            let request = match self.request(&cursor) {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, url = %self.url, "Failed to build profile request");
                    bus.fatal(STAGE, format!("failed to build request: {}", e));
                    break;
                },
            };

            info!(page = cursor.page, "Fetching profiles page");
            stats.requests += 1;

            let page = match self.fetch(request).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(
                        error = %e,
                        page = cursor.page,
                        session_id = ?cursor.session_id,
                        retry_in = ?self.retry.delay(),
                        "Profile page failed, retrying"
                    );
                    if !self.retry.wait(&bus, &mut stats).await {
                        break;
                    }
                    continue;
                },
            };

            if cursor.is_first() {
                cursor.observe_first(&page);
                info!(
                    session_id = ?cursor.session_id,
                    page_size = page.page_size,
                    total = ?page.total,
                    "Profile export session started"
                );
            }
            debug!(
                page = page.page,
                status = ?page.status,
                results = page.results.len(),
                "Received profiles page"
            );

            let count = page.results.len();
            for record in page.results {
                if !emit(&bus, &tx, SourceRecord::Profile(record), &mut stats).await {
                    return stats;
                }
            }

            if cursor.is_last(count) {
                info!(
                    pages = cursor.page + 1,
                    records = stats.records,
                    retries = stats.retries,
                    "Profile export complete"
                );
                break;
            }
            cursor.advance();
        }

        stats
    }
}
