//! Mixpanel raw event export
//!
//! Events are fetched one calendar day per request, from the start date up to
//! and including the end date. The body is a stream of newline-delimited JSON
//! objects, split into lines by an injectable decoder. Lines are parsed from
//! raw bytes, so one corrupt or oversized line is skipped without failing the
//! day.

use super::{basic_auth, emit, FetchError, Line, LineSplitter, RecordSource, RetryPolicy, SourceStats};
use crate::cancellation::CancellationBus;
use crate::config::SourceConfig;
use crate::error::Result;
use crate::record::{EventRecord, SourceRecord};
use async_trait::async_trait;
use chrono::NaiveDate;
use futures::{StreamExt, TryStreamExt};
use reqwest::header::AUTHORIZATION;
use reqwest::{Client, Request, Response};
use std::fmt::Display;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, FramedRead};
use tokio_util::io::StreamReader;
use tracing::{debug, error, info, warn};

const STAGE: &str = "event export";

/// Exports every event between two dates, one day at a time.
///
/// `D` splits the response body into lines. The default [`LineSplitter`]
/// splits on `\n` and skips lines over the configured length.
pub struct EventExport<D = LineSplitter> {
    client: Client,
    url: String,
    auth: String,
    retry: RetryPolicy,
    start: NaiveDate,
    end: NaiveDate,
    splitter: D,
}

impl EventExport<LineSplitter> {
    /// `today` is the end of the range when no end date is configured.
    pub fn new(config: &SourceConfig, today: NaiveDate) -> Result<Self> {
        config.validate()?;
        let (start, end) = config.event_range(today)?;

        let client = Client::builder()
            .timeout(config.events_timeout)
            .user_agent(concat!("mpu-ingest/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            url: config.events_url.clone(),
            auth: basic_auth(&config.secret),
            retry: RetryPolicy::new(config.retry_delay),
            start,
            end,
            splitter: LineSplitter::new(config.max_event_line_bytes),
        })
    }
}

impl<D> EventExport<D> {
    /// Replace the line splitter.
    pub fn with_splitter<S>(self, splitter: S) -> EventExport<S> {
        EventExport {
            client: self.client,
            url: self.url,
            auth: self.auth,
            retry: self.retry,
            start: self.start,
            end: self.end,
            splitter,
        }
    }

    fn request(&self, day: NaiveDate) -> reqwest::Result<Request> {
        let date = day.format("%Y-%m-%d").to_string();
        self.client
            .get(&self.url)
            .header(AUTHORIZATION, &self.auth)
            .query(&[("from_date", &date), ("to_date", &date)])
            .build()
    }
}

/// Outcome of streaming one day's body.
enum DayOutcome {
    Complete,
    /// Downstream is gone or the run was cancelled.
    Stopped,
}

impl<D> EventExport<D>
where
    D: Decoder<Item = Line> + Clone + Send + Sync + 'static,
    D::Error: Display + Send,
{
    async fn send_day(&self, request: Request) -> std::result::Result<Response, FetchError> {
        let response = self.client.execute(request).await?;
        let status = response.status();

        if status.as_u16() >= 300 {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }

    /// Parse and forward every line of an accepted response.
    ///
    /// A transport error part way through fails the whole day; records already
    /// forwarded are sent again on the retry. Bad lines are only counted.
    async fn stream_day(
        &self,
        bus: &CancellationBus,
        tx: &mpsc::Sender<SourceRecord>,
        response: Response,
        stats: &mut SourceStats,
    ) -> std::result::Result<DayOutcome, FetchError> {
        let body = response.bytes_stream().map_err(std::io::Error::other);
        let mut lines = std::pin::pin!(FramedRead::new(StreamReader::new(body), self.splitter.clone()));

        while let Some(line) = lines.next().await {
            let line = match line.map_err(|e| FetchError::Body(e.to_string()))? {
                Line::Record(line) => line,
                Line::Oversized(len) => {
                    warn!(bytes = len, "Skipping oversized event line");
                    stats.skipped += 1;
                    continue;
                },
            };
            let line = line.trim_ascii();
            if line.is_empty() {
                continue;
            }

            let record = match serde_json::from_slice::<EventRecord>(line) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        error = %e,
                        line = %String::from_utf8_lossy(line),
                        "Skipping unparseable event line"
                    );
                    stats.skipped += 1;
                    continue;
                },
            };

            if !emit(bus, tx, SourceRecord::Event(record), stats).await {
                return Ok(DayOutcome::Stopped);
            }
        }

        Ok(DayOutcome::Complete)
    }
}

#[async_trait]
impl<D> RecordSource for EventExport<D>
where
    D: Decoder<Item = Line> + Clone + Send + Sync + 'static,
    D::Error: Display + Send,
{
    fn name(&self) -> &'static str {
        STAGE
    }

    async fn run(self, bus: CancellationBus, tx: mpsc::Sender<SourceRecord>) -> SourceStats {
        let mut stats = SourceStats::default();

        info!(start = %self.start, end = %self.end, "Fetching events");
        if self.start > self.end {
            warn!(start = %self.start, end = %self.end, "Start date is after end date, nothing to export");
            return stats;
        }

        let mut day = self.start;
        while !bus.is_requested() {
            let request = match self.request(day) {
                Ok(request) => request,
                Err(e) => {
                    error!(error = %e, url = %self.url, "Failed to build event request");
                    bus.fatal(STAGE, format!("failed to build request: {}", e));
                    break;
                },
            };

            info!(date = %day, "Fetching events for day");
            stats.requests += 1;

            let outcome = match self.send_day(request).await {
                Ok(response) => self.stream_day(&bus, &tx, response, &mut stats).await,
                Err(e) => Err(e),
            };

            match outcome {
                Ok(DayOutcome::Complete) => {
                    debug!(date = %day, records = stats.records, "Finished day");
                    if day >= self.end {
                        info!(
                            records = stats.records,
                            skipped = stats.skipped,
                            retries = stats.retries,
                            "Event export complete"
                        );
                        break;
                    }
                    match day.succ_opt() {
                        Some(next) => day = next,
                        None => break,
                    }
                },
                Ok(DayOutcome::Stopped) => break,
                Err(e) => {
                    warn!(error = %e, date = %day, retry_in = ?self.retry.delay(), "Event day failed, retrying");
                    if !self.retry.wait(&bus, &mut stats).await {
                        break;
                    }
                },
            }
        }

        stats
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio_util::bytes::BytesMut;
    use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

    fn export(start: &str, end: &str) -> EventExport {
        let config = SourceConfig::builder()
            .secret("s")
            .start_date(start)
            .end_date(end)
            .events_url("http://localhost:1/export")
            .build();
        EventExport::new(&config, NaiveDate::from_ymd_opt(2024, 1, 31).unwrap()).unwrap()
    }

    #[test]
    fn test_request_uses_single_day_range() {
        let export = export("2024-01-01", "2024-01-03");
        let day = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        let request = export.request(day).unwrap();

        assert_eq!(request.url().query(), Some("from_date=2024-01-02&to_date=2024-01-02"));
        assert_eq!(request.headers()[AUTHORIZATION], "Basic cw==");
    }

    #[test]
    fn test_requires_start_date() {
        let config = SourceConfig::builder().secret("s").build();
        let today = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        assert!(EventExport::new(&config, today).is_err());
    }

    #[tokio::test]
    async fn test_inverted_range_emits_nothing() {
        let export = export("2024-01-05", "2024-01-01");
        let (tx, mut rx) = mpsc::channel(1);

        let stats = export.run(CancellationBus::new(), tx).await;

        assert_eq!(stats.requests, 0);
        assert!(rx.recv().await.is_none());
    }

    /// Splits on `;` instead of newlines.
    #[derive(Debug, Clone, Default)]
    struct SemicolonSplitter;

    impl Decoder for SemicolonSplitter {
        type Item = Line;
        type Error = std::io::Error;

        fn decode(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Line>> {
            match buf.iter().position(|b| *b == b';') {
                Some(i) => {
                    let mut chunk = buf.split_to(i + 1);
                    chunk.truncate(i);
                    Ok(Some(Line::Record(chunk)))
                },
                None => Ok(None),
            }
        }

        fn decode_eof(&mut self, buf: &mut BytesMut) -> std::io::Result<Option<Line>> {
            if let Some(line) = self.decode(buf)? {
                return Ok(Some(line));
            }
            if buf.is_empty() {
                return Ok(None);
            }
            Ok(Some(Line::Record(buf.split())))
        }
    }

    #[tokio::test]
    async fn test_custom_splitter() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"event":"A","properties":{}};{"event":"B","properties":{}}"#,
            ))
            .mount(&server)
            .await;

        let config = SourceConfig::builder()
            .secret("s")
            .start_date("2024-01-01")
            .end_date("2024-01-01")
            .events_url(format!("{}/export", server.uri()))
            .build();
        let today = NaiveDate::from_ymd_opt(2024, 1, 31).unwrap();
        let export = EventExport::new(&config, today).unwrap().with_splitter(SemicolonSplitter);

        let (tx, mut rx) = mpsc::channel(4);
        let stats = export.run(CancellationBus::new(), tx).await;
        assert_eq!(stats.records, 2);

        let mut names = Vec::new();
        while let Some(SourceRecord::Event(event)) = rx.recv().await {
            names.push(event.event_name);
        }
        assert_eq!(names, vec!["A", "B"]);
    }
}
