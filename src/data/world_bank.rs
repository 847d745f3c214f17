//! World Bank indicator API client
//!
//! This module fetches yearly indicator series from the World Bank v2 API and
//! parses its `[metadata, rows]` envelope into `SeriesPoint`s. Every request,
//! successful or not, is recorded in the cache store's fetch log.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use super::SeriesPoint;
use crate::cache::{CacheStore, FetchLogEntry};

/// Base URL for the World Bank v2 API
pub const WORLD_BANK_BASE_URL: &str = "https://api.worldbank.org/v2";

/// Page size large enough to return one country's series for 1960..today in one round trip
pub const DEFAULT_PER_PAGE: u32 = 1000;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A failed call to the statistics API
///
/// `status` is the HTTP status code, or 0 when no response was received
/// (connection failure, timeout, truncated body).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("World Bank request failed (status {status}): {message}")]
pub struct RemoteFetchError {
    pub status: u16,
    pub message: String,
}

impl RemoteFetchError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// Transport-level failure with no HTTP status
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }

    /// Whether the failure happened before any HTTP response arrived
    pub fn is_transport(&self) -> bool {
        self.status == 0
    }

    /// Whether retrying the same request may succeed
    pub fn is_retryable(&self) -> bool {
        self.is_transport() || self.status == 429 || self.status >= 500
    }
}

/// Anything that can produce a yearly series for a region and upstream series code
#[async_trait]
pub trait SeriesSource: Send + Sync {
    /// Fetches `series_code` for `region_code` over `start_year..=end_year`
    ///
    /// Only points with a numeric value are returned. An empty vector means the
    /// source answered but had no data.
    async fn fetch_series(
        &self,
        region_code: &str,
        series_code: &str,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<SeriesPoint>, RemoteFetchError>;
}

/// Client for fetching indicator series from the World Bank API
#[derive(Debug, Clone)]
pub struct WorldBankClient {
    /// HTTP client for making requests
    http_client: Client,
    /// Base URL for the API (allows override for testing)
    base_url: String,
    /// `per_page` query parameter
    per_page: u32,
    /// Store receiving one fetch log entry per request
    fetch_log: Option<CacheStore>,
}

impl WorldBankClient {
    /// Creates a client with the default 10 second request timeout
    pub fn new() -> Result<Self, RemoteFetchError> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    /// Creates a client whose requests give up after `timeout`
    pub fn with_timeout(timeout: Duration) -> Result<Self, RemoteFetchError> {
        let http_client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteFetchError::network(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(http_client))
    }

    /// Creates a client around a preconfigured HTTP client
    pub fn with_client(http_client: Client) -> Self {
        Self {
            http_client,
            base_url: WORLD_BANK_BASE_URL.to_string(),
            per_page: DEFAULT_PER_PAGE,
            fetch_log: None,
        }
    }

    /// Overrides the API base URL
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Overrides the page size
    pub fn with_per_page(mut self, per_page: u32) -> Self {
        self.per_page = per_page;
        self
    }

    /// Records every request in the given store's fetch log
    pub fn with_fetch_log(mut self, store: CacheStore) -> Self {
        self.fetch_log = Some(store);
        self
    }

    /// Builds the request URL for one series
    fn series_url(&self, region_code: &str, series_code: &str, start_year: i32, end_year: i32) -> String {
        format!(
            "{}/country/{}/indicator/{}?format=json&date={}:{}&per_page={}",
            self.base_url, region_code, series_code, start_year, end_year, self.per_page
        )
    }

    /// Issues the request and classifies the outcome
    ///
    /// # Returns
    /// * `Ok((status, points))` - 2xx response with a parseable envelope
    /// * `Err(RemoteFetchError)` - Transport failure, non-2xx status or invalid JSON
    async fn request(&self, url: &str) -> Result<(u16, Vec<SeriesPoint>), RemoteFetchError> {
        let response = self.http_client.get(url).send().await.map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(RemoteFetchError::new(
                status.as_u16(),
                format!("HTTP {}", status.as_u16()),
            ));
        }

        let body = response.text().await.map_err(transport_error)?;
        let parsed = parse_series_body(&body).map_err(|e| {
            RemoteFetchError::new(status.as_u16(), format!("Invalid JSON response: {}", e))
        })?;

        if let Some(pages) = parsed.pages.filter(|&pages| pages > 1) {
            warn!(url, pages, "Response spans multiple pages, only the first page was read");
        }

        Ok((status.as_u16(), parsed.points))
    }

    /// Appends a fetch log entry; failures are logged and swallowed
    fn record_fetch(
        &self,
        region_code: &str,
        series_code: &str,
        records_fetched: usize,
        http_status: u16,
        elapsed: Duration,
        error_message: Option<String>,
    ) {
        let Some(ref store) = self.fetch_log else {
            return;
        };

        let entry = FetchLogEntry {
            indicator_id: series_code.to_string(),
            region_id: region_code.to_string(),
            records_fetched: records_fetched as u64,
            http_status,
            response_time_ms: elapsed.as_millis() as u64,
            error_message,
            timestamp: store.now(),
        };
        if let Err(e) = store.append_fetch_log(&entry) {
            warn!(error = %e, region_code, series_code, "Failed to write fetch log entry");
        }
    }
}

#[async_trait]
impl SeriesSource for WorldBankClient {
    async fn fetch_series(
        &self,
        region_code: &str,
        series_code: &str,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<SeriesPoint>, RemoteFetchError> {
        let url = self.series_url(region_code, series_code, start_year, end_year);
        let started = Instant::now();
        let result = self.request(&url).await;
        let elapsed = started.elapsed();

        match result {
            Ok((status, points)) => {
                debug!(
                    region_code,
                    series_code,
                    records = points.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Fetched World Bank series"
                );
                self.record_fetch(region_code, series_code, points.len(), status, elapsed, None);
                Ok(points)
            }
            Err(e) => {
                warn!(
                    region_code,
                    series_code,
                    status = e.status,
                    elapsed_ms = elapsed.as_millis() as u64,
                    error = %e.message,
                    "World Bank request failed"
                );
                self.record_fetch(region_code, series_code, 0, e.status, elapsed, Some(e.message.clone()));
                Err(e)
            }
        }
    }
}

/// Maps a reqwest failure that produced no usable response
fn transport_error(e: reqwest::Error) -> RemoteFetchError {
    if e.is_timeout() {
        RemoteFetchError::network(format!("Request timed out: {}", e))
    } else {
        RemoteFetchError::network(e.to_string())
    }
}

/// Points and paging metadata extracted from one response body
#[derive(Debug, Default)]
struct ParsedSeries {
    points: Vec<SeriesPoint>,
    pages: Option<u64>,
}

/// A single data row of the World Bank envelope
#[derive(Debug, Deserialize)]
struct WorldBankRow {
    /// Year as a string, e.g. "2021"
    date: String,
    value: Option<f64>,
}

/// Parses a `[metadata, rows]` response body
///
/// A body that is valid JSON but lacks a row array (including the API's
/// `[{"message": ...}]` error envelope) yields an empty series. Rows with a
/// null value or a non-numeric date are dropped.
fn parse_series_body(body: &str) -> Result<ParsedSeries, serde_json::Error> {
    let envelope: Value = serde_json::from_str(body)?;
    let Some(items) = envelope.as_array() else {
        return Ok(ParsedSeries::default());
    };

    let pages = items
        .first()
        .and_then(|metadata| metadata.get("pages"))
        .and_then(Value::as_u64);

    let Some(rows) = items.get(1).and_then(Value::as_array) else {
        return Ok(ParsedSeries { points: Vec::new(), pages });
    };

    let points = rows
        .iter()
        .filter_map(|row| WorldBankRow::deserialize(row).ok())
        .filter_map(|row| {
            let value = row.value.filter(|v| v.is_finite())?;
            let year = row.date.trim().parse::<i32>().ok()?;
            Some(SeriesPoint::new(year, value))
        })
        .collect();

    Ok(ParsedSeries { points, pages })
}
