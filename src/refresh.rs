//! Lazy cache refresh and the read operations served to the dashboard
//!
//! Every read checks the cache store's freshness for the keys it touches. A
//! stale or missing key is refreshed from the series source (or the derived
//! metric calculator) before reading. When the remote path fails, the read is
//! answered from sample data or the error is returned, depending on
//! `RefreshConfig::fallback_on_failure`.

use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::{cache_key, CacheStore, PersistenceError};
use crate::data::derived::DerivedMetricCalculator;
use crate::data::sample::{sample_growth_rate, sample_latest, sample_series};
use crate::data::world_bank::{DEFAULT_PER_PAGE, DEFAULT_REQUEST_TIMEOUT, WORLD_BANK_BASE_URL};
use crate::data::{
    compound_growth_rate, get_indicator_by_id, get_region_by_id, CalculationMethod, DataPoint,
    Indicator, Region, RemoteFetchError, SeriesPoint, SeriesSource, WorldBankClient,
    SOURCE_TAG_WORLD_BANK,
};

/// Retry behaviour for direct series requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Additional attempts after the first failure
    pub max_retries: u32,
    /// Wait before the first retry; doubles for each later one
    pub initial_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            initial_backoff: Duration::ZERO,
        }
    }

    /// Backoff before retry number `attempt` (0-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.initial_backoff.saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(500),
        }
    }
}

/// Configuration for the refresh pipeline
#[derive(Debug, Clone)]
pub struct RefreshConfig {
    /// When false, every read is served from sample data
    pub use_live_source: bool,
    /// When true, remote failures are answered with sample data instead of an error
    pub fallback_on_failure: bool,
    /// Hours a refreshed key stays fresh; applied to the store by `IndicatorService::new`
    pub ttl_hours: u64,
    /// First year requested on refresh
    pub start_year: i32,
    /// Last year requested on refresh
    pub end_year: i32,
    /// Pause between years when deriving a series
    pub derived_request_delay: Duration,
    /// Per-request HTTP timeout
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    /// World Bank API base URL
    pub base_url: String,
    pub per_page: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            use_live_source: true,
            fallback_on_failure: true,
            ttl_hours: 24,
            start_year: 1990,
            end_year: 2024,
            derived_request_delay: Duration::from_millis(100),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            retry: RetryPolicy::default(),
            base_url: WORLD_BANK_BASE_URL.to_string(),
            per_page: DEFAULT_PER_PAGE,
        }
    }
}

/// Errors returned by the read operations
#[derive(Debug, Error)]
pub enum DataError {
    /// The region id is not in the catalog
    #[error("Unknown region: '{0}'")]
    RegionNotFound(String),

    /// The indicator id is not in the catalog
    #[error("Unknown indicator: '{0}'")]
    IndicatorNotFound(String),

    /// The request itself is malformed
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Refreshing a key from the remote source failed and fallback is disabled
    #[error("Failed to refresh {indicator} for {region}: {source}")]
    Remote {
        region: String,
        indicator: String,
        source: RemoteFetchError,
    },

    /// The cache store failed
    #[error("Cache {operation} failed for {key}: {source}")]
    Persistence {
        operation: &'static str,
        key: String,
        source: PersistenceError,
    },

    /// The HTTP client could not be constructed
    #[error("Failed to set up the World Bank client: {0}")]
    ClientSetup(RemoteFetchError),

    /// A configuration value was rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[source] PersistenceError),
}

/// Where a key's data is read from for the current request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Served {
    Cache,
    Fallback,
}

/// Refresh orchestrator: serves indicator reads from the cache, refreshing lazily
pub struct IndicatorService {
    store: CacheStore,
    source: Arc<dyn SeriesSource>,
    config: RefreshConfig,
    /// One lock per cache key so concurrent reads of a stale key refresh it once
    refresh_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl IndicatorService {
    /// Creates a service around an explicit store and series source
    ///
    /// The store refreshes keys with `config.ttl_hours`, whatever TTL it was
    /// opened with.
    ///
    /// # Returns
    /// * `Err(DataError::InvalidConfig)` if the TTL is out of range
    pub fn new(
        store: CacheStore,
        source: Arc<dyn SeriesSource>,
        config: RefreshConfig,
    ) -> Result<Self, DataError> {
        let store = store
            .with_ttl_hours(config.ttl_hours)
            .map_err(DataError::InvalidConfig)?;
        Ok(Self {
            store,
            source,
            config,
            refresh_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Creates a service backed by the World Bank API
    ///
    /// The client logs every request to `store`'s fetch log and uses the
    /// timeout, base URL and page size from `config`.
    pub fn with_world_bank(store: CacheStore, config: RefreshConfig) -> Result<Self, DataError> {
        let client = WorldBankClient::with_timeout(config.request_timeout)
            .map_err(DataError::ClientSetup)?
            .with_base_url(config.base_url.clone())
            .with_per_page(config.per_page)
            .with_fetch_log(store.clone());
        Self::new(store, Arc::new(client), config)
    }

    /// The cache store backing this service
    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    /// Returns the series of one indicator for several regions
    ///
    /// Points are grouped by region in request order, each group ascending by
    /// year. Regions are refreshed concurrently when stale.
    ///
    /// # Returns
    /// * `Ok(points)` - Cached points, or sample points for keys whose refresh failed
    /// * `Err(DataError)` - Unknown ids, empty region list, or a failure that
    ///   fallback does not cover
    pub async fn get_series(
        &self,
        indicator_id: &str,
        region_ids: &[&str],
    ) -> Result<Vec<DataPoint>, DataError> {
        let indicator = resolve_indicator(indicator_id)?;
        if region_ids.is_empty() {
            return Err(DataError::InvalidRequest(
                "at least one region is required".to_string(),
            ));
        }
        let regions = region_ids
            .iter()
            .map(|id| resolve_region(id))
            .collect::<Result<Vec<_>, _>>()?;

        let served = join_all(
            regions
                .iter()
                .map(|region| self.ensure_fresh(region, indicator)),
        )
        .await;

        let mut points = Vec::new();
        for (region, served) in regions.iter().zip(served) {
            match served? {
                Served::Cache => points.extend(
                    self.store
                        .query_data_points(region.id, indicator.id)
                        .map_err(persistence("read", region, indicator))?,
                ),
                Served::Fallback => points.extend(sample_series(region.id, indicator.id)),
            }
        }
        Ok(points)
    }

    /// Returns the most recent point for a region and indicator
    pub async fn get_latest_value(
        &self,
        region_id: &str,
        indicator_id: &str,
    ) -> Result<Option<DataPoint>, DataError> {
        let region = resolve_region(region_id)?;
        let indicator = resolve_indicator(indicator_id)?;

        match self.ensure_fresh(region, indicator).await? {
            Served::Cache => self
                .store
                .query_latest(region.id, indicator.id)
                .map_err(persistence("read", region, indicator)),
            Served::Fallback => Ok(sample_latest(region.id, indicator.id)),
        }
    }

    /// Compound annual growth rate between two stored years
    ///
    /// Uses the values at exactly `start_year` and `end_year`.
    ///
    /// # Returns
    /// * `Ok(Some(rate))` - Both years exist and the start value is positive
    /// * `Ok(None)` - A year is missing, the start value is not positive, or
    ///   the years are equal
    pub async fn get_growth_rate(
        &self,
        region_id: &str,
        indicator_id: &str,
        start_year: i32,
        end_year: i32,
    ) -> Result<Option<f64>, DataError> {
        let region = resolve_region(region_id)?;
        let indicator = resolve_indicator(indicator_id)?;

        match self.ensure_fresh(region, indicator).await? {
            Served::Cache => {
                let read = |year| {
                    self.store
                        .query_point(region.id, indicator.id, year)
                        .map_err(persistence("read", region, indicator))
                };
                let (Some(start), Some(end)) = (read(start_year)?, read(end_year)?) else {
                    return Ok(None);
                };
                Ok(compound_growth_rate(start.year, start.value, end.year, end.value))
            }
            Served::Fallback => Ok(sample_growth_rate(
                region.id,
                indicator.id,
                start_year,
                end_year,
            )),
        }
    }

    /// Marks a key invalid so the next read refreshes it
    ///
    /// # Returns
    /// * `Ok(false)` if the key has never been cached
    pub fn invalidate(&self, region_id: &str, indicator_id: &str) -> Result<bool, DataError> {
        let region = resolve_region(region_id)?;
        let indicator = resolve_indicator(indicator_id)?;
        let invalidated = self
            .store
            .invalidate(region.id, indicator.id)
            .map_err(persistence("invalidate", region, indicator))?;
        info!(region = region.id, indicator = indicator.id, invalidated, "Invalidated cache key");
        Ok(invalidated)
    }

    /// Makes sure a key can be read from the cache, refreshing it if needed
    async fn ensure_fresh(&self, region: &Region, indicator: &Indicator) -> Result<Served, DataError> {
        if !self.config.use_live_source {
            return Ok(Served::Fallback);
        }
        if self.is_fresh(region, indicator)? {
            debug!(region = region.id, indicator = indicator.id, "Cache hit");
            return Ok(Served::Cache);
        }

        let lock = self.refresh_lock(region, indicator);
        let _guard = lock.lock().await;

        // Another request may have refreshed the key while we waited
        if self.is_fresh(region, indicator)? {
            debug!(region = region.id, indicator = indicator.id, "Refreshed by concurrent request");
            return Ok(Served::Cache);
        }

        info!(region = region.id, indicator = indicator.id, "Cache miss, refreshing");
        match self.refresh(region, indicator).await {
            Ok(_) => Ok(Served::Cache),
            Err(err @ DataError::Remote { .. }) if self.config.fallback_on_failure => {
                warn!(
                    region = region.id,
                    indicator = indicator.id,
                    error = %err,
                    "Refresh failed, serving sample data"
                );
                Ok(Served::Fallback)
            }
            Err(err) => Err(err),
        }
    }

    fn is_fresh(&self, region: &Region, indicator: &Indicator) -> Result<bool, DataError> {
        self.store
            .is_fresh(region.id, indicator.id)
            .map_err(persistence("freshness check", region, indicator))
    }

    fn refresh_lock(&self, region: &Region, indicator: &Indicator) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .entry(cache_key(region.id, indicator.id))
            .or_default()
            .clone()
    }

    /// Fetches a key from upstream and stores it
    ///
    /// # Returns
    /// * `Ok(count)` - Number of points stored
    async fn refresh(&self, region: &Region, indicator: &Indicator) -> Result<usize, DataError> {
        let points = self
            .fetch_points(region, indicator)
            .await
            .map_err(|source| DataError::Remote {
                region: region.id.to_string(),
                indicator: indicator.id.to_string(),
                source,
            })?;

        let stored = self
            .store
            .commit_refresh(region.id, indicator.id, &points, SOURCE_TAG_WORLD_BANK)
            .map_err(persistence("write", region, indicator))?;

        info!(
            region = region.id,
            indicator = indicator.id,
            records = stored,
            "Cached indicator data"
        );
        Ok(stored)
    }

    /// Obtains the raw series for a key, directly or via derivation
    async fn fetch_points(
        &self,
        region: &Region,
        indicator: &Indicator,
    ) -> Result<Vec<SeriesPoint>, RemoteFetchError> {
        let region_code = region.remote_source_code.ok_or_else(|| {
            RemoteFetchError::new(404, format!("No upstream series for region {}", region.id))
        })?;
        let (start_year, end_year) = (self.config.start_year, self.config.end_year);

        match indicator.calculation_method {
            CalculationMethod::Calculated => {
                let derivation = indicator.derivation.ok_or_else(|| {
                    RemoteFetchError::new(404, format!("No derivation for indicator {}", indicator.id))
                })?;
                let calculator = DerivedMetricCalculator::new(
                    self.source.as_ref(),
                    self.config.derived_request_delay,
                );
                let series = calculator
                    .compute(region_code, &derivation, start_year, end_year)
                    .await?;
                Ok(series.points)
            }
            CalculationMethod::Direct => {
                let series_code = indicator.remote_series_code.ok_or_else(|| {
                    RemoteFetchError::new(404, format!("No upstream series for indicator {}", indicator.id))
                })?;
                self.fetch_with_retry(region_code, series_code, start_year, end_year)
                    .await
            }
        }
    }

    /// Fetches one series, retrying transient failures with exponential backoff
    async fn fetch_with_retry(
        &self,
        region_code: &str,
        series_code: &str,
        start_year: i32,
        end_year: i32,
    ) -> Result<Vec<SeriesPoint>, RemoteFetchError> {
        let policy = self.config.retry;
        let mut attempt = 0;
        loop {
            match self
                .source
                .fetch_series(region_code, series_code, start_year, end_year)
                .await
            {
                Ok(points) => return Ok(points),
                Err(err) if err.is_retryable() && attempt < policy.max_retries => {
                    let backoff = policy.backoff_for(attempt);
                    attempt += 1;
                    warn!(
                        region_code,
                        series_code,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "Retrying series request"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn resolve_region(region_id: &str) -> Result<&'static Region, DataError> {
    get_region_by_id(region_id).ok_or_else(|| DataError::RegionNotFound(region_id.to_string()))
}

fn resolve_indicator(indicator_id: &str) -> Result<&'static Indicator, DataError> {
    get_indicator_by_id(indicator_id)
        .ok_or_else(|| DataError::IndicatorNotFound(indicator_id.to_string()))
}

/// Builds a `map_err` adapter tagging a store failure with its key and operation
fn persistence<'a>(
    operation: &'static str,
    region: &'a Region,
    indicator: &'a Indicator,
) -> impl Fn(PersistenceError) -> DataError + 'a {
    move |source| DataError::Persistence {
        operation,
        key: cache_key(region.id, indicator.id),
        source,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::data::SOURCE_TAG_SAMPLE;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Series source with scripted answers and a call counter
    #[derive(Default)]
    struct StubSource {
        /// Answers consumed first, in order
        queued: Mutex<VecDeque<Result<Vec<SeriesPoint>, RemoteFetchError>>>,
        /// Per-series data filtered by the requested years
        by_series: Mutex<HashMap<String, Vec<SeriesPoint>>>,
        /// Answer once the queue is empty and the series has no entry
        default: Mutex<Option<Result<Vec<SeriesPoint>, RemoteFetchError>>>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl StubSource {
        fn returning(points: &[(i32, f64)]) -> Self {
            let source = Self::default();
            source.set_default(Ok(to_points(points)));
            source
        }

        fn failing(status: u16) -> Self {
            let source = Self::default();
            source.set_default(Err(RemoteFetchError::new(status, format!("HTTP {}", status))));
            source
        }

        fn set_default(&self, answer: Result<Vec<SeriesPoint>, RemoteFetchError>) {
            *self.default.lock() = Some(answer);
        }

        fn queue(&self, answer: Result<Vec<SeriesPoint>, RemoteFetchError>) {
            self.queued.lock().push_back(answer);
        }

        fn set_series(&self, series: &str, points: &[(i32, f64)]) {
            self.by_series.lock().insert(series.to_string(), to_points(points));
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl SeriesSource for StubSource {
        async fn fetch_series(
            &self,
            _region_code: &str,
            series_code: &str,
            start_year: i32,
            end_year: i32,
        ) -> Result<Vec<SeriesPoint>, RemoteFetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if let Some(answer) = self.queued.lock().pop_front() {
                return answer;
            }
            if let Some(points) = self.by_series.lock().get(series_code) {
                return Ok(points
                    .iter()
                    .filter(|p| p.year >= start_year && p.year <= end_year)
                    .copied()
                    .collect());
            }
            self.default.lock().clone().unwrap_or_else(|| Ok(Vec::new()))
        }
    }

    fn to_points(points: &[(i32, f64)]) -> Vec<SeriesPoint> {
        points.iter().map(|&(year, value)| SeriesPoint::new(year, value)).collect()
    }

    fn test_config() -> RefreshConfig {
        RefreshConfig {
            derived_request_delay: Duration::ZERO,
            retry: RetryPolicy::none(),
            ..RefreshConfig::default()
        }
    }

    fn create_service(source: Arc<StubSource>, config: RefreshConfig) -> (IndicatorService, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap(),
        ));
        let store = CacheStore::open_in_memory(24)
            .expect("Failed to open in-memory store")
            .with_clock(clock.clone());
        let service = IndicatorService::new(store, source, config).expect("Failed to create service");
        (service, clock)
    }

    #[test]
    fn test_refresh_config_default() {
        let config = RefreshConfig::default();
        assert!(config.use_live_source);
        assert!(config.fallback_on_failure);
        assert_eq!(config.ttl_hours, 24);
        assert_eq!((config.start_year, config.end_year), (1990, 2024));
        assert_eq!(config.derived_request_delay, Duration::from_millis(100));
        assert_eq!(config.request_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_retry_policy_backoff_doubles() {
        let policy = RetryPolicy {
            max_retries: 3,
            initial_backoff: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_configured_ttl_overrides_store_ttl() {
        let source = Arc::new(StubSource::returning(&[(2020, 1.0)]));
        let config = RefreshConfig {
            ttl_hours: 2,
            ..test_config()
        };
        let (service, clock) = create_service(source.clone(), config);

        service.get_latest_value("USA", "gdp_per_capita").await.unwrap();
        let freshness = service.store().freshness("USA", "gdp_per_capita").unwrap().unwrap();
        assert_eq!(freshness.expires_at - freshness.last_fetched_at, ChronoDuration::hours(2));

        clock.advance(ChronoDuration::hours(2));
        service.get_latest_value("USA", "gdp_per_capita").await.unwrap();
        assert_eq!(source.call_count(), 2);
    }

    #[test]
    fn test_oversized_ttl_is_invalid_config() {
        let store = CacheStore::open_in_memory(24).unwrap();
        let config = RefreshConfig {
            ttl_hours: u64::MAX,
            ..test_config()
        };

        let result = IndicatorService::new(store, Arc::new(StubSource::default()), config);

        assert!(matches!(
            result,
            Err(DataError::InvalidConfig(PersistenceError::InvalidTtl(u64::MAX)))
        ));
    }

    #[tokio::test]
    async fn test_cache_miss_fetches_then_serves_from_cache() {
        let source = Arc::new(StubSource::returning(&[(2021, 63000.0), (2020, 60000.0)]));
        let (service, _clock) = create_service(source.clone(), test_config());

        let first = service.get_series("gdp_per_capita", &["USA"]).await.unwrap();
        source.set_default(Ok(to_points(&[(2020, 1.0)])));
        let second = service.get_series("gdp_per_capita", &["USA"]).await.unwrap();

        assert_eq!(source.call_count(), 1);
        assert_eq!(first, second);
        let years: Vec<i32> = first.iter().map(|p| p.year).collect();
        assert_eq!(years, vec![2020, 2021]);
        assert!(first.iter().all(|p| p.source_tag == SOURCE_TAG_WORLD_BANK));
    }

    #[tokio::test]
    async fn test_expired_key_is_refreshed() {
        let source = Arc::new(StubSource::returning(&[(2020, 60000.0)]));
        let (service, clock) = create_service(source.clone(), test_config());
        service.get_series("gdp_per_capita", &["USA"]).await.unwrap();

        source.set_default(Ok(to_points(&[(2020, 61000.0), (2021, 64000.0)])));
        clock.advance(ChronoDuration::hours(25));
        let refreshed = service.get_series("gdp_per_capita", &["USA"]).await.unwrap();

        assert_eq!(source.call_count(), 2);
        assert_eq!(refreshed.len(), 2);
        assert_eq!(refreshed[0].value, 61000.0);
    }

    #[tokio::test]
    async fn test_fresh_after_refresh_stale_after_expiry() {
        let source = Arc::new(StubSource::returning(&[(2020, 1.0)]));
        let (service, clock) = create_service(source, test_config());

        service.get_latest_value("CHN", "capital_formation").await.unwrap();
        assert!(service.store().is_fresh("CHN", "capital_formation").unwrap());

        clock.advance(ChronoDuration::hours(24));
        assert!(!service.store().is_fresh("CHN", "capital_formation").unwrap());
    }

    #[tokio::test]
    async fn test_remote_failure_with_fallback_serves_sample_data() {
        let source = Arc::new(StubSource::failing(503));
        let (service, _clock) = create_service(source, test_config());

        let points = service.get_series("gdp_per_capita", &["USA"]).await.unwrap();

        assert!(!points.is_empty());
        assert!(points.iter().all(|p| p.region_id == "USA"
            && p.indicator_id == "gdp_per_capita"
            && p.source_tag == SOURCE_TAG_SAMPLE));
        assert!(
            service.store().freshness("USA", "gdp_per_capita").unwrap().is_none(),
            "Fallback must not write to the cache"
        );
        assert!(service.store().query_data_points("USA", "gdp_per_capita").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_failure_without_fallback_is_error() {
        let source = Arc::new(StubSource::failing(503));
        let config = RefreshConfig {
            fallback_on_failure: false,
            ..test_config()
        };
        let (service, _clock) = create_service(source, config);

        let err = service
            .get_series("gdp_per_capita", &["USA"])
            .await
            .expect_err("Remote failure should propagate");

        match err {
            DataError::Remote { region, indicator, source } => {
                assert_eq!(region, "USA");
                assert_eq!(indicator, "gdp_per_capita");
                assert_eq!(source.status, 503);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_rows() {
        let source = Arc::new(StubSource::returning(&[(2019, 1.0), (2020, 2.0), (2021, 3.0)]));
        let config = RefreshConfig {
            fallback_on_failure: false,
            ..test_config()
        };
        let (service, clock) = create_service(source.clone(), config);
        service.get_series("gdp_per_capita", &["EUU"]).await.unwrap();

        source.set_default(Err(RemoteFetchError::network("connection reset")));
        clock.advance(ChronoDuration::hours(30));
        let result = service.get_series("gdp_per_capita", &["EUU"]).await;

        assert!(matches!(result, Err(DataError::Remote { .. })));
        assert_eq!(service.store().query_data_points("EUU", "gdp_per_capita").unwrap().len(), 3);
        assert!(!service.store().is_fresh("EUU", "gdp_per_capita").unwrap());
    }

    #[tokio::test]
    async fn test_live_source_disabled_never_fetches() {
        let source = Arc::new(StubSource::returning(&[(2020, 1.0)]));
        let config = RefreshConfig {
            use_live_source: false,
            ..test_config()
        };
        let (service, _clock) = create_service(source.clone(), config);

        let points = service.get_series("rd_expenditure", &["EUU", "CHN"]).await.unwrap();
        let latest = service.get_latest_value("EUU", "rd_expenditure").await.unwrap();

        assert_eq!(source.call_count(), 0);
        assert_eq!(points.len(), 50);
        assert_eq!(points[0].region_id, "EUU");
        assert_eq!(points[25].region_id, "CHN");
        assert_eq!(latest.unwrap().source_tag, SOURCE_TAG_SAMPLE);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_not_found_even_with_fallback() {
        let source = Arc::new(StubSource::failing(500));
        let (service, _clock) = create_service(source.clone(), test_config());

        let region_err = service.get_series("gdp_per_capita", &["USA", "ATL"]).await.unwrap_err();
        let indicator_err = service.get_latest_value("USA", "happiness").await.unwrap_err();

        assert!(matches!(region_err, DataError::RegionNotFound(ref id) if id == "ATL"));
        assert!(matches!(indicator_err, DataError::IndicatorNotFound(ref id) if id == "happiness"));
        assert_eq!(source.call_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_region_list_is_invalid() {
        let (service, _clock) = create_service(Arc::new(StubSource::default()), test_config());

        let err = service.get_series("gdp_per_capita", &[]).await.unwrap_err();

        assert!(matches!(err, DataError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_growth_rate_from_cached_values() {
        let source = Arc::new(StubSource::returning(&[(2000, 100.0), (2010, 150.0), (2020, 200.0)]));
        let (service, _clock) = create_service(source, test_config());

        let rate = service
            .get_growth_rate("USA", "gdp_per_capita", 2000, 2020)
            .await
            .unwrap()
            .unwrap();

        assert!((rate - (2f64.powf(1.0 / 20.0) - 1.0)).abs() < 1e-6);
        assert!((rate - 0.03526).abs() < 1e-4);
    }

    #[tokio::test]
    async fn test_growth_rate_edge_cases_return_none() {
        let source = Arc::new(StubSource::returning(&[(2005, 0.0), (2010, 150.0), (2020, 200.0)]));
        let (service, _clock) = create_service(source, test_config());

        let same_year = service.get_growth_rate("USA", "gdp_per_capita", 2010, 2010).await.unwrap();
        let missing_start = service.get_growth_rate("USA", "gdp_per_capita", 2000, 2020).await.unwrap();
        let zero_start = service.get_growth_rate("USA", "gdp_per_capita", 2005, 2020).await.unwrap();
        let nearest_not_used = service.get_growth_rate("USA", "gdp_per_capita", 2011, 2020).await.unwrap();

        assert!(same_year.is_none());
        assert!(missing_start.is_none());
        assert!(zero_start.is_none());
        assert!(nearest_not_used.is_none());
    }

    #[tokio::test]
    async fn test_latest_value_is_max_year() {
        let source = Arc::new(StubSource::returning(&[(2022, 3.1), (2023, 2.5), (2021, 5.9)]));
        let (service, _clock) = create_service(source, test_config());

        let latest = service.get_latest_value("USA", "real_gdp_growth").await.unwrap().unwrap();

        assert_eq!(latest.year, 2023);
        assert_eq!(latest.value, 2.5);
    }

    #[tokio::test]
    async fn test_latest_value_empty_cache_is_none() {
        let source = Arc::new(StubSource::returning(&[]));
        let (service, _clock) = create_service(source, test_config());

        let latest = service.get_latest_value("USA", "real_gdp_growth").await.unwrap();

        assert!(latest.is_none());
        let freshness = service.store().freshness("USA", "real_gdp_growth").unwrap().unwrap();
        assert_eq!(freshness.record_count, 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let source = Arc::new(StubSource::returning(&[(2020, 1.0)]));
        let (service, _clock) = create_service(source.clone(), test_config());
        service.get_latest_value("USA", "gdp_per_capita").await.unwrap();

        assert!(service.invalidate("USA", "gdp_per_capita").unwrap());
        service.get_latest_value("USA", "gdp_per_capita").await.unwrap();

        assert_eq!(source.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_unknown_region_is_not_found() {
        let (service, _clock) = create_service(Arc::new(StubSource::default()), test_config());

        assert!(matches!(
            service.invalidate("MARS", "gdp_per_capita"),
            Err(DataError::RegionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_region_without_upstream_falls_back_without_fetching() {
        let source = Arc::new(StubSource::returning(&[(2020, 1.0)]));
        let (service, _clock) = create_service(source.clone(), test_config());

        let points = service.get_series("gdp_per_capita", &["BRC"]).await.unwrap();

        assert_eq!(source.call_count(), 0);
        assert!(points.iter().all(|p| p.source_tag == SOURCE_TAG_SAMPLE));
    }

    #[tokio::test]
    async fn test_derived_indicator_is_computed_and_cached() {
        let source = Arc::new(StubSource::default());
        source.set_series("NY.GDP.PCAP.PP.KD", &[(2020, 60000.0), (2021, 63000.0)]);
        source.set_series("SL.EMP.TOTL.SP.ZS", &[(2020, 60.0), (2021, 0.0)]);
        let config = RefreshConfig {
            start_year: 2020,
            end_year: 2022,
            ..test_config()
        };
        let (service, _clock) = create_service(source.clone(), config);

        let points = service.get_series("labor_productivity", &["USA"]).await.unwrap();

        // 2021 has a zero denominator and 2022 has no data at all
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].year, 2020);
        assert!((points[0].value - 100000.0).abs() < 1e-6);
        assert_eq!(source.call_count(), 6);
        let freshness = service.store().freshness("USA", "labor_productivity").unwrap().unwrap();
        assert_eq!(freshness.record_count, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let source = Arc::new(StubSource::returning(&[(2020, 1.0)]));
        source.queue(Err(RemoteFetchError::new(503, "HTTP 503")));
        let config = RefreshConfig {
            retry: RetryPolicy {
                max_retries: 2,
                initial_backoff: Duration::from_millis(1),
            },
            fallback_on_failure: false,
            ..test_config()
        };
        let (service, _clock) = create_service(source.clone(), config);

        let points = service.get_series("gdp_per_capita", &["USA"]).await.unwrap();

        assert_eq!(source.call_count(), 2);
        assert_eq!(points.len(), 1);
    }

    #[tokio::test]
    async fn test_client_errors_are_not_retried() {
        let source = Arc::new(StubSource::failing(400));
        let config = RefreshConfig {
            retry: RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(1),
            },
            fallback_on_failure: false,
            ..test_config()
        };
        let (service, _clock) = create_service(source.clone(), config);

        let result = service.get_series("gdp_per_capita", &["USA"]).await;

        assert!(result.is_err());
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_reads_refresh_once() {
        let source = Arc::new(StubSource {
            delay: Duration::from_millis(50),
            ..StubSource::returning(&[(2020, 1.0)])
        });
        let (service, _clock) = create_service(source.clone(), test_config());

        let (a, b) = tokio::join!(
            service.get_series("gdp_per_capita", &["USA"]),
            service.get_series("gdp_per_capita", &["USA"])
        );

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.call_count(), 1);
    }

    #[tokio::test]
    async fn test_multiple_regions_grouped_in_request_order() {
        let source = Arc::new(StubSource::returning(&[(2020, 1.0), (2021, 2.0)]));
        let (service, _clock) = create_service(source.clone(), test_config());

        let points = service.get_series("capital_formation", &["CHN", "EUU"]).await.unwrap();

        let regions: Vec<&str> = points.iter().map(|p| p.region_id.as_str()).collect();
        assert_eq!(regions, vec!["CHN", "CHN", "EUU", "EUU"]);
        assert_eq!(source.call_count(), 2);
    }
}
