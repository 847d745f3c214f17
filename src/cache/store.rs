//! SQLite-backed cache store for indicator time series
//!
//! Provides a `CacheStore` that persists fetched data points together with
//! per-key freshness metadata and an append-only fetch log. Freshness is
//! decided against an injectable `Clock`.

use chrono::{DateTime, Duration, Utc};
use directories::ProjectDirs;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::schema;
use crate::clock::{Clock, SystemClock};
use crate::data::{DataPoint, SeriesPoint};

/// File name of the cache database inside the data directory
const DATABASE_FILE: &str = "trajectory.db";

/// Longest accepted TTL (100 years)
pub const MAX_TTL_HOURS: u64 = 24 * 365 * 100;

/// Errors raised by the cache store
#[derive(Debug, Error)]
pub enum PersistenceError {
    /// SQLite rejected a statement
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Creating the database directory failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// No home/data directory could be determined
    #[error("Could not determine a data directory for the cache database")]
    NoDataDir,

    /// The TTL is outside `0..=MAX_TTL_HOURS`
    #[error("Invalid cache TTL: {0} hours (maximum {max})", max = MAX_TTL_HOURS)]
    InvalidTtl(u64),

    /// A stored row could not be converted back into a domain value
    #[error("Corrupt cache row: {0}")]
    Corrupt(String),
}

/// Freshness metadata for one region + indicator pair
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheFreshness {
    pub region_id: String,
    pub indicator_id: String,
    pub last_fetched_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub record_count: u64,
    pub is_valid: bool,
}

impl CacheFreshness {
    /// A key is fresh when it is still valid and `now` is before expiry
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        self.is_valid && now < self.expires_at
    }
}

/// One audit record of a call to the remote statistics API
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FetchLogEntry {
    /// Series code that was requested
    pub indicator_id: String,
    /// Region code that was requested
    pub region_id: String,
    pub records_fetched: u64,
    /// HTTP status, or 0 when the request never got a response
    pub http_status: u16,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Builds the `cache_metadata` primary key for a region + indicator pair
pub fn cache_key(region_id: &str, indicator_id: &str) -> String {
    format!("{}-{}", region_id, indicator_id)
}

/// Persistent cache of indicator data
///
/// Cloning is cheap: clones share one connection guarded by a mutex. The
/// schema is created and the reference catalog seeded when the store is opened.
#[derive(Debug, Clone)]
pub struct CacheStore {
    conn: Arc<Mutex<Connection>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    /// Opens the store at the XDG-compliant default location
    ///
    /// Uses `~/.local/share/trajectory/trajectory.db` on Linux, or the
    /// equivalent data directory on other platforms.
    pub fn open_default(ttl_hours: u64) -> Result<Self, PersistenceError> {
        Self::open(Self::default_path()?, ttl_hours)
    }

    /// Returns the default database path
    pub fn default_path() -> Result<PathBuf, PersistenceError> {
        let project_dirs =
            ProjectDirs::from("", "", "trajectory").ok_or(PersistenceError::NoDataDir)?;
        Ok(project_dirs.data_dir().join(DATABASE_FILE))
    }

    /// Opens (creating if needed) the store at `path`
    ///
    /// # Arguments
    /// * `path` - Database file; missing parent directories are created
    /// * `ttl_hours` - How long refreshed data stays fresh
    pub fn open(path: impl AsRef<Path>, ttl_hours: u64) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        debug!(path = %path.display(), "Opening cache database");
        Self::from_connection(Connection::open(path)?, ttl_hours)
    }

    /// Opens a private in-memory store, mostly useful in tests
    pub fn open_in_memory(ttl_hours: u64) -> Result<Self, PersistenceError> {
        Self::from_connection(Connection::open_in_memory()?, ttl_hours)
    }

    fn from_connection(mut conn: Connection, ttl_hours: u64) -> Result<Self, PersistenceError> {
        let ttl = ttl_from_hours(ttl_hours)?;
        schema::initialize(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            ttl,
            clock: Arc::new(SystemClock),
        })
    }

    /// Replaces the TTL applied to subsequent refreshes
    ///
    /// # Returns
    /// * `Err(PersistenceError::InvalidTtl)` if `ttl_hours` exceeds `MAX_TTL_HOURS`
    pub fn with_ttl_hours(mut self, ttl_hours: u64) -> Result<Self, PersistenceError> {
        self.ttl = ttl_from_hours(ttl_hours)?;
        Ok(self)
    }

    /// TTL applied when a key is refreshed
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Replaces the time source used for freshness decisions
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Current time according to the store's clock
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Returns whether the key has valid, unexpired data
    pub fn is_fresh(&self, region_id: &str, indicator_id: &str) -> Result<bool, PersistenceError> {
        let now = self.clock.now();
        Ok(self
            .freshness(region_id, indicator_id)?
            .is_some_and(|freshness| freshness.is_fresh_at(now)))
    }

    /// Reads the freshness row for a key, if one has ever been written
    pub fn freshness(
        &self,
        region_id: &str,
        indicator_id: &str,
    ) -> Result<Option<CacheFreshness>, PersistenceError> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT region_id, indicator_id, last_fetch, cache_expires, record_count, is_valid
                 FROM cache_metadata WHERE cache_key = ?1",
                params![cache_key(region_id, indicator_id)],
                freshness_columns,
            )
            .optional()?;
        row.map(freshness_from_columns).transpose()
    }

    /// Lists every freshness row ordered by key
    pub fn all_freshness(&self) -> Result<Vec<CacheFreshness>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT region_id, indicator_id, last_fetch, cache_expires, record_count, is_valid
             FROM cache_metadata ORDER BY cache_key",
        )?;
        let rows = stmt
            .query_map([], freshness_columns)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(freshness_from_columns).collect()
    }

    /// Atomically replaces every stored point for a key
    ///
    /// Deletes the existing rows and inserts `points` in one transaction; if
    /// anything fails the previous rows stay visible. Non-finite values are
    /// skipped.
    ///
    /// # Returns
    /// * `Ok(count)` - Number of rows actually inserted
    pub fn replace_data_points(
        &self,
        region_id: &str,
        indicator_id: &str,
        points: &[SeriesPoint],
        source_tag: &str,
    ) -> Result<usize, PersistenceError> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = write_points(&tx, region_id, indicator_id, points, source_tag)?;
        tx.commit()?;

        debug!(region_id, indicator_id, inserted, "Replaced cached data points");
        Ok(inserted)
    }

    /// Marks a key as freshly fetched
    ///
    /// Overwrites the freshness row with `last_fetch = now`,
    /// `expires = now + ttl`, `is_valid = true` and the given record count.
    pub fn update_freshness(
        &self,
        region_id: &str,
        indicator_id: &str,
        record_count: usize,
    ) -> Result<(), PersistenceError> {
        let now = self.clock.now();
        let expires_at = self.expires_at(now)?;
        let conn = self.conn.lock();
        write_freshness(&conn, region_id, indicator_id, record_count, now, expires_at)?;
        Ok(())
    }

    /// Stores the result of a successful refresh
    ///
    /// Replaces the key's points and rewrites its freshness row (counting
    /// only the rows actually inserted) in a single transaction, so readers
    /// see either the old series with its old metadata or the new pair.
    ///
    /// # Returns
    /// * `Ok(count)` - Number of rows inserted and recorded as the record count
    pub fn commit_refresh(
        &self,
        region_id: &str,
        indicator_id: &str,
        points: &[SeriesPoint],
        source_tag: &str,
    ) -> Result<usize, PersistenceError> {
        let now = self.clock.now();
        let expires_at = self.expires_at(now)?;
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let inserted = write_points(&tx, region_id, indicator_id, points, source_tag)?;
        write_freshness(&tx, region_id, indicator_id, inserted, now, expires_at)?;
        tx.commit()?;

        debug!(region_id, indicator_id, inserted, "Committed refreshed series");
        Ok(inserted)
    }

    /// Flags a key as invalid so the next read refreshes it
    ///
    /// # Returns
    /// * `Ok(true)` if a freshness row existed and was invalidated
    /// * `Ok(false)` if the key has never been refreshed
    pub fn invalidate(&self, region_id: &str, indicator_id: &str) -> Result<bool, PersistenceError> {
        let conn = self.conn.lock();
        let updated = conn.execute(
            "UPDATE cache_metadata SET is_valid = 0 WHERE cache_key = ?1",
            params![cache_key(region_id, indicator_id)],
        )?;
        Ok(updated > 0)
    }

    /// Returns every stored point for a key, ordered by year ascending
    pub fn query_data_points(
        &self,
        region_id: &str,
        indicator_id: &str,
    ) -> Result<Vec<DataPoint>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT region_id, indicator_id, year, value, source_tag FROM data_points
             WHERE region_id = ?1 AND indicator_id = ?2
             ORDER BY year ASC",
        )?;
        let points = stmt
            .query_map(params![region_id, indicator_id], data_point_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(points)
    }

    /// Returns the point with the highest year, if any
    pub fn query_latest(
        &self,
        region_id: &str,
        indicator_id: &str,
    ) -> Result<Option<DataPoint>, PersistenceError> {
        let conn = self.conn.lock();
        let point = conn
            .query_row(
                "SELECT region_id, indicator_id, year, value, source_tag FROM data_points
                 WHERE region_id = ?1 AND indicator_id = ?2
                 ORDER BY year DESC LIMIT 1",
                params![region_id, indicator_id],
                data_point_from_row,
            )
            .optional()?;
        Ok(point)
    }

    /// Returns the point stored for exactly `year`, if any
    pub fn query_point(
        &self,
        region_id: &str,
        indicator_id: &str,
        year: i32,
    ) -> Result<Option<DataPoint>, PersistenceError> {
        let conn = self.conn.lock();
        let point = conn
            .query_row(
                "SELECT region_id, indicator_id, year, value, source_tag FROM data_points
                 WHERE region_id = ?1 AND indicator_id = ?2 AND year = ?3",
                params![region_id, indicator_id, year],
                data_point_from_row,
            )
            .optional()?;
        Ok(point)
    }

    /// Appends an entry to the fetch log
    pub fn append_fetch_log(&self, entry: &FetchLogEntry) -> Result<(), PersistenceError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO fetch_log (
                indicator_id, region_id, records_fetched, status, response_time_ms, error_message, timestamp
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entry.indicator_id,
                entry.region_id,
                entry.records_fetched as i64,
                entry.http_status,
                entry.response_time_ms as i64,
                entry.error_message,
                entry.timestamp.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    /// Returns the most recent fetch log entries, newest first
    pub fn recent_fetch_log(&self, limit: usize) -> Result<Vec<FetchLogEntry>, PersistenceError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT indicator_id, region_id, records_fetched, status, response_time_ms, error_message, timestamp
             FROM fetch_log ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, u16>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(
                |(indicator_id, region_id, records, status, elapsed, error_message, timestamp)| {
                    Ok(FetchLogEntry {
                        indicator_id,
                        region_id,
                        records_fetched: records.max(0) as u64,
                        http_status: status,
                        response_time_ms: elapsed.max(0) as u64,
                        error_message,
                        timestamp: millis_to_datetime(timestamp)?,
                    })
                },
            )
            .collect()
    }

    /// Number of seeded regions
    pub fn region_count(&self) -> Result<usize, PersistenceError> {
        self.count("SELECT COUNT(*) FROM regions")
    }

    /// Number of seeded indicators
    pub fn indicator_count(&self) -> Result<usize, PersistenceError> {
        self.count("SELECT COUNT(*) FROM indicators")
    }

    fn expires_at(&self, fetched_at: DateTime<Utc>) -> Result<DateTime<Utc>, PersistenceError> {
        fetched_at.checked_add_signed(self.ttl).ok_or_else(|| {
            PersistenceError::Corrupt(format!("expiry overflows for fetch at {}", fetched_at))
        })
    }

    fn count(&self, sql: &str) -> Result<usize, PersistenceError> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn ttl_from_hours(ttl_hours: u64) -> Result<Duration, PersistenceError> {
    if ttl_hours > MAX_TTL_HOURS {
        return Err(PersistenceError::InvalidTtl(ttl_hours));
    }
    Ok(Duration::hours(ttl_hours as i64))
}

type FreshnessColumns = (String, String, i64, i64, i64, bool);

/// Deletes a key's rows and inserts the finite points, returning the insert count
fn write_points(
    conn: &Connection,
    region_id: &str,
    indicator_id: &str,
    points: &[SeriesPoint],
    source_tag: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "DELETE FROM data_points WHERE region_id = ?1 AND indicator_id = ?2",
        params![region_id, indicator_id],
    )?;

    let mut insert = conn.prepare(
        "INSERT INTO data_points (region_id, indicator_id, year, value, source_tag)
         VALUES (?1, ?2, ?3, ?4, ?5)",
    )?;
    let mut inserted = 0;
    for point in points.iter().filter(|p| p.value.is_finite()) {
        insert.execute(params![region_id, indicator_id, point.year, point.value, source_tag])?;
        inserted += 1;
    }
    Ok(inserted)
}

/// Overwrites the freshness row for a key
fn write_freshness(
    conn: &Connection,
    region_id: &str,
    indicator_id: &str,
    record_count: usize,
    fetched_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO cache_metadata (
            cache_key, region_id, indicator_id, last_fetch, cache_expires, record_count, is_valid
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
        params![
            cache_key(region_id, indicator_id),
            region_id,
            indicator_id,
            fetched_at.timestamp_millis(),
            expires_at.timestamp_millis(),
            record_count as i64
        ],
    )?;
    Ok(())
}

fn freshness_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<FreshnessColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn freshness_from_columns(columns: FreshnessColumns) -> Result<CacheFreshness, PersistenceError> {
    let (region_id, indicator_id, last_fetch, expires, record_count, is_valid) = columns;
    Ok(CacheFreshness {
        region_id,
        indicator_id,
        last_fetched_at: millis_to_datetime(last_fetch)?,
        expires_at: millis_to_datetime(expires)?,
        record_count: record_count.max(0) as u64,
        is_valid,
    })
}

fn data_point_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<DataPoint> {
    Ok(DataPoint {
        region_id: row.get(0)?,
        indicator_id: row.get(1)?,
        year: row.get(2)?,
        value: row.get(3)?,
        source_tag: row.get(4)?,
    })
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| PersistenceError::Corrupt(format!("timestamp out of range: {}", millis)))
}
