//! SQLite schema DDL and reference-data seeding for the cache store
//!
//! Every statement uses `CREATE … IF NOT EXISTS` so initialization can be
//! replayed on an existing database file.

use rusqlite::{params, Connection};
use tracing::info;

use crate::data::{all_indicators, all_regions};

/// Core DDL statements: 5 CREATE TABLE + 2 CREATE INDEX.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS regions (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        remote_code TEXT,
        color TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS indicators (
        id TEXT PRIMARY KEY,
        internal_id TEXT NOT NULL UNIQUE,
        name TEXT NOT NULL,
        unit TEXT NOT NULL,
        description TEXT NOT NULL,
        category TEXT NOT NULL,
        remote_series_code TEXT,
        calculation_method TEXT NOT NULL
    );",
    "CREATE TABLE IF NOT EXISTS data_points (
        region_id TEXT NOT NULL,
        indicator_id TEXT NOT NULL,
        year INTEGER NOT NULL,
        value REAL NOT NULL,
        source_tag TEXT NOT NULL,
        PRIMARY KEY (region_id, indicator_id, year)
    );",
    "CREATE TABLE IF NOT EXISTS cache_metadata (
        cache_key TEXT PRIMARY KEY,
        region_id TEXT NOT NULL,
        indicator_id TEXT NOT NULL,
        last_fetch INTEGER NOT NULL,
        cache_expires INTEGER NOT NULL,
        record_count INTEGER NOT NULL,
        is_valid INTEGER NOT NULL DEFAULT 1
    );",
    "CREATE TABLE IF NOT EXISTS fetch_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        indicator_id TEXT NOT NULL,
        region_id TEXT NOT NULL,
        records_fetched INTEGER NOT NULL,
        status INTEGER NOT NULL,
        response_time_ms INTEGER NOT NULL,
        error_message TEXT,
        timestamp INTEGER NOT NULL
    );",
    "CREATE INDEX IF NOT EXISTS idx_data_points_key ON data_points(region_id, indicator_id);",
    "CREATE INDEX IF NOT EXISTS idx_fetch_log_timestamp ON fetch_log(timestamp);",
];

/// Creates all tables and seeds the reference catalog on first use.
///
/// Seeding only happens when the `regions` table is empty, so calling this
/// on every open never duplicates catalog rows.
pub fn initialize(conn: &mut Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA journal_mode = WAL;")?;
    for stmt in SCHEMA_STATEMENTS {
        conn.execute_batch(stmt)?;
    }

    let region_count: i64 = conn.query_row("SELECT COUNT(*) FROM regions", [], |row| row.get(0))?;
    if region_count == 0 {
        seed_reference_data(conn)?;
    }
    Ok(())
}

/// Inserts every catalog region and indicator in a single transaction.
fn seed_reference_data(conn: &mut Connection) -> rusqlite::Result<()> {
    let tx = conn.transaction()?;
    {
        let mut insert_region = tx.prepare(
            "INSERT OR IGNORE INTO regions (id, name, remote_code, color) VALUES (?1, ?2, ?3, ?4)",
        )?;
        for region in all_regions() {
            insert_region.execute(params![
                region.id,
                region.name,
                region.remote_source_code,
                region.color
            ])?;
        }

        let mut insert_indicator = tx.prepare(
            "INSERT OR IGNORE INTO indicators (
                id, internal_id, name, unit, description, category, remote_series_code, calculation_method
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        )?;
        for indicator in all_indicators() {
            // Upstream code doubles as the primary key; derived indicators use their internal id
            let row_id = indicator.remote_series_code.unwrap_or(indicator.id);
            insert_indicator.execute(params![
                row_id,
                indicator.id,
                indicator.name,
                indicator.unit,
                indicator.description,
                indicator.category,
                indicator.remote_series_code,
                indicator.calculation_method.as_str()
            ])?;
        }
    }
    tx.commit()?;

    info!(
        regions = all_regions().len(),
        indicators = all_indicators().len(),
        "Seeded reference catalog"
    );
    Ok(())
}
