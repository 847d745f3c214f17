//! Cache module for persisting indicator data to SQLite
//!
//! This module provides a cache store that keeps fetched data points, per-key
//! freshness metadata (TTL-based expiry plus an explicit validity flag) and an
//! append-only log of remote fetches. Writes replace a key's rows atomically so
//! readers never see a half-written series.

mod schema;
mod store;

pub use store::{cache_key, CacheFreshness, CacheStore, FetchLogEntry, PersistenceError, MAX_TTL_HOURS};
