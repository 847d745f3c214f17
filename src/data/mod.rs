//! Core data models for the trajectory indicator pipeline
//!
//! This module contains the reference catalog types (regions and indicators),
//! the time-series points served to callers, and the clients that produce them:
//! the World Bank adapter, the derived-metric calculator and the sample fallback.

pub mod catalog;
pub mod derived;
pub mod sample;
pub mod world_bank;

pub use catalog::{all_indicators, all_regions, get_indicator_by_id, get_region_by_id};
pub use derived::{DerivationGap, DerivedSeries, GapReason};
pub use world_bank::{RemoteFetchError, SeriesSource, WorldBankClient};

use serde::{Deserialize, Serialize};

/// Source tag stored on points fetched from the World Bank API
pub const SOURCE_TAG_WORLD_BANK: &str = "worldbank";

/// Source tag carried by points produced by the sample fallback
pub const SOURCE_TAG_SAMPLE: &str = "sample";

/// A region whose indicators can be compared
///
/// Uses `&'static str` for string fields to allow static initialization
/// of the catalog. Only implements `Serialize`; look regions up by id with
/// `get_region_by_id` instead of deserializing them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Region {
    /// Stable region code (e.g. "EUU")
    pub id: &'static str,
    /// Human-readable name of the region
    pub name: &'static str,
    /// Country or aggregate code understood by the World Bank API.
    /// `None` for regions without an upstream aggregate.
    pub remote_source_code: Option<&'static str>,
    /// Chart color used by the dashboard
    pub color: &'static str,
}

/// How an indicator's values are obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CalculationMethod {
    /// Fetched directly from a single upstream series
    Direct,
    /// Computed from two upstream series
    Calculated,
}

impl CalculationMethod {
    /// Returns the value persisted in the `indicators.calculation_method` column
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationMethod::Direct => "direct",
            CalculationMethod::Calculated => "calculated",
        }
    }
}

/// The two upstream series a calculated indicator is derived from
///
/// Values are combined per year as `numerator / (denominator / 100)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Derivation {
    pub numerator_series: &'static str,
    /// Percentage series, converted to a fraction before dividing
    pub denominator_series: &'static str,
}

/// An economic indicator tracked by the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Indicator {
    /// Internal identifier (e.g. "gdp_per_capita")
    pub id: &'static str,
    /// Human-readable name
    pub name: &'static str,
    /// Unit of the values (e.g. "USD", "% of GDP")
    pub unit: &'static str,
    pub description: &'static str,
    pub category: &'static str,
    /// World Bank series code, `None` for purely derived indicators
    pub remote_series_code: Option<&'static str>,
    pub calculation_method: CalculationMethod,
    /// Present when `calculation_method` is `Calculated`
    pub derivation: Option<Derivation>,
}

/// A single (year, value) observation as returned by a series source
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub year: i32,
    pub value: f64,
}

impl SeriesPoint {
    pub fn new(year: i32, value: f64) -> Self {
        Self { year, value }
    }
}

/// A stored observation for one region, indicator and year
///
/// At most one point exists per (region, indicator, year).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub region_id: String,
    pub indicator_id: String,
    pub year: i32,
    pub value: f64,
    /// Where the value came from ("worldbank" or "sample")
    pub source_tag: String,
}

/// Compound annual growth rate between two observations
///
/// Computes `(end_value / start_value)^(1 / (end_year - start_year)) - 1`.
///
/// # Returns
/// * `Some(rate)` when the inputs describe a finite growth rate
/// * `None` when the years are equal, the start value is not positive,
///   or the result is not finite
pub fn compound_growth_rate(
    start_year: i32,
    start_value: f64,
    end_year: i32,
    end_value: f64,
) -> Option<f64> {
    let years = end_year - start_year;
    if years == 0 || start_value <= 0.0 || !start_value.is_finite() || !end_value.is_finite() {
        return None;
    }

    let rate = (end_value / start_value).powf(1.0 / f64::from(years)) - 1.0;
    rate.is_finite().then_some(rate)
}
