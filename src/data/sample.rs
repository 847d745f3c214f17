//! Deterministic sample data used when the live pipeline is off or failing
//!
//! Each region × indicator series follows a compound-growth trend with a small
//! amount of pseudo-random noise derived from a hash of the key, plus the 2008-09
//! financial crisis and 2020 pandemic shocks. The same inputs always produce
//! the same values.

use super::{compound_growth_rate, DataPoint, SOURCE_TAG_SAMPLE};

/// First year of generated sample data
pub const SAMPLE_START_YEAR: i32 = 2000;

/// Last year of generated sample data
pub const SAMPLE_END_YEAR: i32 = 2024;

/// Base value (at `SAMPLE_START_YEAR`) and yearly growth rate for a key
fn trend_parameters(region_id: &str, indicator_id: &str) -> Option<(f64, f64)> {
    let params = match (indicator_id, region_id) {
        ("gdp_per_capita", "EUU") => (28000.0, 0.015),
        ("gdp_per_capita", "USA") => (45000.0, 0.018),
        ("gdp_per_capita", "CHN") => (8000.0, 0.065),
        ("gdp_per_capita", "BRC") => (15000.0, 0.035),

        ("real_gdp_growth", "EUU") => (1.8, -0.002),
        ("real_gdp_growth", "USA") => (2.2, -0.001),
        ("real_gdp_growth", "CHN") => (7.5, -0.008),
        ("real_gdp_growth", "BRC") => (4.2, -0.003),

        ("rd_expenditure", "EUU") => (2.1, 0.025),
        ("rd_expenditure", "USA") => (3.2, 0.012),
        ("rd_expenditure", "CHN") => (2.4, 0.045),
        ("rd_expenditure", "BRC") => (1.8, 0.018),

        ("capital_formation", "EUU") => (20.5, -0.005),
        ("capital_formation", "USA") => (21.2, 0.002),
        ("capital_formation", "CHN") => (42.8, -0.012),
        ("capital_formation", "BRC") => (28.5, 0.008),

        ("labor_productivity", "EUU") => (100.0, 0.012),
        ("labor_productivity", "USA") => (115.0, 0.015),
        ("labor_productivity", "CHN") => (85.0, 0.055),
        ("labor_productivity", "BRC") => (92.0, 0.025),

        _ => return None,
    };
    Some(params)
}

/// Pseudo-random value in `[-0.5, 0.5)` fixed for a (region, indicator, year) triple
fn noise(region_id: &str, indicator_id: &str, year: i32) -> f64 {
    // FNV-1a over the key, then a splitmix64 finalizer
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in region_id
        .bytes()
        .chain([b'/'])
        .chain(indicator_id.bytes())
        .chain(year.to_le_bytes())
    {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash = (hash ^ (hash >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    hash = (hash ^ (hash >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    hash ^= hash >> 31;

    (hash >> 11) as f64 / (1u64 << 53) as f64 - 0.5
}

/// Value of one sample year
fn sample_value(region_id: &str, indicator_id: &str, base: f64, growth: f64, year: i32) -> f64 {
    let elapsed = year - SAMPLE_START_YEAR;
    let noise = noise(region_id, indicator_id, year);

    let mut value = match indicator_id {
        "real_gdp_growth" => {
            // Oscillates around a slowly drifting trend
            let trend = base + growth * f64::from(elapsed);
            let cyclical = (f64::from(elapsed) * 0.5).sin() * 1.5;
            trend + cyclical + noise * 0.8
        }
        "rd_expenditure" | "capital_formation" => {
            let trend = base * (1.0 + growth).powi(elapsed);
            trend + noise * base * 0.1
        }
        _ => {
            let trend = base * (1.0 + growth).powi(elapsed);
            trend + noise * trend * 0.05
        }
    };

    // Financial crisis
    if year == 2008 || year == 2009 {
        match indicator_id {
            "gdp_per_capita" => value *= if region_id == "CHN" { 0.98 } else { 0.95 },
            "real_gdp_growth" => value -= if region_id == "CHN" { 2.0 } else { 3.0 },
            _ => {}
        }
    }
    // Pandemic
    if year == 2020 {
        match indicator_id {
            "gdp_per_capita" => value *= 0.93,
            "real_gdp_growth" => value -= 5.0,
            _ => {}
        }
    }

    value.max(0.0)
}

/// Sample series for a key, ascending by year
///
/// Returns an empty vector for unknown region or indicator ids.
pub fn sample_series(region_id: &str, indicator_id: &str) -> Vec<DataPoint> {
    let Some((base, growth)) = trend_parameters(region_id, indicator_id) else {
        return Vec::new();
    };

    (SAMPLE_START_YEAR..=SAMPLE_END_YEAR)
        .map(|year| DataPoint {
            region_id: region_id.to_string(),
            indicator_id: indicator_id.to_string(),
            year,
            value: sample_value(region_id, indicator_id, base, growth, year),
            source_tag: SOURCE_TAG_SAMPLE.to_string(),
        })
        .collect()
}

/// Most recent sample point for a key
pub fn sample_latest(region_id: &str, indicator_id: &str) -> Option<DataPoint> {
    sample_series(region_id, indicator_id).pop()
}

/// Sample point for exactly `year`
pub fn sample_point(region_id: &str, indicator_id: &str, year: i32) -> Option<DataPoint> {
    sample_series(region_id, indicator_id)
        .into_iter()
        .find(|point| point.year == year)
}

/// Compound growth rate between two sample years
///
/// Same rules as the cached path: both years must exist exactly and the
/// start value must be positive.
pub fn sample_growth_rate(
    region_id: &str,
    indicator_id: &str,
    start_year: i32,
    end_year: i32,
) -> Option<f64> {
    let start = sample_point(region_id, indicator_id, start_year)?;
    let end = sample_point(region_id, indicator_id, end_year)?;
    compound_growth_rate(start.year, start.value, end.year, end.value)
}
