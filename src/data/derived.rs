//! Derived indicator calculation
//!
//! Some indicators have no upstream series of their own. Labor productivity is
//! computed per year as GDP per capita divided by the employment rate (a
//! percentage), from two single-year requests against the series source.

use std::time::Duration;
use tracing::{debug, info};

use super::world_bank::{RemoteFetchError, SeriesSource};
use super::{Derivation, SeriesPoint};

/// Why a year is missing from a derived series
#[derive(Debug, Clone, PartialEq)]
pub enum GapReason {
    /// The numerator series had no value for the year
    MissingNumerator,
    /// The denominator series had no value for the year
    MissingDenominator,
    /// The combination produced a non-finite or undefined value
    NonFinite,
    /// One of the two requests failed
    FetchFailed(RemoteFetchError),
}

/// A year skipped while deriving a series
#[derive(Debug, Clone, PartialEq)]
pub struct DerivationGap {
    pub year: i32,
    pub reason: GapReason,
}

/// Result of a derivation: the computed points plus the years that were skipped
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivedSeries {
    /// Computed points, ascending by year
    pub points: Vec<SeriesPoint>,
    pub gaps: Vec<DerivationGap>,
}

/// Computes derived series from two upstream series, one year at a time
pub struct DerivedMetricCalculator<'a> {
    source: &'a dyn SeriesSource,
    /// Pause between consecutive years to stay under upstream rate limits
    request_delay: Duration,
}

impl<'a> DerivedMetricCalculator<'a> {
    pub fn new(source: &'a dyn SeriesSource, request_delay: Duration) -> Self {
        Self {
            source,
            request_delay,
        }
    }

    /// Derives a series for `region_code` over `start_year..=end_year`
    ///
    /// A year whose inputs are missing, fail to fetch or combine to a
    /// non-finite value is skipped and recorded as a gap; the remaining years
    /// are still computed.
    ///
    /// # Returns
    /// * `Ok(DerivedSeries)` - Possibly partial series with its gaps
    /// * `Err(RemoteFetchError)` - No year produced a point and at least one
    ///   request failed, so an empty result cannot be trusted
    pub async fn compute(
        &self,
        region_code: &str,
        derivation: &Derivation,
        start_year: i32,
        end_year: i32,
    ) -> Result<DerivedSeries, RemoteFetchError> {
        let mut series = DerivedSeries::default();

        for year in start_year..=end_year {
            if year > start_year && !self.request_delay.is_zero() {
                tokio::time::sleep(self.request_delay).await;
            }

            match self.compute_year(region_code, derivation, year).await {
                Ok(value) => series.points.push(SeriesPoint::new(year, value)),
                Err(reason) => {
                    debug!(region_code, year, ?reason, "Skipping derived year");
                    series.gaps.push(DerivationGap { year, reason });
                }
            }
        }

        if series.points.is_empty() {
            if let Some(err) = total_failure(&series.gaps) {
                return Err(err);
            }
        }

        info!(
            region_code,
            numerator = derivation.numerator_series,
            denominator = derivation.denominator_series,
            points = series.points.len(),
            gaps = series.gaps.len(),
            "Derived series computed"
        );
        Ok(series)
    }

    /// Fetches both inputs for one year and combines them
    async fn compute_year(
        &self,
        region_code: &str,
        derivation: &Derivation,
        year: i32,
    ) -> Result<f64, GapReason> {
        let numerator = self
            .source
            .fetch_series(region_code, derivation.numerator_series, year, year)
            .await
            .map_err(GapReason::FetchFailed)?;
        let denominator = self
            .source
            .fetch_series(region_code, derivation.denominator_series, year, year)
            .await
            .map_err(GapReason::FetchFailed)?;

        let numerator = value_for_year(&numerator, year).ok_or(GapReason::MissingNumerator)?;
        let denominator = value_for_year(&denominator, year).ok_or(GapReason::MissingDenominator)?;

        combine(numerator, denominator).ok_or(GapReason::NonFinite)
    }
}

/// Picks the value for `year`, falling back to the only point of a single-year response
fn value_for_year(points: &[SeriesPoint], year: i32) -> Option<f64> {
    points
        .iter()
        .find(|p| p.year == year)
        .or_else(|| points.first())
        .map(|p| p.value)
}

/// `numerator / (denominator / 100)`, or `None` when undefined
fn combine(numerator: f64, denominator_percent: f64) -> Option<f64> {
    let fraction = denominator_percent / 100.0;
    if fraction <= 0.0 {
        return None;
    }
    let value = numerator / fraction;
    value.is_finite().then_some(value)
}

/// The last request error among the gaps, if any
fn total_failure(gaps: &[DerivationGap]) -> Option<RemoteFetchError> {
    gaps.iter().rev().find_map(|gap| match &gap.reason {
        GapReason::FetchFailed(err) => Some(err.clone()),
        _ => None,
    })
}
