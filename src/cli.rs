//! Command-line interface parsing for the trajectory indicator pipeline
//!
//! Global flags tune the refresh pipeline; subcommands map onto the read
//! operations of `IndicatorService` plus a few cache inspection commands.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::cache::MAX_TTL_HOURS;
use crate::refresh::{RefreshConfig, RetryPolicy};

/// Error types for CLI argument validation
#[derive(Debug, Error)]
pub enum CliError {
    /// The year range is reversed
    #[error("Invalid year range: start year {start} is after end year {end}")]
    InvalidYearRange { start: i32, end: i32 },

    /// The request timeout must be positive
    #[error("Invalid timeout: must be at least 1 second")]
    InvalidTimeout,

    /// The cache TTL is larger than the store accepts
    #[error("Invalid TTL: {0} hours exceeds the maximum of {max}", max = MAX_TTL_HOURS)]
    InvalidTtl(u64),
}

/// Trajectory - cached economic indicators for comparing regions
#[derive(Parser, Debug)]
#[command(name = "trajectory")]
#[command(about = "Cached World Bank indicators for comparing economic trajectories")]
#[command(version)]
pub struct Cli {
    /// Path to the cache database (defaults to the platform data directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub db: Option<PathBuf>,

    /// Hours a refreshed series stays fresh
    #[arg(long, global = true, default_value_t = 24, value_name = "HOURS")]
    pub ttl_hours: u64,

    /// Serve sample data only, never contacting the World Bank API
    #[arg(long, global = true)]
    pub no_live: bool,

    /// Fail instead of serving sample data when a refresh fails
    #[arg(long, global = true)]
    pub no_fallback: bool,

    /// Override the World Bank API base URL
    #[arg(long, global = true, value_name = "URL")]
    pub base_url: Option<String>,

    /// Per-request timeout in seconds
    #[arg(long, global = true, default_value_t = 10, value_name = "SECS")]
    pub timeout_secs: u64,

    /// Retries for transient upstream failures
    #[arg(long, global = true, default_value_t = 2)]
    pub retries: u32,

    /// First year requested on refresh
    #[arg(long, global = true, default_value_t = 1990, value_name = "YEAR")]
    pub start_year: i32,

    /// Last year requested on refresh
    #[arg(long, global = true, default_value_t = 2024, value_name = "YEAR")]
    pub end_year: i32,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print an indicator's series for one or more regions
    ///
    /// Example:
    ///   trajectory series gdp_per_capita USA EUU CHN
    Series {
        /// Indicator id, e.g. gdp_per_capita
        indicator: String,
        /// Region ids, e.g. USA EUU
        #[arg(required = true)]
        regions: Vec<String>,
    },

    /// Print the most recent value for a region and indicator
    Latest { region: String, indicator: String },

    /// Print the compound annual growth rate between two years
    Growth {
        region: String,
        indicator: String,
        start_year: i32,
        end_year: i32,
    },

    /// Force the next read of a series to refresh it
    Invalidate { region: String, indicator: String },

    /// Show freshness of every cached series
    Status,

    /// Show the most recent upstream requests
    FetchLog {
        /// Number of entries to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// List known regions and indicators
    Catalog,
}

impl Cli {
    /// Builds the refresh pipeline configuration from the global flags
    ///
    /// # Returns
    /// * `Ok(RefreshConfig)` with CLI overrides applied over the defaults
    /// * `Err(CliError)` if the year range, timeout or TTL is invalid
    pub fn refresh_config(&self) -> Result<RefreshConfig, CliError> {
        if self.start_year > self.end_year {
            return Err(CliError::InvalidYearRange {
                start: self.start_year,
                end: self.end_year,
            });
        }
        if self.timeout_secs == 0 {
            return Err(CliError::InvalidTimeout);
        }
        if self.ttl_hours > MAX_TTL_HOURS {
            return Err(CliError::InvalidTtl(self.ttl_hours));
        }

        let mut config = RefreshConfig {
            use_live_source: !self.no_live,
            fallback_on_failure: !self.no_fallback,
            ttl_hours: self.ttl_hours,
            start_year: self.start_year,
            end_year: self.end_year,
            request_timeout: Duration::from_secs(self.timeout_secs),
            ..RefreshConfig::default()
        };
        config.retry = RetryPolicy {
            max_retries: self.retries,
            ..config.retry
        };
        if let Some(base_url) = &self.base_url {
            config.base_url = base_url.clone();
        }
        Ok(config)
    }
}
