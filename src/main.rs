//! Trajectory - cached economic indicators for comparing regions
//!
//! Reads World Bank indicators through a local SQLite cache, refreshing stale
//! series on demand and falling back to sample data when the API is unavailable.
//! Results are printed to stdout as JSON; logs go to stderr.

use std::error::Error;
use std::io;
use std::process::ExitCode;

use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::debug;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use trajectory::cache::CacheStore;
use trajectory::cli::{Cli, Command};
use trajectory::data::{all_indicators, all_regions};
use trajectory::refresh::IndicatorService;

/// Installs the global tracing subscriber
///
/// Honors `RUST_LOG`, defaulting to `info`.
fn init_tracing(json_logs: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);

    if json_logs {
        registry
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        registry
            .with(fmt::layer().with_target(false).with_writer(io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = cli.refresh_config()?;

    let store = match &cli.db {
        Some(path) => CacheStore::open(path, config.ttl_hours)?,
        None => CacheStore::open_default(config.ttl_hours)?,
    };
    debug!(
        regions = store.region_count()?,
        indicators = store.indicator_count()?,
        "Opened cache store"
    );

    let service = IndicatorService::with_world_bank(store, config)?;

    match cli.command {
        Command::Series { indicator, regions } => {
            let region_ids: Vec<&str> = regions.iter().map(String::as_str).collect();
            let points = service.get_series(&indicator, &region_ids).await?;
            print_json(&points)
        }
        Command::Latest { region, indicator } => {
            let latest = service.get_latest_value(&region, &indicator).await?;
            print_json(&latest)
        }
        Command::Growth {
            region,
            indicator,
            start_year,
            end_year,
        } => {
            let rate = service
                .get_growth_rate(&region, &indicator, start_year, end_year)
                .await?;
            print_json(&json!({
                "region": region,
                "indicator": indicator,
                "start_year": start_year,
                "end_year": end_year,
                "growth_rate": rate,
            }))
        }
        Command::Invalidate { region, indicator } => {
            let invalidated = service.invalidate(&region, &indicator)?;
            print_json(&json!({ "invalidated": invalidated }))
        }
        Command::Status => {
            let freshness = service.store().all_freshness()?;
            let now = service.store().now();
            let entries: Vec<_> = freshness
                .iter()
                .map(|entry| {
                    json!({
                        "region": entry.region_id,
                        "indicator": entry.indicator_id,
                        "last_fetched_at": entry.last_fetched_at,
                        "expires_at": entry.expires_at,
                        "record_count": entry.record_count,
                        "fresh": entry.is_fresh_at(now),
                    })
                })
                .collect();
            print_json(&entries)
        }
        Command::FetchLog { limit } => print_json(&service.store().recent_fetch_log(limit)?),
        Command::Catalog => print_json(&json!({
            "regions": all_regions(),
            "indicators": all_indicators(),
        })),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {}", err);
            ExitCode::FAILURE
        }
    }
}
