//! Reliability aggregation over the resolved event table.
//!
//! Two independent targets are built from the same events:
//! stop-hour buckets and route-day buckets. Each run recomputes the buckets
//! inside its window and replaces them in the table store; a full run
//! rebuilds every date present in the event table.

pub mod headway;
pub mod route_day;
pub mod stop_hour;
pub mod utility;
pub mod weather;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use chrono_tz::Tz;
use serde::Serialize;
use tracing::info;

use crate::materialize::{CommitSummary, ReplaceScope, RunMode, ServiceWindow, TableStore};
use crate::resolve::ResolvedEvent;
use headway::HeadwayIndex;
use route_day::aggregate_route_days;
use stop_hour::aggregate_stop_hours;
use weather::WeatherIndex;

pub use route_day::RouteDayAggregate;
pub use stop_hour::StopHourAggregate;

#[derive(Debug, Clone, Copy)]
pub struct AggregationSettings {
    pub on_time_threshold_sec: i64,
    pub stop_hour_lookback_days: u32,
    pub route_day_lookback_days: u32,
    pub tz: Tz,
}

impl Default for AggregationSettings {
    fn default() -> Self {
        Self {
            on_time_threshold_sec: 300,
            stop_hour_lookback_days: 35,
            route_day_lookback_days: 3,
            tz: chrono_tz::America::Denver,
        }
    }
}

/// Events an aggregation run reads, and the table scope it replaces.
fn load_scope(
    store: &TableStore,
    mode: RunMode,
    today: NaiveDate,
    lookback_days: u32,
) -> Result<(Vec<ResolvedEvent>, ReplaceScope)> {
    match mode {
        RunMode::Full => Ok((store.read_all()?, ReplaceScope::All)),
        RunMode::Incremental => {
            let window = ServiceWindow::trailing(today, lookback_days)?;
            Ok((store.read_window(&window)?, ReplaceScope::Window(window)))
        }
    }
}

pub fn refresh_stop_hours(
    store: &TableStore,
    mode: RunMode,
    today: NaiveDate,
    settings: &AggregationSettings,
    headways: &HeadwayIndex,
) -> Result<CommitSummary> {
    let (events, scope) = load_scope(store, mode, today, settings.stop_hour_lookback_days)?;
    let rows = aggregate_stop_hours(&events, settings.tz, settings.on_time_threshold_sec, headways);
    info!(events = events.len(), buckets = rows.len(), "Stop-hour buckets computed");
    store.replace(scope, rows, &format!("aggregate stop-hour {mode}"))
}

pub fn refresh_route_days(
    store: &TableStore,
    mode: RunMode,
    today: NaiveDate,
    settings: &AggregationSettings,
    weather: &WeatherIndex,
) -> Result<CommitSummary> {
    let (events, scope) = load_scope(store, mode, today, settings.route_day_lookback_days)?;
    let rows = aggregate_route_days(&events, settings.on_time_threshold_sec, weather);
    info!(events = events.len(), buckets = rows.len(), "Route-day buckets computed");
    store.replace(scope, rows, &format!("aggregate route-day {mode}"))
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregationReport {
    pub stop_hour: CommitSummary,
    pub route_day: CommitSummary,
}

/// Refreshes both aggregate tables concurrently on the blocking pool.
#[tracing::instrument(skip_all, fields(mode = %mode, today = %today))]
pub async fn run_aggregations(
    store: TableStore,
    mode: RunMode,
    today: NaiveDate,
    settings: AggregationSettings,
    headways: Arc<HeadwayIndex>,
    weather: Arc<WeatherIndex>,
) -> Result<AggregationReport> {
    let stop_hour = {
        let store = store.clone();
        tokio::task::spawn_blocking(move || {
            refresh_stop_hours(&store, mode, today, &settings, &headways)
        })
    };
    let route_day = tokio::task::spawn_blocking(move || {
        refresh_route_days(&store, mode, today, &settings, &weather)
    });

    let (stop_hour, route_day) = tokio::join!(stop_hour, route_day);
    Ok(AggregationReport {
        stop_hour: stop_hour.context("stop-hour aggregation task failed")??,
        route_day: route_day.context("route-day aggregation task failed")??,
    })
}
