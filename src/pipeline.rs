//! Pipeline stages, in dependency order: capture, resolve, aggregate, score.
//!
//! Each stage reads its inputs from disk and commits its output table, so any
//! stage can be re-run on its own.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::aggregate::headway::HeadwayIndex;
use crate::aggregate::weather::WeatherIndex;
use crate::aggregate::{AggregationReport, run_aggregations};
use crate::config::PipelineConfig;
use crate::feeds::{
    PositionRecord, RecordFilter, ScheduleDeviationRecord, normalize_trip_updates,
    normalize_vehicle_positions, snapshot_time,
};
use crate::fetch::{HttpClient, load_source};
use crate::materialize::{CommitSummary, RunMode, ServiceWindow, event_window, materialize_events};
use crate::output::{append_records, dated_path, read_dated_records};
use crate::gtfs_rt::FeedMessage;
use crate::parser::{feed_age_sec, parse_feed};
use crate::resolve::resolve_events;
use crate::resolve::schedule::ScheduleIndex;
use crate::score::{ScoreInput, load_score_inputs, refresh_priorities};
use crate::stats::SnapshotStats;

pub const TRIP_UPDATES_STREAM: &str = "trip_updates";
pub const VEHICLE_POSITIONS_STREAM: &str = "vehicle_positions";
pub const SNAPSHOT_STATS_STREAM: &str = "snapshot_stats";

/// Where each GTFS-RT stream comes from: an http(s) URL or a file path.
#[derive(Debug, Clone)]
pub struct FeedSources {
    pub trip_updates: String,
    pub vehicle_positions: String,
}

/// Fetches both streams once, normalizes them under one shared feed
/// timestamp and appends the rows to the day's snapshot files.
///
/// A stream that fails to download or decode is recorded in the snapshot
/// stats row and contributes no records; the other stream is still kept.
#[tracing::instrument(skip(client, filter))]
pub async fn capture_snapshot<C: HttpClient>(
    client: &C,
    sources: &FeedSources,
    filter: &RecordFilter,
    snapshot_dir: &Path,
    now: DateTime<Utc>,
) -> Result<SnapshotStats> {
    let feed_ts = snapshot_time(now);
    let mut stats = SnapshotStats::new(feed_ts);

    let (trip_updates, vehicle_positions) = tokio::join!(
        load_source(client, &sources.trip_updates),
        load_source(client, &sources.vehicle_positions)
    );

    let deviations = match decode_stream(
        trip_updates,
        TRIP_UPDATES_STREAM,
        &sources.trip_updates,
        &mut stats,
    ) {
        Some(feed) => {
            stats.trip_updates_age_sec = feed_age_sec(&feed, now);
            normalize_trip_updates(&feed, feed_ts, filter, &mut stats)
        }
        None => Vec::new(),
    };
    let positions = match decode_stream(
        vehicle_positions,
        VEHICLE_POSITIONS_STREAM,
        &sources.vehicle_positions,
        &mut stats,
    ) {
        Some(feed) => {
            stats.vehicle_positions_age_sec = feed_age_sec(&feed, now);
            normalize_vehicle_positions(&feed, feed_ts, filter, &mut stats)
        }
        None => Vec::new(),
    };

    let date = feed_ts.date_naive();
    append_records(&dated_path(snapshot_dir, TRIP_UPDATES_STREAM, date), &deviations)?;
    append_records(&dated_path(snapshot_dir, VEHICLE_POSITIONS_STREAM, date), &positions)?;
    append_records(&dated_path(snapshot_dir, SNAPSHOT_STATS_STREAM, date), &[stats.clone()])?;

    info!(
        feed_ts = %feed_ts,
        deviations = deviations.len(),
        positions = positions.len(),
        delay_outliers = stats.delay_outliers,
        in_bbox_pct = stats.in_bbox_pct(),
        "Snapshot captured"
    );
    Ok(stats)
}

/// Decodes one downloaded stream. Failures are recorded on `stats` as
/// `fetch_error` or `parse_error` with the stream named in the message.
fn decode_stream(
    bytes: Result<Vec<u8>>,
    stream: &str,
    source: &str,
    stats: &mut SnapshotStats,
) -> Option<FeedMessage> {
    let (kind, error) = match bytes {
        Err(e) => ("fetch_error", e),
        Ok(bytes) => match parse_feed(&bytes) {
            Ok(feed) => return Some(feed),
            Err(e) => ("parse_error", e),
        },
    };
    warn!(stream, source, error_type = kind, error = %format!("{error:#}"), "Stream capture failed");
    stats.record_error(kind, &format!("{stream}: {error:#}"));
    None
}

/// Captured rows that can belong to a service date in `window`.
///
/// Snapshot files are split by UTC capture date, which differs from the
/// local service date by at most one day.
pub fn load_snapshots(
    snapshot_dir: &Path,
    window: &ServiceWindow,
) -> Result<(Vec<ScheduleDeviationRecord>, Vec<PositionRecord>)> {
    let files = window.padded(1)?;
    let deviations = read_dated_records(snapshot_dir, TRIP_UPDATES_STREAM, |d| files.contains(d))?;
    let positions = read_dated_records(snapshot_dir, VEHICLE_POSITIONS_STREAM, |d| files.contains(d))?;
    Ok((deviations, positions))
}

/// Resolves captured snapshots into the event table for the run's window.
pub fn resolve_stage(
    config: &PipelineConfig,
    mode: RunMode,
    today: NaiveDate,
    snapshot_dir: &Path,
    schedule: &ScheduleIndex,
) -> Result<CommitSummary> {
    let window = event_window(mode, today, &config.event_lookbacks)?;
    let (deviations, positions) = load_snapshots(snapshot_dir, &window)?;
    info!(
        window = %window,
        deviations = deviations.len(),
        positions = positions.len(),
        schedule_rows = schedule.len(),
        "Resolving events"
    );

    let events = resolve_events(&deviations, &positions, schedule, config.timezone);
    materialize_events(&config.store(), mode, window, events)
}

pub fn load_schedule(path: Option<&Path>, config: &PipelineConfig) -> Result<ScheduleIndex> {
    match path {
        Some(path) => ScheduleIndex::load(path, config.timezone),
        None => {
            warn!("No schedule supplied; delays fall back to reported values only");
            Ok(ScheduleIndex::default())
        }
    }
}

/// Refreshes the stop-hour and route-day tables.
#[tracing::instrument(skip(config))]
pub async fn aggregate_stage(
    config: &PipelineConfig,
    mode: RunMode,
    today: NaiveDate,
    headways: Option<&Path>,
    weather: Option<&Path>,
) -> Result<AggregationReport> {
    let headways = match headways {
        Some(path) => HeadwayIndex::load(path)?,
        None => HeadwayIndex::default(),
    };
    let weather = match weather {
        Some(path) => WeatherIndex::load(path)?,
        None => WeatherIndex::default(),
    };

    run_aggregations(
        config.store(),
        mode,
        today,
        config.aggregation_settings(),
        Arc::new(headways),
        Arc::new(weather),
    )
    .await
}

/// Rebuilds the priority table.
pub fn score_stage(config: &PipelineConfig, today: NaiveDate, inputs: Option<&Path>) -> Result<CommitSummary> {
    let inputs: Vec<ScoreInput> = match inputs {
        Some(path) => load_score_inputs(path)?,
        None => Vec::new(),
    };
    refresh_priorities(
        &config.store(),
        &inputs,
        &config.weights,
        today,
        config.stop_hour_lookback_days,
    )
}

/// Inputs for one end-to-end run.
#[derive(Debug, Clone, Default)]
pub struct RunInputs {
    pub snapshot_dir: PathBuf,
    pub schedule: Option<PathBuf>,
    pub headways: Option<PathBuf>,
    pub weather: Option<PathBuf>,
    pub score_inputs: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub events: CommitSummary,
    pub aggregates: AggregationReport,
    pub priorities: CommitSummary,
}

/// Resolve, aggregate and score, in order. A failing stage stops the run and
/// leaves every later table at its previous version.
#[tracing::instrument(skip(config))]
pub async fn run_all(
    config: &PipelineConfig,
    mode: RunMode,
    today: NaiveDate,
    inputs: &RunInputs,
) -> Result<RunReport> {
    let schedule = load_schedule(inputs.schedule.as_deref(), config)?;
    let events = resolve_stage(config, mode, today, &inputs.snapshot_dir, &schedule)?;
    let aggregates = aggregate_stage(
        config,
        mode,
        today,
        inputs.headways.as_deref(),
        inputs.weather.as_deref(),
    )
    .await?;
    let priorities = score_stage(config, today, inputs.score_inputs.as_deref())?;

    info!(
        events = events.rows_written,
        stop_hours = aggregates.stop_hour.rows_written,
        route_days = aggregates.route_day.rows_written,
        priorities = priorities.rows_written,
        "Pipeline run complete"
    );
    Ok(RunReport {
        events,
        aggregates,
        priorities,
    })
}
