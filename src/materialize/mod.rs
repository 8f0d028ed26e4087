//! Incremental materialization of resolved events.
//!
//! A run replaces every service-date partition in its window with freshly
//! resolved events. The outcome equals deleting then re-inserting the window,
//! so repeating a run or overlapping a full run with an incremental one never
//! duplicates a `(feed_ts, trip_id)` key.

pub mod lock;
pub mod store;
pub mod window;

use std::cmp::Ordering;

use anyhow::Result;
use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use crate::resolve::ResolvedEvent;
pub use store::{CommitSummary, ReplaceScope, RunRecord, TableManifest, TableRow, TableStore};
pub use window::{EventLookbacks, RunMode, ServiceWindow, event_window};

impl TableRow for ResolvedEvent {
    const TABLE: &'static str = "resolved_events";

    fn partition_date(&self) -> Option<NaiveDate> {
        Some(self.service_date)
    }

    fn row_order(&self, other: &Self) -> Ordering {
        self.route_id
            .cmp(&other.route_id)
            .then_with(|| self.trip_id.cmp(&other.trip_id))
            .then_with(|| self.feed_ts.cmp(&other.feed_ts))
    }
}

/// Replaces the event table's `window` with `events`.
///
/// Events whose service date falls outside the window are ignored. Duplicate
/// `(feed_ts, trip_id)` keys in the input collapse to the first row and are
/// logged.
pub fn materialize_events(
    store: &TableStore,
    mode: RunMode,
    window: ServiceWindow,
    mut events: Vec<ResolvedEvent>,
) -> Result<CommitSummary> {
    let before = events.len();
    events.sort_by(|a, b| (a.feed_ts, &a.trip_id).cmp(&(b.feed_ts, &b.trip_id)));
    events.dedup_by(|a, b| a.feed_ts == b.feed_ts && a.trip_id == b.trip_id);
    if events.len() != before {
        warn!(
            dropped = before - events.len(),
            "Duplicate event keys in materialization input"
        );
    }

    let operation = format!("materialize {mode} {window}");
    let summary = store.replace(ReplaceScope::Window(window), events, &operation)?;

    store.record_run(
        ResolvedEvent::TABLE,
        &RunRecord {
            mode,
            window_start: Some(window.start),
            window_end: Some(window.end),
            version: summary.version,
            rows_written: summary.rows_written,
            finished_at: Utc::now(),
        },
    )?;

    info!(
        mode = %mode,
        window = %window,
        rows = summary.rows_written,
        version = summary.version,
        "Events materialized"
    );
    Ok(summary)
}
