use std::cmp::{Ordering, Reverse};
use std::collections::{BTreeMap, HashMap};

use chrono::{NaiveDate, Timelike};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use super::headway::HeadwayIndex;
use super::utility::DelaySummary;
use crate::materialize::TableRow;
use crate::resolve::ResolvedEvent;

/// Reliability of one stop during one local hour of one service day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopHourAggregate {
    pub stop_id: String,
    pub service_date: NaiveDate,
    pub hour: u32,
    pub event_count: usize,
    pub known_delay_count: usize,
    pub on_time_count: usize,
    pub on_time_ratio: Option<f64>,
    pub mean_delay_sec: Option<f64>,
    pub p90_delay_sec: Option<f64>,
    pub top_route_id: Option<String>,
    pub headway_adherence_rate: Option<f64>,
    pub headway_p50_sec: Option<f64>,
    pub headway_p90_sec: Option<f64>,
}

impl TableRow for StopHourAggregate {
    const TABLE: &'static str = "stop_hour_reliability";

    fn partition_date(&self) -> Option<NaiveDate> {
        Some(self.service_date)
    }

    fn row_order(&self, other: &Self) -> Ordering {
        (&self.stop_id, self.hour).cmp(&(&other.stop_id, other.hour))
    }
}

/// Route with the most events; ties go to the smallest id.
fn most_frequent_route<'a>(routes: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut counts: HashMap<&str, usize> = HashMap::new();
    for route in routes {
        *counts.entry(route).or_default() += 1;
    }
    counts
        .into_iter()
        .max_by_key(|(route, count)| (*count, Reverse(*route)))
        .map(|(route, _)| route.to_string())
}

/// Buckets events by `(stop_id, service_date, local hour)`.
///
/// Events without a stop id are skipped. Output is ordered by the bucket key.
pub fn aggregate_stop_hours(
    events: &[ResolvedEvent],
    tz: Tz,
    on_time_threshold_sec: i64,
    headways: &HeadwayIndex,
) -> Vec<StopHourAggregate> {
    let mut buckets: BTreeMap<(&str, NaiveDate, u32), Vec<&ResolvedEvent>> = BTreeMap::new();
    for event in events {
        let Some(stop_id) = event.stop_id.as_deref() else {
            continue;
        };
        let hour = event.local_instant().with_timezone(&tz).hour();
        buckets
            .entry((stop_id, event.service_date, hour))
            .or_default()
            .push(event);
    }

    buckets
        .into_iter()
        .map(|((stop_id, service_date, hour), bucket)| {
            let summary =
                DelaySummary::from_delays(bucket.iter().map(|e| e.delay_sec()), on_time_threshold_sec);
            let headway = headways.get(stop_id, service_date, hour);

            StopHourAggregate {
                stop_id: stop_id.to_string(),
                service_date,
                hour,
                event_count: summary.count,
                known_delay_count: summary.known,
                on_time_count: summary.on_time,
                on_time_ratio: summary.on_time_ratio(),
                mean_delay_sec: summary.mean,
                p90_delay_sec: summary.p90,
                top_route_id: most_frequent_route(bucket.iter().filter_map(|e| e.route_id.as_deref())),
                headway_adherence_rate: headway.and_then(|h| h.adherence_rate),
                headway_p50_sec: headway.and_then(|h| h.headway_p50_sec),
                headway_p90_sec: headway.and_then(|h| h.headway_p90_sec),
            }
        })
        .collect()
}
