use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::utility::DelaySummary;
use super::weather::{PrecipBin, WeatherIndex};
use crate::materialize::TableRow;
use crate::resolve::ResolvedEvent;

/// Reliability of one route over one service day, tagged with that day's weather.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDayAggregate {
    pub route_id: String,
    pub service_date: NaiveDate,
    pub precip_bin: PrecipBin,
    pub snow_day: bool,
    pub event_count: usize,
    pub reported_event_count: usize,
    pub known_delay_count: usize,
    pub on_time_count: usize,
    pub on_time_ratio: Option<f64>,
    pub mean_delay_sec: Option<f64>,
    pub p50_delay_sec: Option<f64>,
    pub p90_delay_sec: Option<f64>,
}

impl TableRow for RouteDayAggregate {
    const TABLE: &'static str = "route_day_reliability";

    fn partition_date(&self) -> Option<NaiveDate> {
        Some(self.service_date)
    }

    fn row_order(&self, other: &Self) -> Ordering {
        self.route_id.cmp(&other.route_id)
    }
}

/// Buckets events by `(route_id, service_date)` and attaches the day's
/// precipitation bin and snow flag.
///
/// Weather is a function of the date alone, so this is the same grouping as
/// `(route_id, service_date, precip_bin, snow_day)`. Events without a route
/// id are skipped.
pub fn aggregate_route_days(
    events: &[ResolvedEvent],
    on_time_threshold_sec: i64,
    weather: &WeatherIndex,
) -> Vec<RouteDayAggregate> {
    let mut buckets: BTreeMap<(&str, NaiveDate), Vec<&ResolvedEvent>> = BTreeMap::new();
    for event in events {
        if let Some(route_id) = event.route_id.as_deref() {
            buckets
                .entry((route_id, event.service_date))
                .or_default()
                .push(event);
        }
    }

    buckets
        .into_iter()
        .map(|((route_id, service_date), bucket)| {
            let summary =
                DelaySummary::from_delays(bucket.iter().map(|e| e.delay_sec()), on_time_threshold_sec);
            let conditions = weather.conditions(service_date);

            RouteDayAggregate {
                route_id: route_id.to_string(),
                service_date,
                precip_bin: conditions.precip_bin,
                snow_day: conditions.snow_day,
                event_count: summary.count,
                reported_event_count: bucket.iter().filter(|e| e.has_reported_delay()).count(),
                known_delay_count: summary.known,
                on_time_count: summary.on_time,
                on_time_ratio: summary.on_time_ratio(),
                mean_delay_sec: summary.mean,
                p50_delay_sec: summary.p50,
                p90_delay_sec: summary.p90,
            }
        })
        .collect()
}
