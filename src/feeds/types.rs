//! Flattened telemetry rows produced from GTFS-RT snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One `StopTimeUpdate` of a TripUpdate entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleDeviationRecord {
    pub feed_ts: DateTime<Utc>,
    pub entity_id: Option<String>,
    pub trip_id: String,
    pub route_id: Option<String>,
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub arrival_delay_sec: Option<i32>,
    pub departure_delay_sec: Option<i32>,
    pub schedule_relationship: Option<String>,
    pub event_ts: Option<DateTime<Utc>>,
    pub start_date: Option<String>,
    pub start_time: Option<String>,
}

/// One VehiclePosition entity with usable coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub feed_ts: DateTime<Utc>,
    pub entity_id: Option<String>,
    pub trip_id: String,
    pub route_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub lon: f64,
    pub lat: f64,
    pub bearing: Option<f32>,
    pub speed_mps: Option<f32>,
    pub event_ts: Option<DateTime<Utc>>,
}

/// Both streams share this join key: `(feed_ts, trip_id, route_id)`.
pub type JoinKey<'a> = (DateTime<Utc>, &'a str, Option<&'a str>);

impl ScheduleDeviationRecord {
    pub fn join_key(&self) -> JoinKey<'_> {
        (self.feed_ts, self.trip_id.as_str(), self.route_id.as_deref())
    }
}

impl PositionRecord {
    pub fn join_key(&self) -> JoinKey<'_> {
        (self.feed_ts, self.trip_id.as_str(), self.route_id.as_deref())
    }
}
