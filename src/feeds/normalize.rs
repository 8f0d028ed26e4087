use std::collections::BTreeSet;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::feeds::types::{PositionRecord, ScheduleDeviationRecord};
use crate::gtfs_rt::FeedMessage;
use crate::gtfs_rt::trip_update::StopTimeUpdate;
use crate::stats::SnapshotStats;

/// Reported delays outside this range are counted as outliers. They are kept.
pub const DELAY_OUTLIER_RANGE_SEC: std::ops::RangeInclusive<i32> = -3600..=7200;

/// Service-area bounds used for the position quality counters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lon_min: f64,
    pub lon_max: f64,
    pub lat_min: f64,
    pub lat_max: f64,
}

impl Default for BoundingBox {
    fn default() -> Self {
        Self {
            lon_min: -105.5,
            lon_max: -104.4,
            lat_min: 39.4,
            lat_max: 40.2,
        }
    }
}

impl BoundingBox {
    pub fn contains(&self, lon: f64, lat: f64) -> bool {
        (self.lon_min..=self.lon_max).contains(&lon) && (self.lat_min..=self.lat_max).contains(&lat)
    }
}

/// Which records survive normalization.
#[derive(Debug, Clone, Default)]
pub struct RecordFilter {
    /// Retain only these routes when set.
    pub routes: Option<BTreeSet<String>>,
    pub bbox: BoundingBox,
}

impl RecordFilter {
    fn keeps_route(&self, route_id: Option<&str>) -> bool {
        match (&self.routes, route_id) {
            (None, _) => true,
            (Some(routes), Some(route_id)) => routes.contains(route_id),
            (Some(_), None) => false,
        }
    }
}

/// Snapshot label shared by both streams of one capture: `now` truncated to
/// the minute.
pub fn snapshot_time(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(now)
}

/// Flattens every `StopTimeUpdate` of every TripUpdate entity.
pub fn normalize_trip_updates(
    feed: &FeedMessage,
    feed_ts: DateTime<Utc>,
    filter: &RecordFilter,
    stats: &mut SnapshotStats,
) -> Vec<ScheduleDeviationRecord> {
    let mut rows = Vec::new();
    stats.total_entities += feed.entity.len();

    for entity in &feed.entity {
        let Some(trip_update) = &entity.trip_update else {
            continue;
        };
        stats.trip_updates += 1;

        let trip = &trip_update.trip;
        let route_id = non_empty(trip.route_id.as_deref());
        if !filter.keeps_route(route_id.as_deref()) {
            stats.filtered_routes += 1;
            continue;
        }
        let Some(trip_id) = non_empty(trip.trip_id.as_deref()) else {
            stats.missing_trip_id += 1;
            continue;
        };

        let schedule_relationship = trip.schedule_relationship().as_str_name().to_string();
        let entity_id = non_empty(Some(entity.id.as_str()));

        for stu in &trip_update.stop_time_update {
            stats.stop_time_updates += 1;

            let arrival_delay_sec = stu.arrival.as_ref().and_then(|e| e.delay);
            let departure_delay_sec = stu.departure.as_ref().and_then(|e| e.delay);
            for delay in [arrival_delay_sec, departure_delay_sec].into_iter().flatten() {
                if !DELAY_OUTLIER_RANGE_SEC.contains(&delay) {
                    stats.delay_outliers += 1;
                }
            }

            let event_ts = select_event_timestamp(stu, trip_update.timestamp).unwrap_or(feed_ts);

            rows.push(ScheduleDeviationRecord {
                feed_ts,
                entity_id: entity_id.clone(),
                trip_id: trip_id.clone(),
                route_id: route_id.clone(),
                stop_id: non_empty(stu.stop_id.as_deref()),
                stop_sequence: stu.stop_sequence,
                arrival_delay_sec,
                departure_delay_sec,
                schedule_relationship: Some(schedule_relationship.clone()),
                event_ts: Some(event_ts),
                start_date: non_empty(trip.start_date.as_deref()),
                start_time: non_empty(trip.start_time.as_deref()),
            });
        }
    }

    stats.deviation_rows += rows.len();
    debug!(
        feed_ts = %feed_ts,
        rows = rows.len(),
        outliers = stats.delay_outliers,
        "Trip updates normalized"
    );
    rows
}

/// Flattens VehiclePosition entities, dropping those without coordinates.
pub fn normalize_vehicle_positions(
    feed: &FeedMessage,
    feed_ts: DateTime<Utc>,
    filter: &RecordFilter,
    stats: &mut SnapshotStats,
) -> Vec<PositionRecord> {
    let mut rows = Vec::new();
    stats.total_entities += feed.entity.len();

    for entity in &feed.entity {
        let Some(vehicle) = &entity.vehicle else {
            continue;
        };
        stats.vehicles += 1;

        let trip = vehicle.trip.as_ref();
        let route_id = non_empty(trip.and_then(|t| t.route_id.as_deref()));
        if !filter.keeps_route(route_id.as_deref()) {
            stats.filtered_routes += 1;
            continue;
        }

        let coordinates = vehicle
            .position
            .as_ref()
            .map(|p| (f64::from(p.longitude), f64::from(p.latitude)))
            .filter(|(lon, lat)| has_coordinates(*lon, *lat));
        let Some((lon, lat)) = coordinates else {
            stats.missing_coordinates += 1;
            continue;
        };
        if filter.bbox.contains(lon, lat) {
            stats.in_bbox += 1;
        } else {
            stats.out_of_bbox += 1;
        }

        let Some(trip_id) = non_empty(trip.and_then(|t| t.trip_id.as_deref())) else {
            stats.missing_trip_id += 1;
            continue;
        };

        let position = vehicle.position.as_ref();
        let descriptor = vehicle.vehicle.as_ref();
        let event_ts = vehicle
            .timestamp
            .and_then(epoch_to_utc)
            .unwrap_or(feed_ts);

        rows.push(PositionRecord {
            feed_ts,
            entity_id: non_empty(Some(entity.id.as_str())),
            trip_id,
            route_id,
            vehicle_id: non_empty(descriptor.and_then(|d| d.id.as_deref())),
            vehicle_label: non_empty(descriptor.and_then(|d| d.label.as_deref())),
            lon,
            lat,
            bearing: position.and_then(|p| p.bearing),
            speed_mps: position.and_then(|p| p.speed),
            event_ts: Some(event_ts),
        });
    }

    stats.position_rows += rows.len();
    debug!(
        feed_ts = %feed_ts,
        rows = rows.len(),
        missing_coordinates = stats.missing_coordinates,
        "Vehicle positions normalized"
    );
    rows
}

/// Arrival time, then departure time, then the TripUpdate timestamp.
fn select_event_timestamp(stu: &StopTimeUpdate, entity_timestamp: Option<u64>) -> Option<DateTime<Utc>> {
    let arrival = stu.arrival.as_ref().and_then(|e| e.time);
    let departure = stu.departure.as_ref().and_then(|e| e.time);
    arrival
        .or(departure)
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .or_else(|| entity_timestamp.and_then(epoch_to_utc))
}

fn epoch_to_utc(secs: u64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
}

fn has_coordinates(lon: f64, lat: f64) -> bool {
    lon.is_finite() && lat.is_finite() && !(lon == 0.0 && lat == 0.0)
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gtfs_rt::trip_update::StopTimeEvent;
    use crate::gtfs_rt::{
        FeedEntity, FeedHeader, Position, TripDescriptor, TripUpdate, VehicleDescriptor,
        VehiclePosition,
    };
    use chrono::TimeZone;

    fn feed_ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap()
    }

    fn header() -> FeedHeader {
        FeedHeader {
            gtfs_realtime_version: "2.0".to_string(),
            timestamp: Some(1709305200),
            incrementality: None,
            feed_version: None,
        }
    }

    fn trip(trip_id: &str, route_id: &str) -> TripDescriptor {
        TripDescriptor {
            trip_id: Some(trip_id.to_string()),
            route_id: Some(route_id.to_string()),
            ..Default::default()
        }
    }

    fn trip_update_entity(id: &str, trip_id: &str, route_id: &str, stus: Vec<StopTimeUpdate>) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            trip_update: Some(TripUpdate {
                trip: trip(trip_id, route_id),
                stop_time_update: stus,
                timestamp: Some(1709305150),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn vehicle_entity(id: &str, trip_id: &str, lon: f32, lat: f32) -> FeedEntity {
        FeedEntity {
            id: id.to_string(),
            vehicle: Some(VehiclePosition {
                trip: Some(trip(trip_id, "15")),
                vehicle: Some(VehicleDescriptor {
                    id: Some("6012".to_string()),
                    label: Some("6012".to_string()),
                    license_plate: None,
                }),
                position: Some(Position {
                    latitude: lat,
                    longitude: lon,
                    bearing: Some(90.0),
                    odometer: None,
                    speed: Some(8.5),
                }),
                timestamp: Some(1709305190),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_reported_delay_taken_from_delay_field_only() {
        let feed = FeedMessage {
            header: header(),
            entity: vec![trip_update_entity(
                "tu-1",
                "T1",
                "15",
                vec![StopTimeUpdate {
                    stop_sequence: Some(4),
                    stop_id: Some("S4".to_string()),
                    arrival: Some(StopTimeEvent {
                        delay: Some(42),
                        ..Default::default()
                    }),
                    departure: Some(StopTimeEvent {
                        time: Some(1709305260),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
            )],
        };
        let mut stats = SnapshotStats::new(feed_ts());
        let rows = normalize_trip_updates(&feed, feed_ts(), &RecordFilter::default(), &mut stats);

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.arrival_delay_sec, Some(42));
        assert_eq!(row.departure_delay_sec, None);
        assert_eq!(row.schedule_relationship.as_deref(), Some("SCHEDULED"));
        // departure time wins over the entity timestamp
        assert_eq!(row.event_ts, DateTime::from_timestamp(1709305260, 0));
        assert_eq!(stats.deviation_rows, 1);
    }

    #[test]
    fn test_event_ts_falls_back_to_entity_then_feed() {
        let mut entity = trip_update_entity(
            "tu-1",
            "T1",
            "15",
            vec![StopTimeUpdate {
                stop_id: Some("S1".to_string()),
                ..Default::default()
            }],
        );
        let feed = FeedMessage {
            header: header(),
            entity: vec![entity.clone()],
        };
        let mut stats = SnapshotStats::default();
        let rows = normalize_trip_updates(&feed, feed_ts(), &RecordFilter::default(), &mut stats);
        assert_eq!(rows[0].event_ts, DateTime::from_timestamp(1709305150, 0));

        if let Some(tu) = entity.trip_update.as_mut() {
            tu.timestamp = None;
        }
        let feed = FeedMessage {
            header: header(),
            entity: vec![entity],
        };
        let rows = normalize_trip_updates(&feed, feed_ts(), &RecordFilter::default(), &mut stats);
        assert_eq!(rows[0].event_ts, Some(feed_ts()));
    }

    #[test]
    fn test_delay_outliers_counted_not_dropped() {
        let feed = FeedMessage {
            header: header(),
            entity: vec![trip_update_entity(
                "tu-1",
                "T1",
                "15",
                vec![StopTimeUpdate {
                    arrival: Some(StopTimeEvent {
                        delay: Some(9000),
                        ..Default::default()
                    }),
                    departure: Some(StopTimeEvent {
                        delay: Some(-4000),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
            )],
        };
        let mut stats = SnapshotStats::default();
        let rows = normalize_trip_updates(&feed, feed_ts(), &RecordFilter::default(), &mut stats);

        assert_eq!(rows.len(), 1);
        assert_eq!(stats.delay_outliers, 2);
    }

    #[test]
    fn test_route_filter_and_missing_trip_id() {
        let mut no_trip = trip_update_entity("tu-3", "", "15", vec![StopTimeUpdate::default()]);
        if let Some(tu) = no_trip.trip_update.as_mut() {
            tu.trip.trip_id = None;
        }
        let feed = FeedMessage {
            header: header(),
            entity: vec![
                trip_update_entity("tu-1", "T1", "15", vec![StopTimeUpdate::default()]),
                trip_update_entity("tu-2", "T2", "0", vec![StopTimeUpdate::default()]),
                no_trip,
            ],
        };
        let filter = RecordFilter {
            routes: Some(["15".to_string()].into_iter().collect()),
            ..Default::default()
        };
        let mut stats = SnapshotStats::default();
        let rows = normalize_trip_updates(&feed, feed_ts(), &filter, &mut stats);

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trip_id, "T1");
        assert_eq!(stats.filtered_routes, 1);
        assert_eq!(stats.missing_trip_id, 1);
    }

    #[test]
    fn test_vehicle_positions_drop_missing_coordinates() {
        let mut no_position = vehicle_entity("vp-2", "T2", 0.0, 0.0);
        if let Some(v) = no_position.vehicle.as_mut() {
            v.position = None;
        }
        let feed = FeedMessage {
            header: header(),
            entity: vec![
                vehicle_entity("vp-1", "T1", -104.99, 39.74),
                vehicle_entity("vp-3", "T3", 0.0, 0.0),
                vehicle_entity("vp-4", "T4", -100.0, 39.74),
                no_position,
            ],
        };
        let mut stats = SnapshotStats::default();
        let rows = normalize_vehicle_positions(&feed, feed_ts(), &RecordFilter::default(), &mut stats);

        assert_eq!(rows.len(), 2);
        assert_eq!(stats.missing_coordinates, 2);
        assert_eq!(stats.in_bbox, 1);
        assert_eq!(stats.out_of_bbox, 1);

        let first = &rows[0];
        assert_eq!(first.entity_id.as_deref(), Some("vp-1"));
        assert_eq!(first.vehicle_id.as_deref(), Some("6012"));
        assert_eq!(first.bearing, Some(90.0));
        assert_eq!(first.event_ts, DateTime::from_timestamp(1709305190, 0));
    }

    #[test]
    fn test_snapshot_time_truncates_to_minute() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 15, 7, 42).unwrap();
        assert_eq!(
            snapshot_time(now),
            Utc.with_ymd_and_hms(2024, 3, 1, 15, 7, 0).unwrap()
        );
    }
}
