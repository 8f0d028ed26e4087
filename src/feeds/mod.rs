//! Telemetry stream normalization.
//!
//! Decoded GTFS-RT TripUpdates and VehiclePositions are flattened into
//! [`ScheduleDeviationRecord`] and [`PositionRecord`] rows that share a
//! `(feed_ts, trip_id, route_id)` key.

pub mod normalize;
pub mod types;

pub use normalize::{RecordFilter, normalize_trip_updates, normalize_vehicle_positions, snapshot_time};
pub use types::{JoinKey, PositionRecord, ScheduleDeviationRecord};
