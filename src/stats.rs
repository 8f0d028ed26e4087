use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-snapshot capture counters, appended as one CSV row per snapshot.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub feed_ts: DateTime<Utc>,
    pub total_entities: usize,

    // trip updates
    pub trip_updates: usize,
    pub stop_time_updates: usize,
    pub deviation_rows: usize,
    pub delay_outliers: usize,

    // vehicle positions
    pub vehicles: usize,
    pub position_rows: usize,
    pub missing_coordinates: usize,
    pub in_bbox: usize,
    pub out_of_bbox: usize,

    // shared drops
    pub missing_trip_id: usize,
    pub filtered_routes: usize,

    // seconds between each feed's header timestamp and capture
    pub trip_updates_age_sec: Option<i64>,
    pub vehicle_positions_age_sec: Option<i64>,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl SnapshotStats {
    pub fn new(feed_ts: DateTime<Utc>) -> Self {
        SnapshotStats {
            feed_ts,
            ..Default::default()
        }
    }

    pub fn pct(part: usize, total: usize) -> f64 {
        if total == 0 {
            0.0
        } else {
            (part as f64 / total as f64) * 100.0
        }
    }

    /// Share of positioned vehicles inside the service-area bounding box.
    /// `None` when no vehicle carried coordinates.
    pub fn in_bbox_pct(&self) -> Option<f64> {
        let total = self.in_bbox + self.out_of_bbox;
        if total == 0 {
            None
        } else {
            Some(Self::pct(self.in_bbox, total))
        }
    }

    /// Records a fetch or parse failure on an otherwise populated row. A
    /// second failure in the same snapshot is appended to the message.
    pub fn record_error(&mut self, error_type: &str, error_message: &str) {
        match (&mut self.error_type, &mut self.error_message) {
            (Some(kind), Some(message)) => {
                kind.push('|');
                kind.push_str(error_type);
                message.push_str(" | ");
                message.push_str(error_message);
            }
            _ => {
                self.error_type = Some(error_type.to_string());
                self.error_message = Some(error_message.to_string());
            }
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_type.is_some()
    }
}
