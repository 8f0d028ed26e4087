//! Scheduled arrival lookup by `(trip, stop, stop_sequence, service_date)`.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Expanded stop time for one service date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledArrival {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub service_date: NaiveDate,
    pub scheduled_arrival: Option<DateTime<Utc>>,
    pub scheduled_departure: Option<DateTime<Utc>>,
}

/// A stop time as published in GTFS, with `HH:MM:SS` offsets from the
/// service day (hours may run past 24).
#[derive(Debug, Clone, Deserialize)]
pub struct StopTimeRow {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub service_date: NaiveDate,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
}

impl StopTimeRow {
    pub fn expand(&self, tz: Tz) -> Result<ScheduledArrival> {
        let convert = |value: &Option<String>| -> Result<Option<DateTime<Utc>>> {
            match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
                Some(v) => gtfs_time_to_utc(v, self.service_date, tz).map(Some),
                None => Ok(None),
            }
        };

        Ok(ScheduledArrival {
            trip_id: self.trip_id.clone(),
            stop_id: self.stop_id.clone(),
            stop_sequence: self.stop_sequence,
            service_date: self.service_date,
            scheduled_arrival: convert(&self.arrival_time)
                .with_context(|| format!("trip {} stop {}", self.trip_id, self.stop_id))?,
            scheduled_departure: convert(&self.departure_time)
                .with_context(|| format!("trip {} stop {}", self.trip_id, self.stop_id))?,
        })
    }
}

/// Local civil date of `ts` in the agency time zone.
pub fn service_date(ts: DateTime<Utc>, tz: Tz) -> NaiveDate {
    ts.with_timezone(&tz).date_naive()
}

/// Converts a GTFS `HH:MM:SS` offset on `service_date` into UTC.
///
/// Times at or past 24:00:00 roll onto the following calendar day. A local
/// time skipped by a DST transition is rejected; an ambiguous one resolves to
/// the earlier instant.
pub fn gtfs_time_to_utc(value: &str, service_date: NaiveDate, tz: Tz) -> Result<DateTime<Utc>> {
    let mut parts = value.split(':');
    let mut next = |name: &str| -> Result<u32> {
        parts
            .next()
            .ok_or_else(|| anyhow!("GTFS time '{value}' is missing {name}"))?
            .trim()
            .parse::<u32>()
            .with_context(|| format!("GTFS time '{value}' has invalid {name}"))
    };
    let hours = next("hours")?;
    let minutes = next("minutes")?;
    let seconds = next("seconds")?;
    if parts.next().is_some() {
        bail!("GTFS time '{value}' has more than three components");
    }

    let date = service_date + TimeDelta::days(i64::from(hours / 24));
    let time = NaiveTime::from_hms_opt(hours % 24, minutes, seconds)
        .ok_or_else(|| anyhow!("GTFS time '{value}' is out of range"))?;

    tz.from_local_datetime(&NaiveDateTime::new(date, time))
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| anyhow!("GTFS time '{value}' does not exist on {date} in {tz}"))
}

type ScheduleKey = (String, String, u32, NaiveDate);

/// In-memory index over [`ScheduledArrival`] rows.
#[derive(Debug, Default)]
pub struct ScheduleIndex {
    entries: HashMap<ScheduleKey, ScheduledArrival>,
}

impl ScheduleIndex {
    pub fn new(rows: impl IntoIterator<Item = ScheduledArrival>) -> Self {
        let entries = rows
            .into_iter()
            .map(|row| {
                (
                    (
                        row.trip_id.clone(),
                        row.stop_id.clone(),
                        row.stop_sequence,
                        row.service_date,
                    ),
                    row,
                )
            })
            .collect();
        Self { entries }
    }

    /// Loads a stop-times CSV (see [`StopTimeRow`]) and expands every row in `tz`.
    pub fn load(path: &Path, tz: Tz) -> Result<Self> {
        let mut reader =
            csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
        let mut rows = Vec::new();
        for record in reader.deserialize() {
            let row: StopTimeRow = record.with_context(|| format!("decoding {}", path.display()))?;
            rows.push(row.expand(tz)?);
        }
        Ok(Self::new(rows))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact-match lookup. Any missing key component is a miss, not an error.
    pub fn lookup(
        &self,
        trip_id: &str,
        stop_id: Option<&str>,
        stop_sequence: Option<u32>,
        service_date: NaiveDate,
    ) -> Option<&ScheduledArrival> {
        let key = (
            trip_id.to_string(),
            stop_id?.to_string(),
            stop_sequence?,
            service_date,
        );
        self.entries.get(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono_tz::America::Denver;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_service_date_uses_local_calendar() {
        // 2024-03-02 03:30 UTC is still the evening of 03-01 in Denver
        let ts = Utc.with_ymd_and_hms(2024, 3, 2, 3, 30, 0).unwrap();
        assert_eq!(service_date(ts, Denver), date(2024, 3, 1));
    }

    #[test]
    fn test_gtfs_time_to_utc() {
        let utc = gtfs_time_to_utc("08:00:00", date(2024, 3, 1), Denver).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap());
    }

    #[test]
    fn test_gtfs_time_past_midnight_rolls_over() {
        let utc = gtfs_time_to_utc("25:10:00", date(2024, 3, 1), Denver).unwrap();
        assert_eq!(utc, Utc.with_ymd_and_hms(2024, 3, 2, 8, 10, 0).unwrap());
    }

    #[test]
    fn test_gtfs_time_invalid() {
        assert!(gtfs_time_to_utc("8:00", date(2024, 3, 1), Denver).is_err());
        assert!(gtfs_time_to_utc("08:61:00", date(2024, 3, 1), Denver).is_err());
        assert!(gtfs_time_to_utc("08:00:00:99", date(2024, 3, 1), Denver).is_err());
        assert!(gtfs_time_to_utc("08:00:00:", date(2024, 3, 1), Denver).is_err());
        // 02:30 does not exist on the spring-forward date
        assert!(gtfs_time_to_utc("02:30:00", date(2024, 3, 10), Denver).is_err());
    }

    #[test]
    fn test_lookup_requires_every_key_part() {
        let arrival = ScheduledArrival {
            trip_id: "T1".to_string(),
            stop_id: "S1".to_string(),
            stop_sequence: 4,
            service_date: date(2024, 3, 1),
            scheduled_arrival: Some(Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap()),
            scheduled_departure: None,
        };
        let index = ScheduleIndex::new([arrival.clone()]);

        assert_eq!(index.lookup("T1", Some("S1"), Some(4), date(2024, 3, 1)), Some(&arrival));
        assert!(index.lookup("T1", Some("S1"), Some(5), date(2024, 3, 1)).is_none());
        assert!(index.lookup("T1", None, Some(4), date(2024, 3, 1)).is_none());
        assert!(index.lookup("T1", Some("S1"), None, date(2024, 3, 1)).is_none());
        assert!(index.lookup("T1", Some("S1"), Some(4), date(2024, 3, 2)).is_none());
    }

    #[test]
    fn test_stop_time_row_expand() {
        let row = StopTimeRow {
            trip_id: "T1".to_string(),
            stop_id: "S1".to_string(),
            stop_sequence: 1,
            service_date: date(2024, 3, 1),
            arrival_time: Some("08:00:00".to_string()),
            departure_time: Some(String::new()),
        };
        let expanded = row.expand(Denver).unwrap();
        assert_eq!(
            expanded.scheduled_arrival,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 15, 0, 0).unwrap())
        );
        assert_eq!(expanded.scheduled_departure, None);
    }
}
