//! Event resolution: reconcile, deduplicate, join the schedule, resolve delays.
//!
//! The two steps that decide which source rows survive are kept apart:
//! [`reconcile::reconcile`] builds every candidate pairing and
//! [`rank::deduplicate`] picks one per `(feed_ts, trip_id)`.

pub mod delay;
pub mod rank;
pub mod reconcile;
pub mod schedule;

use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::feeds::{PositionRecord, ScheduleDeviationRecord};
use delay::{DelaySource, resolve_delay};
use reconcile::Candidate;
use schedule::{ScheduleIndex, service_date};

/// Canonical state of one trip at one feed snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedEvent {
    pub feed_ts: DateTime<Utc>,
    pub trip_id: String,
    pub route_id: Option<String>,
    pub service_date: NaiveDate,
    pub stop_id: Option<String>,
    pub stop_sequence: Option<u32>,
    pub observed_at: Option<DateTime<Utc>>,
    pub arrival_delay_sec: Option<i64>,
    pub arrival_delay_source: Option<DelaySource>,
    pub departure_delay_sec: Option<i64>,
    pub departure_delay_source: Option<DelaySource>,
    pub scheduled_arrival: Option<DateTime<Utc>>,
    pub scheduled_departure: Option<DateTime<Utc>>,
    pub schedule_relationship: Option<String>,
    pub deviation_entity_id: Option<String>,
    pub position_entity_id: Option<String>,
    pub vehicle_id: Option<String>,
    pub vehicle_label: Option<String>,
    pub lon: Option<f64>,
    pub lat: Option<f64>,
    pub bearing: Option<f32>,
    pub speed_mps: Option<f32>,
}

impl ResolvedEvent {
    /// Delay used for reliability statistics: arrival, else departure.
    pub fn delay_sec(&self) -> Option<i64> {
        self.arrival_delay_sec.or(self.departure_delay_sec)
    }

    /// True when either side carried a delay straight from the feed.
    pub fn has_reported_delay(&self) -> bool {
        self.arrival_delay_source == Some(DelaySource::Reported)
            || self.departure_delay_source == Some(DelaySource::Reported)
    }

    /// Instant used for local bucketing.
    pub fn local_instant(&self) -> DateTime<Utc> {
        self.observed_at.unwrap_or(self.feed_ts)
    }
}

/// Builds a [`ResolvedEvent`] from the winning candidate of its group.
pub fn resolve_candidate(candidate: &Candidate<'_>, schedule: &ScheduleIndex, tz: Tz) -> ResolvedEvent {
    let deviation = candidate.deviation;
    let position = candidate.position;
    let observed_at = candidate.observed_at();
    let service_date = service_date(observed_at.unwrap_or_else(|| candidate.feed_ts()), tz);

    let stop_id = deviation.and_then(|d| d.stop_id.clone());
    let stop_sequence = deviation.and_then(|d| d.stop_sequence);
    let scheduled = schedule.lookup(
        candidate.trip_id(),
        stop_id.as_deref(),
        stop_sequence,
        service_date,
    );
    let scheduled_arrival = scheduled.and_then(|s| s.scheduled_arrival);
    let scheduled_departure = scheduled.and_then(|s| s.scheduled_departure);

    let arrival = resolve_delay(
        deviation.and_then(|d| d.arrival_delay_sec),
        scheduled_arrival,
        observed_at,
    );
    let departure = resolve_delay(
        deviation.and_then(|d| d.departure_delay_sec),
        scheduled_departure,
        observed_at,
    );

    ResolvedEvent {
        feed_ts: candidate.feed_ts(),
        trip_id: candidate.trip_id().to_string(),
        route_id: candidate.route_id().map(str::to_string),
        service_date,
        stop_id,
        stop_sequence,
        observed_at,
        arrival_delay_sec: arrival.seconds,
        arrival_delay_source: arrival.source,
        departure_delay_sec: departure.seconds,
        departure_delay_source: departure.source,
        scheduled_arrival,
        scheduled_departure,
        schedule_relationship: deviation.and_then(|d| d.schedule_relationship.clone()),
        deviation_entity_id: deviation.and_then(|d| d.entity_id.clone()),
        position_entity_id: position.and_then(|p| p.entity_id.clone()),
        vehicle_id: position.and_then(|p| p.vehicle_id.clone()),
        vehicle_label: position.and_then(|p| p.vehicle_label.clone()),
        lon: position.map(|p| p.lon),
        lat: position.map(|p| p.lat),
        bearing: position.and_then(|p| p.bearing),
        speed_mps: position.and_then(|p| p.speed_mps),
    }
}

/// Runs reconcile → deduplicate → schedule join → delay resolution over one
/// snapshot of both streams. Output is ordered by `(feed_ts, trip_id)`.
pub fn resolve_events(
    deviations: &[ScheduleDeviationRecord],
    positions: &[PositionRecord],
    schedule: &ScheduleIndex,
    tz: Tz,
) -> Vec<ResolvedEvent> {
    let candidates = reconcile::reconcile(deviations, positions);
    let candidate_count = candidates.len();
    let winners = rank::deduplicate(candidates);

    let events: Vec<ResolvedEvent> = winners
        .iter()
        .map(|candidate| resolve_candidate(candidate, schedule, tz))
        .collect();

    debug!(
        deviations = deviations.len(),
        positions = positions.len(),
        candidates = candidate_count,
        events = events.len(),
        "Events resolved"
    );
    events
}

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
    use chrono_tz::America::Denver;

    use crate::feeds::{PositionRecord, ScheduleDeviationRecord};

    pub fn service_day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
    }

    /// Denver wall-clock `HH:MM:SS` on 2024-03-01, as UTC.
    pub fn local(hms: &str) -> DateTime<Utc> {
        let time = NaiveTime::parse_from_str(hms, "%H:%M:%S").unwrap();
        Denver
            .from_local_datetime(&service_day().and_time(time))
            .unwrap()
            .with_timezone(&Utc)
    }

    pub fn feed_ts() -> DateTime<Utc> {
        local("08:00:00")
    }

    pub fn deviation(trip_id: &str, route_id: &str, entity_id: &str, observed: &str) -> ScheduleDeviationRecord {
        ScheduleDeviationRecord {
            feed_ts: feed_ts(),
            entity_id: Some(entity_id.to_string()),
            trip_id: trip_id.to_string(),
            route_id: Some(route_id.to_string()),
            stop_id: Some("S1".to_string()),
            stop_sequence: Some(1),
            arrival_delay_sec: None,
            departure_delay_sec: None,
            schedule_relationship: Some("SCHEDULED".to_string()),
            event_ts: Some(local(observed)),
            start_date: Some("20240301".to_string()),
            start_time: None,
        }
    }

    pub fn position(trip_id: &str, route_id: &str, entity_id: &str, observed: &str) -> PositionRecord {
        PositionRecord {
            feed_ts: feed_ts(),
            entity_id: Some(entity_id.to_string()),
            trip_id: trip_id.to_string(),
            route_id: Some(route_id.to_string()),
            vehicle_id: Some(format!("bus-{entity_id}")),
            vehicle_label: None,
            lon: -104.99,
            lat: 39.74,
            bearing: Some(180.0),
            speed_mps: Some(7.5),
            event_ts: Some(local(observed)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::schedule::ScheduledArrival;
    use super::test_support::{deviation, local, position, service_day};
    use super::*;
    use chrono_tz::America::Denver;

    fn schedule_at(stop_id: &str, seq: u32, hms: &str) -> ScheduleIndex {
        ScheduleIndex::new([ScheduledArrival {
            trip_id: "T1".to_string(),
            stop_id: stop_id.to_string(),
            stop_sequence: seq,
            service_date: service_day(),
            scheduled_arrival: Some(local(hms)),
            scheduled_departure: Some(local(hms)),
        }])
    }

    #[test]
    fn test_reported_delay_not_overwritten_by_schedule() {
        let mut d = deviation("T1", "15", "tu-1", "08:01:30");
        d.arrival_delay_sec = Some(42);
        let schedule = schedule_at("S1", 1, "08:00:00");

        let events = resolve_events(&[d], &[], &schedule, Denver);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].arrival_delay_sec, Some(42));
        assert_eq!(events[0].arrival_delay_source, Some(DelaySource::Reported));
        // departure had nothing reported, so schedule math applies
        assert_eq!(events[0].departure_delay_sec, Some(90));
        assert_eq!(events[0].departure_delay_source, Some(DelaySource::Schedule));
    }

    #[test]
    fn test_schedule_fallback_computes_delay() {
        let d = deviation("T1", "15", "tu-1", "08:02:30");
        let schedule = schedule_at("S1", 1, "08:00:00");

        let events = resolve_events(&[d], &[], &schedule, Denver);

        assert_eq!(events[0].arrival_delay_sec, Some(150));
        assert_eq!(events[0].scheduled_arrival, Some(local("08:00:00")));
        assert_eq!(events[0].service_date, service_day());
    }

    #[test]
    fn test_no_schedule_match_leaves_delay_null() {
        let d = deviation("T1", "15", "tu-1", "08:02:30");
        let schedule = schedule_at("S9", 1, "08:00:00");

        let events = resolve_events(&[d], &[], &schedule, Denver);

        assert_eq!(events[0].scheduled_arrival, None);
        assert_eq!(events[0].arrival_delay_sec, None);
        assert_eq!(events[0].delay_sec(), None);
    }

    #[test]
    fn test_position_only_trip_has_null_deviation_fields() {
        let p = position("T7", "0", "vp-7", "08:00:02");

        let events = resolve_events(&[], &[p], &ScheduleIndex::default(), Denver);

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.trip_id, "T7");
        assert_eq!(event.route_id.as_deref(), Some("0"));
        assert_eq!(event.stop_id, None);
        assert_eq!(event.deviation_entity_id, None);
        assert_eq!(event.arrival_delay_sec, None);
        assert_eq!(event.position_entity_id.as_deref(), Some("vp-7"));
        assert_eq!(event.lat, Some(39.74));
    }

    #[test]
    fn test_deviation_only_trip_has_null_position_fields() {
        let d = deviation("T1", "15", "tu-1", "08:00:05");

        let events = resolve_events(&[d], &[], &ScheduleIndex::default(), Denver);

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].position_entity_id, None);
        assert_eq!(events[0].lon, None);
        assert_eq!(events[0].vehicle_id, None);
    }

    #[test]
    fn test_resolution_is_deterministic() {
        let deviations = vec![
            deviation("T1", "15", "tu-1", "08:00:03"),
            deviation("T1", "15", "tu-2", "08:00:05"),
            deviation("T2", "15", "tu-3", "08:00:01"),
        ];
        let positions = vec![position("T1", "15", "vp-1", "08:00:04")];
        let mut reversed = deviations.clone();
        reversed.reverse();

        let a = resolve_events(&deviations, &positions, &ScheduleIndex::default(), Denver);
        let b = resolve_events(&reversed, &positions, &ScheduleIndex::default(), Denver);

        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
        assert_eq!(a[0].deviation_entity_id.as_deref(), Some("tu-2"));
    }
}
