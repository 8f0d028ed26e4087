//! Full outer join of the two telemetry streams.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::feeds::{JoinKey, PositionRecord, ScheduleDeviationRecord};

/// One matched or unmatched pairing. At least one side is always present.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate<'a> {
    pub deviation: Option<&'a ScheduleDeviationRecord>,
    pub position: Option<&'a PositionRecord>,
}

impl<'a> Candidate<'a> {
    pub fn feed_ts(&self) -> DateTime<Utc> {
        match (self.deviation, self.position) {
            (Some(d), _) => d.feed_ts,
            (None, Some(p)) => p.feed_ts,
            (None, None) => DateTime::<Utc>::MIN_UTC,
        }
    }

    pub fn trip_id(&self) -> &'a str {
        match (self.deviation, self.position) {
            (Some(d), _) => d.trip_id.as_str(),
            (None, Some(p)) => p.trip_id.as_str(),
            (None, None) => "",
        }
    }

    pub fn route_id(&self) -> Option<&'a str> {
        self.deviation
            .and_then(|d| d.route_id.as_deref())
            .or_else(|| self.position.and_then(|p| p.route_id.as_deref()))
    }

    /// The deviation side's observation time, else the position side's.
    pub fn observed_at(&self) -> Option<DateTime<Utc>> {
        self.deviation
            .and_then(|d| d.event_ts)
            .or_else(|| self.position.and_then(|p| p.event_ts))
    }
}

/// Builds every candidate pairing keyed on `(feed_ts, trip_id, route_id)`.
///
/// Keys present on both sides yield the cross product of their records, so a
/// duplicated source record produces more than one candidate for the key.
/// Keys present on one side yield one candidate per record with the other
/// side empty. Output is ordered by join key.
pub fn reconcile<'a>(
    deviations: &'a [ScheduleDeviationRecord],
    positions: &'a [PositionRecord],
) -> Vec<Candidate<'a>> {
    let mut by_key: BTreeMap<JoinKey<'a>, (Vec<&'a ScheduleDeviationRecord>, Vec<&'a PositionRecord>)> =
        BTreeMap::new();

    for deviation in deviations {
        by_key.entry(deviation.join_key()).or_default().0.push(deviation);
    }
    for position in positions {
        by_key.entry(position.join_key()).or_default().1.push(position);
    }

    let mut candidates = Vec::with_capacity(deviations.len().max(positions.len()));
    for (left, right) in by_key.into_values() {
        match (left.is_empty(), right.is_empty()) {
            (false, false) => {
                for deviation in &left {
                    for position in &right {
                        candidates.push(Candidate {
                            deviation: Some(*deviation),
                            position: Some(*position),
                        });
                    }
                }
            }
            (false, true) => candidates.extend(left.into_iter().map(|deviation| Candidate {
                deviation: Some(deviation),
                position: None,
            })),
            (true, false) => candidates.extend(right.into_iter().map(|position| Candidate {
                deviation: None,
                position: Some(position),
            })),
            (true, true) => {}
        }
    }

    candidates
}

/// Distinct `(feed_ts, trip_id)` keys across the candidates.
pub fn distinct_event_keys<'a>(candidates: &[Candidate<'a>]) -> BTreeSet<(DateTime<Utc>, &'a str)> {
    candidates.iter().map(|c| (c.feed_ts(), c.trip_id())).collect()
}
