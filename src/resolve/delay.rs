use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where a resolved delay came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelaySource {
    /// Taken unmodified from the TripUpdate.
    Reported,
    /// Observation time minus the scheduled time.
    Schedule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResolvedDelay {
    pub seconds: Option<i64>,
    pub source: Option<DelaySource>,
}

/// Resolves one side (arrival or departure) of an event's delay.
///
/// A reported value always wins. Without one, the delay is computed from the
/// scheduled and observed instants when both exist. Otherwise it stays
/// unknown; unknown is never coerced to zero.
pub fn resolve_delay(
    reported: Option<i32>,
    scheduled: Option<DateTime<Utc>>,
    observed: Option<DateTime<Utc>>,
) -> ResolvedDelay {
    if let Some(delay) = reported {
        return ResolvedDelay {
            seconds: Some(i64::from(delay)),
            source: Some(DelaySource::Reported),
        };
    }

    match (scheduled, observed) {
        (Some(scheduled), Some(observed)) => ResolvedDelay {
            seconds: Some((observed - scheduled).num_seconds()),
            source: Some(DelaySource::Schedule),
        },
        _ => ResolvedDelay::default(),
    }
}
