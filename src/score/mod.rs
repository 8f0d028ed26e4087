//! Stop prioritization: blends vulnerability, crash proximity and
//! reliability deficit into one ranked score per stop.

pub mod normalize;
pub mod priority;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::info;

use crate::aggregate::StopHourAggregate;
use crate::materialize::{CommitSummary, ReplaceScope, ServiceWindow, TableStore};
pub use priority::{
    PriorityScore, ScoreInput, ScoreWeights, compute_priorities, dense_rank, load_score_inputs,
    reliability_deficits,
};

/// Rebuilds the whole priority table.
///
/// Reliability deficits come from the stop-hour rows whose service date is in
/// `[today - lookback_days, today]`.
pub fn refresh_priorities(
    store: &TableStore,
    inputs: &[ScoreInput],
    weights: &ScoreWeights,
    today: NaiveDate,
    lookback_days: u32,
) -> Result<CommitSummary> {
    weights.validate()?;

    let window = ServiceWindow::trailing(today, lookback_days)?;
    let stop_hours: Vec<StopHourAggregate> = store.read_window(&window)?;
    let deficits = reliability_deficits(&stop_hours);
    let scores = compute_priorities(inputs, &deficits, weights);

    info!(
        window = %window,
        inputs = inputs.len(),
        stops_with_deficit = deficits.len(),
        scored = scores.len(),
        "Priority scores computed"
    );
    store.replace(ReplaceScope::All, scores, "score priorities")
}

#[cfg(test)]
mod tests {
    use std::fs;

    use chrono_tz::America::Denver;

    use super::*;
    use crate::aggregate::headway::HeadwayIndex;
    use crate::aggregate::stop_hour::aggregate_stop_hours;
    use crate::aggregate::test_support::event;
    use crate::resolve::test_support::service_day;

    #[test]
    fn test_refresh_priorities_rewrites_table() {
        let dir = std::env::temp_dir().join(format!(
            "transit_reliability_score_{}",
            std::process::id()
        ));
        let _ = fs::remove_dir_all(&dir);
        let store = TableStore::new(dir);

        let events = vec![
            event("T1", Some("15"), Some("S1"), "08:00:00", Some(900)),
            event("T2", Some("15"), Some("S2"), "08:00:00", Some(0)),
        ];
        let stop_hours = aggregate_stop_hours(&events, Denver, 300, &HeadwayIndex::default());
        store.replace(ReplaceScope::All, stop_hours, "seed").unwrap();

        let inputs = vec![ScoreInput {
            stop_id: "S3".to_string(),
            vulnerability: Some(10.0),
            crash_proximity: Some(1.0),
        }];
        let summary =
            refresh_priorities(&store, &inputs, &ScoreWeights::default(), service_day(), 35).unwrap();
        assert_eq!(summary.rows_written, 3);

        let scores: Vec<PriorityScore> = store.read_all().unwrap();
        let ranks: Vec<(&str, u32)> = scores
            .iter()
            .map(|s| (s.stop_id.as_str(), s.priority_rank))
            .collect();
        // S1 misses every bucket: deficit 1.0 -> 100; S3 gets 5 + 30
        assert_eq!(ranks, vec![("S3", 1), ("S1", 2), ("S2", 3)]);

        let summary = refresh_priorities(&store, &[], &ScoreWeights::default(), service_day(), 35)
            .unwrap();
        assert_eq!(summary.rows_written, 2);
        assert_eq!(store.read_all::<PriorityScore>().unwrap().len(), 2);
    }
}
