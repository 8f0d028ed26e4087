use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use super::normalize::min_max_normalize;
use crate::aggregate::StopHourAggregate;
use crate::materialize::TableRow;

/// Blend weights for the three per-stop scores.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    pub vulnerability: f64,
    pub crash: f64,
    pub reliability: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            vulnerability: 0.5,
            crash: 0.3,
            reliability: 0.2,
        }
    }
}

impl ScoreWeights {
    pub fn validate(&self) -> Result<()> {
        for (name, weight) in [
            ("vulnerability", self.vulnerability),
            ("crash", self.crash),
            ("reliability", self.reliability),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                bail!("{name} weight must be a non-negative number, got {weight}");
            }
        }
        Ok(())
    }
}

/// Externally scored inputs for one stop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreInput {
    pub stop_id: String,
    /// Already on a 0–100 scale.
    pub vulnerability: Option<f64>,
    /// Raw; normalized over the run's population.
    pub crash_proximity: Option<f64>,
}

pub fn load_score_inputs(path: &Path) -> Result<Vec<ScoreInput>> {
    let mut reader =
        csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
    reader
        .deserialize()
        .collect::<Result<Vec<ScoreInput>, _>>()
        .with_context(|| format!("decoding {}", path.display()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityScore {
    pub stop_id: String,
    pub vulnerability_score: f64,
    pub crash_score: f64,
    pub reliability_score: f64,
    pub priority_score: f64,
    pub priority_rank: u32,
}

impl TableRow for PriorityScore {
    const TABLE: &'static str = "stop_priority";

    fn partition_date(&self) -> Option<NaiveDate> {
        None
    }

    fn row_order(&self, other: &Self) -> Ordering {
        self.priority_rank
            .cmp(&other.priority_rank)
            .then_with(|| self.stop_id.cmp(&other.stop_id))
    }
}

/// `1 - on_time / known_delay` per stop over the given stop-hour rows.
///
/// Stops with no known-delay events have no deficit.
pub fn reliability_deficits(rows: &[StopHourAggregate]) -> BTreeMap<String, f64> {
    let mut totals: BTreeMap<&str, (usize, usize)> = BTreeMap::new();
    for row in rows {
        let entry = totals.entry(row.stop_id.as_str()).or_default();
        entry.0 += row.on_time_count;
        entry.1 += row.known_delay_count;
    }
    totals
        .into_iter()
        .filter(|(_, (_, known))| *known > 0)
        .map(|(stop, (on_time, known))| (stop.to_string(), 1.0 - on_time as f64 / known as f64))
        .collect()
}

/// Decimal places kept on a blended priority score.
pub const SCORE_DECIMALS: i32 = 6;

/// Rounds a blended score to [`SCORE_DECIMALS`] places so that blends equal
/// in exact arithmetic compare equal.
pub fn round_score(score: f64) -> f64 {
    let scale = 10f64.powi(SCORE_DECIMALS);
    (score * scale).round() / scale
}

/// Dense rank by descending score: ties share a rank and the next distinct
/// score takes the next integer.
pub fn dense_rank(scores: &[f64]) -> Vec<u32> {
    let mut distinct: Vec<f64> = scores.to_vec();
    distinct.sort_by(|a, b| b.total_cmp(a));
    distinct.dedup();

    scores
        .iter()
        .map(|score| {
            let position = distinct.partition_point(|d| d.total_cmp(score) == Ordering::Greater);
            position as u32 + 1
        })
        .collect()
}

/// Scores every stop that appears in either input and ranks the result.
///
/// Crash and reliability are min-max normalized over the population first;
/// any score still missing counts as 0 in the blend. Output is ordered by
/// rank, then stop id.
pub fn compute_priorities(
    inputs: &[ScoreInput],
    deficits: &BTreeMap<String, f64>,
    weights: &ScoreWeights,
) -> Vec<PriorityScore> {
    let by_stop: BTreeMap<&str, &ScoreInput> =
        inputs.iter().map(|input| (input.stop_id.as_str(), input)).collect();
    let stops: Vec<&str> = by_stop
        .keys()
        .copied()
        .chain(deficits.keys().map(String::as_str))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let vulnerability: Vec<f64> = stops
        .iter()
        .map(|stop| {
            by_stop
                .get(stop)
                .and_then(|i| i.vulnerability)
                .filter(|v| v.is_finite())
                .unwrap_or(0.0)
        })
        .collect();
    let crash_raw: Vec<Option<f64>> = stops
        .iter()
        .map(|stop| by_stop.get(stop).and_then(|i| i.crash_proximity))
        .collect();
    let reliability_raw: Vec<Option<f64>> =
        stops.iter().map(|stop| deficits.get(*stop).copied()).collect();

    let crash = min_max_normalize(&crash_raw);
    let reliability = min_max_normalize(&reliability_raw);

    let priorities: Vec<f64> = (0..stops.len())
        .map(|i| {
            round_score(
                weights.vulnerability * vulnerability[i]
                    + weights.crash * crash[i].unwrap_or(0.0)
                    + weights.reliability * reliability[i].unwrap_or(0.0),
            )
        })
        .collect();
    let ranks = dense_rank(&priorities);

    let mut scores: Vec<PriorityScore> = stops
        .iter()
        .enumerate()
        .map(|(i, stop)| PriorityScore {
            stop_id: stop.to_string(),
            vulnerability_score: vulnerability[i],
            crash_score: crash[i].unwrap_or(0.0),
            reliability_score: reliability[i].unwrap_or(0.0),
            priority_score: priorities[i],
            priority_rank: ranks[i],
        })
        .collect();
    scores.sort_by(|a, b| a.row_order(b));
    scores
}
