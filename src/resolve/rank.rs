//! Deterministic selection of one candidate per `(feed_ts, trip_id)`.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::resolve::reconcile::Candidate;

/// Orders candidates best-first.
///
/// Keys, in order: observation timestamp desc, deviation entity id desc,
/// position entity id desc. Missing values sort after present ones. Rows that
/// tie on all three fall through to stop sequence asc, stop id asc and
/// vehicle id asc so the pick never depends on input order.
pub fn candidate_order(a: &Candidate<'_>, b: &Candidate<'_>) -> Ordering {
    desc_nulls_last(a.observed_at(), b.observed_at())
        .then_with(|| {
            desc_nulls_last(
                a.deviation.and_then(|d| d.entity_id.as_deref()),
                b.deviation.and_then(|d| d.entity_id.as_deref()),
            )
        })
        .then_with(|| {
            desc_nulls_last(
                a.position.and_then(|p| p.entity_id.as_deref()),
                b.position.and_then(|p| p.entity_id.as_deref()),
            )
        })
        .then_with(|| {
            asc_nulls_last(
                a.deviation.and_then(|d| d.stop_sequence),
                b.deviation.and_then(|d| d.stop_sequence),
            )
        })
        .then_with(|| {
            asc_nulls_last(
                a.deviation.and_then(|d| d.stop_id.as_deref()),
                b.deviation.and_then(|d| d.stop_id.as_deref()),
            )
        })
        .then_with(|| {
            asc_nulls_last(
                a.position.and_then(|p| p.vehicle_id.as_deref()),
                b.position.and_then(|p| p.vehicle_id.as_deref()),
            )
        })
}

/// Picks the top-ranked candidate from one group.
pub fn select_best<'a>(group: &[Candidate<'a>]) -> Option<Candidate<'a>> {
    group.iter().copied().min_by(candidate_order)
}

/// Groups candidates by `(feed_ts, trip_id)` and keeps the best of each.
/// Output is ordered by that key.
pub fn deduplicate<'a>(candidates: Vec<Candidate<'a>>) -> Vec<Candidate<'a>> {
    let mut groups: BTreeMap<(DateTime<Utc>, &'a str), Vec<Candidate<'a>>> = BTreeMap::new();
    for candidate in candidates {
        groups
            .entry((candidate.feed_ts(), candidate.trip_id()))
            .or_default()
            .push(candidate);
    }

    groups
        .into_values()
        .filter_map(|group| select_best(&group))
        .collect()
}

fn desc_nulls_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => b.cmp(&a),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn asc_nulls_last<T: Ord>(a: Option<T>, b: Option<T>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}
