/// Score given to every member of a population with no spread.
pub const DEGENERATE_SCORE: f64 = 100.0;

/// Min-max scales the present values onto 0–100.
///
/// Absent or non-finite values stay absent. When every present value is
/// equal, each one maps to [`DEGENERATE_SCORE`].
pub fn min_max_normalize(values: &[Option<f64>]) -> Vec<Option<f64>> {
    let present = values.iter().flatten().copied().filter(|v| v.is_finite());
    let Some((min, max)) = present.fold(None, |acc: Option<(f64, f64)>, v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    }) else {
        return vec![None; values.len()];
    };

    let span = max - min;
    values
        .iter()
        .map(|value| {
            let v = value.filter(|v| v.is_finite())?;
            if span == 0.0 {
                Some(DEGENERATE_SCORE)
            } else {
                Some((v - min) / span * 100.0)
            }
        })
        .collect()
}
