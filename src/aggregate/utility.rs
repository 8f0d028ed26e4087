/// Computes the arithmetic mean of a slice of values. Returns `None` for empty input.
pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Exact quantile of already sorted values, linearly interpolated between
/// the two nearest ranks. Returns `None` for empty input.
pub fn quantile_sorted(sorted: &[f64], q: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let q = q.clamp(0.0, 1.0);
    if sorted.len() == 1 {
        return Some(sorted[0]);
    }
    let pos = q * (sorted.len() as f64 - 1.0);
    let idx = pos.floor() as usize;
    let frac = pos - idx as f64;
    let a = sorted[idx];
    let b = sorted[(idx + 1).min(sorted.len() - 1)];
    Some(a + (b - a) * frac)
}

/// `|delay| <= threshold`, inclusive on both sides.
pub fn is_on_time(delay_sec: i64, threshold_sec: i64) -> bool {
    delay_sec.abs() <= threshold_sec
}

/// Delay statistics over one bucket of events.
///
/// `count` includes events with an unknown delay; everything else only
/// looks at known delays.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DelaySummary {
    pub count: usize,
    pub known: usize,
    pub on_time: usize,
    pub mean: Option<f64>,
    pub p50: Option<f64>,
    pub p90: Option<f64>,
}

impl DelaySummary {
    pub fn from_delays(delays: impl IntoIterator<Item = Option<i64>>, threshold_sec: i64) -> Self {
        let mut count = 0;
        let mut on_time = 0;
        let mut known = Vec::new();
        for delay in delays {
            count += 1;
            if let Some(d) = delay {
                if is_on_time(d, threshold_sec) {
                    on_time += 1;
                }
                known.push(d as f64);
            }
        }
        known.sort_by(|a, b| a.total_cmp(b));

        Self {
            count,
            known: known.len(),
            on_time,
            mean: mean(&known),
            p50: quantile_sorted(&known, 0.5),
            p90: quantile_sorted(&known, 0.9),
        }
    }

    /// Share of known-delay events that were on time.
    pub fn on_time_ratio(&self) -> Option<f64> {
        if self.known == 0 {
            return None;
        }
        Some(self.on_time as f64 / self.known as f64)
    }
}
