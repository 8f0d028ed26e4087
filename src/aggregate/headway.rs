//! Observed headway metrics per stop-hour, produced upstream and joined in.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeadwayBucket {
    pub stop_id: String,
    pub service_date: NaiveDate,
    pub hour: u32,
    pub adherence_rate: Option<f64>,
    pub headway_p50_sec: Option<f64>,
    pub headway_p90_sec: Option<f64>,
}

type HeadwayKey = (String, NaiveDate, u32);

#[derive(Debug, Default)]
pub struct HeadwayIndex {
    buckets: HashMap<HeadwayKey, HeadwayBucket>,
}

impl HeadwayIndex {
    /// Later rows for the same bucket replace earlier ones.
    pub fn new(buckets: impl IntoIterator<Item = HeadwayBucket>) -> Self {
        Self {
            buckets: buckets
                .into_iter()
                .map(|b| ((b.stop_id.clone(), b.service_date, b.hour), b))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut reader =
            csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
        let buckets = reader
            .deserialize()
            .collect::<Result<Vec<HeadwayBucket>, _>>()
            .with_context(|| format!("decoding {}", path.display()))?;
        Ok(Self::new(buckets))
    }

    pub fn get(&self, stop_id: &str, service_date: NaiveDate, hour: u32) -> Option<&HeadwayBucket> {
        self.buckets.get(&(stop_id.to_string(), service_date, hour))
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_stop_date_hour() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let index = HeadwayIndex::new([HeadwayBucket {
            stop_id: "S1".to_string(),
            service_date: date,
            hour: 8,
            adherence_rate: Some(0.8),
            headway_p50_sec: Some(600.0),
            headway_p90_sec: Some(900.0),
        }]);

        assert_eq!(index.get("S1", date, 8).and_then(|b| b.adherence_rate), Some(0.8));
        assert!(index.get("S1", date, 9).is_none());
        assert!(index.get("S2", date, 8).is_none());
    }
}
