//! Daily weather inputs for the route-day table.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Snowfall at or above this many millimetres makes a snow day.
pub const SNOW_DAY_MM: f64 = 1.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrecipBin {
    #[default]
    None,
    Light,
    Mod,
    Heavy,
}

impl PrecipBin {
    /// `none` (≤ 0), `light` (≤ 5), `mod` (≤ 20), `heavy` above that.
    pub fn classify(precip_mm: f64) -> Self {
        if precip_mm <= 0.0 {
            PrecipBin::None
        } else if precip_mm <= 5.0 {
            PrecipBin::Light
        } else if precip_mm <= 20.0 {
            PrecipBin::Mod
        } else {
            PrecipBin::Heavy
        }
    }
}

impl fmt::Display for PrecipBin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PrecipBin::None => "none",
            PrecipBin::Light => "light",
            PrecipBin::Mod => "mod",
            PrecipBin::Heavy => "heavy",
        };
        f.write_str(name)
    }
}

/// One row of the daily weather CSV.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherObservation {
    pub date: NaiveDate,
    pub precip_mm: Option<f64>,
    pub snow_mm: Option<f64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DayConditions {
    pub precip_bin: PrecipBin,
    pub snow_day: bool,
}

impl From<&WeatherObservation> for DayConditions {
    fn from(obs: &WeatherObservation) -> Self {
        Self {
            precip_bin: obs.precip_mm.map(PrecipBin::classify).unwrap_or_default(),
            snow_day: obs.snow_mm.is_some_and(|mm| mm >= SNOW_DAY_MM),
        }
    }
}

/// Conditions by service date. Dates without an observation read as a dry,
/// snow-free day.
#[derive(Debug, Default)]
pub struct WeatherIndex {
    days: HashMap<NaiveDate, DayConditions>,
}

impl WeatherIndex {
    pub fn new<'a>(observations: impl IntoIterator<Item = &'a WeatherObservation>) -> Self {
        Self {
            days: observations
                .into_iter()
                .map(|obs| (obs.date, DayConditions::from(obs)))
                .collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut reader =
            csv::Reader::from_path(path).with_context(|| format!("opening {}", path.display()))?;
        let observations = reader
            .deserialize()
            .collect::<Result<Vec<WeatherObservation>, _>>()
            .with_context(|| format!("decoding {}", path.display()))?;
        Ok(Self::new(&observations))
    }

    pub fn conditions(&self, date: NaiveDate) -> DayConditions {
        self.days.get(&date).copied().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }
}
