//! Pipeline configuration.
//!
//! Values start from built-in defaults, are overridden by an optional JSON
//! file, and finally by environment variables (after `.env` is loaded):
//!
//! ```json
//! {
//!   "on_time_threshold_sec": 300,
//!   "full_lookback_days": 45,
//!   "route_filter": ["0", "15"],
//!   "bbox": { "lon_min": -105.5, "lon_max": -104.4, "lat_min": 39.4, "lat_max": 40.2 }
//! }
//! ```

use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use chrono::TimeDelta;
use chrono_tz::Tz;
use serde::Deserialize;

use crate::aggregate::AggregationSettings;
use crate::feeds::RecordFilter;
use crate::feeds::normalize::BoundingBox;
use crate::materialize::lock::DEFAULT_LOCK_TTL;
use crate::materialize::{EventLookbacks, TableStore};
use crate::score::ScoreWeights;

pub const CONFIG_PATH_VAR: &str = "PIPELINE_CONFIG_PATH";

/// Upper bound for every lookback setting (ten years).
pub const MAX_LOOKBACK_DAYS: u32 = 3650;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigOverrides {
    on_time_threshold_sec: Option<i64>,
    full_lookback_days: Option<u32>,
    incremental_lookback_days: Option<u32>,
    stop_hour_lookback_days: Option<u32>,
    route_day_lookback_days: Option<u32>,
    weight_vulnerability: Option<f64>,
    weight_crash: Option<f64>,
    weight_reliability: Option<f64>,
    agency_timezone: Option<String>,
    route_filter: Option<Vec<String>>,
    table_root: Option<PathBuf>,
    bbox: Option<BoundingBox>,
    lock_ttl_minutes: Option<i64>,
}

impl ConfigOverrides {
    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("parsing config {}", path.display()))
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub on_time_threshold_sec: i64,
    pub event_lookbacks: EventLookbacks,
    pub stop_hour_lookback_days: u32,
    pub route_day_lookback_days: u32,
    pub weights: ScoreWeights,
    pub timezone: Tz,
    pub route_filter: Option<BTreeSet<String>>,
    pub table_root: PathBuf,
    pub bbox: BoundingBox,
    /// Age after which a table lock counts as abandoned.
    pub lock_ttl: TimeDelta,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let aggregation = AggregationSettings::default();
        Self {
            on_time_threshold_sec: aggregation.on_time_threshold_sec,
            event_lookbacks: EventLookbacks::default(),
            stop_hour_lookback_days: aggregation.stop_hour_lookback_days,
            route_day_lookback_days: aggregation.route_day_lookback_days,
            weights: ScoreWeights::default(),
            timezone: aggregation.tz,
            route_filter: None,
            table_root: PathBuf::from("data/tables"),
            bbox: BoundingBox::default(),
            lock_ttl: DEFAULT_LOCK_TTL,
        }
    }
}

impl PipelineConfig {
    /// Loads from the process environment. `config_path` wins over
    /// `PIPELINE_CONFIG_PATH`.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(|| non_empty_var(CONFIG_PATH_VAR).map(PathBuf::from));
        let overrides = match path {
            Some(path) => ConfigOverrides::load(&path)?,
            None => ConfigOverrides::default(),
        };
        Self::resolve(overrides, |name| std::env::var(name).ok())
    }

    fn resolve(file: ConfigOverrides, var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = file.on_time_threshold_sec {
            config.on_time_threshold_sec = v;
        }
        if let Some(v) = file.full_lookback_days {
            config.event_lookbacks.full_days = v;
        }
        if let Some(v) = file.incremental_lookback_days {
            config.event_lookbacks.incremental_days = v;
        }
        if let Some(v) = file.stop_hour_lookback_days {
            config.stop_hour_lookback_days = v;
        }
        if let Some(v) = file.route_day_lookback_days {
            config.route_day_lookback_days = v;
        }
        if let Some(v) = file.weight_vulnerability {
            config.weights.vulnerability = v;
        }
        if let Some(v) = file.weight_crash {
            config.weights.crash = v;
        }
        if let Some(v) = file.weight_reliability {
            config.weights.reliability = v;
        }
        if let Some(v) = file.agency_timezone {
            config.timezone = parse_timezone("agency_timezone", &v)?;
        }
        if let Some(v) = file.route_filter {
            config.route_filter = route_set(v);
        }
        if let Some(v) = file.table_root {
            config.table_root = v;
        }
        if let Some(v) = file.bbox {
            config.bbox = v;
        }
        if let Some(v) = file.lock_ttl_minutes {
            config.lock_ttl = lock_ttl("lock_ttl_minutes", v)?;
        }

        if let Some(v) = parse_var(&var, "ON_TIME_THRESHOLD_SEC")? {
            config.on_time_threshold_sec = v;
        }
        if let Some(v) = parse_var(&var, "FULL_LOOKBACK_DAYS")? {
            config.event_lookbacks.full_days = v;
        }
        if let Some(v) = parse_var(&var, "INCREMENTAL_LOOKBACK_DAYS")? {
            config.event_lookbacks.incremental_days = v;
        }
        if let Some(v) = parse_var(&var, "STOP_HOUR_LOOKBACK_DAYS")? {
            config.stop_hour_lookback_days = v;
        }
        if let Some(v) = parse_var(&var, "ROUTE_DAY_LOOKBACK_DAYS")? {
            config.route_day_lookback_days = v;
        }
        if let Some(v) = parse_var(&var, "WEIGHT_VULNERABILITY")? {
            config.weights.vulnerability = v;
        }
        if let Some(v) = parse_var(&var, "WEIGHT_CRASH")? {
            config.weights.crash = v;
        }
        if let Some(v) = parse_var(&var, "WEIGHT_RELIABILITY")? {
            config.weights.reliability = v;
        }
        if let Some(v) = trimmed(&var, "AGENCY_TIMEZONE") {
            config.timezone = parse_timezone("AGENCY_TIMEZONE", &v)?;
        }
        if let Some(v) = trimmed(&var, "ROUTE_FILTER") {
            config.route_filter = route_set(v.split(',').map(str::to_string));
        }
        if let Some(v) = trimmed(&var, "TABLE_ROOT") {
            config.table_root = PathBuf::from(v);
        }
        if let Some(v) = parse_var(&var, "TABLE_LOCK_TTL_MINUTES")? {
            config.lock_ttl = lock_ttl("TABLE_LOCK_TTL_MINUTES", v)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.on_time_threshold_sec < 0 {
            bail!(
                "ON_TIME_THRESHOLD_SEC must be non-negative, got {}",
                self.on_time_threshold_sec
            );
        }
        for (name, days) in [
            ("FULL_LOOKBACK_DAYS", self.event_lookbacks.full_days),
            ("INCREMENTAL_LOOKBACK_DAYS", self.event_lookbacks.incremental_days),
            ("STOP_HOUR_LOOKBACK_DAYS", self.stop_hour_lookback_days),
            ("ROUTE_DAY_LOOKBACK_DAYS", self.route_day_lookback_days),
        ] {
            if days > MAX_LOOKBACK_DAYS {
                bail!("{name} must be at most {MAX_LOOKBACK_DAYS}, got {days}");
            }
        }
        if self.event_lookbacks.incremental_days > self.event_lookbacks.full_days {
            bail!(
                "INCREMENTAL_LOOKBACK_DAYS ({}) exceeds FULL_LOOKBACK_DAYS ({})",
                self.event_lookbacks.incremental_days,
                self.event_lookbacks.full_days
            );
        }
        self.weights.validate()?;
        let b = &self.bbox;
        if b.lon_min > b.lon_max || b.lat_min > b.lat_max {
            bail!("bounding box has inverted bounds: {b:?}");
        }
        Ok(())
    }

    pub fn aggregation_settings(&self) -> AggregationSettings {
        AggregationSettings {
            on_time_threshold_sec: self.on_time_threshold_sec,
            stop_hour_lookback_days: self.stop_hour_lookback_days,
            route_day_lookback_days: self.route_day_lookback_days,
            tz: self.timezone,
        }
    }

    pub fn record_filter(&self) -> RecordFilter {
        RecordFilter {
            routes: self.route_filter.clone(),
            bbox: self.bbox,
        }
    }

    pub fn store(&self) -> TableStore {
        TableStore::new(&self.table_root).with_lock_ttl(self.lock_ttl)
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn trimmed(var: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    var(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T>(var: &impl Fn(&str) -> Option<String>, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    trimmed(var, name)
        .map(|raw| {
            raw.parse::<T>()
                .map_err(|e| anyhow!("invalid {name}={raw:?}: {e}"))
        })
        .transpose()
}

fn parse_timezone(name: &str, raw: &str) -> Result<Tz> {
    raw.trim()
        .parse::<Tz>()
        .map_err(|e| anyhow!("invalid {name}={raw:?}: {e}"))
}

/// Empty filters mean "no filter".
fn lock_ttl(name: &str, minutes: i64) -> Result<TimeDelta> {
    if minutes <= 0 {
        bail!("{name} must be positive, got {minutes}");
    }
    TimeDelta::try_minutes(minutes).ok_or_else(|| anyhow!("{name} is out of range: {minutes}"))
}

fn route_set(routes: impl IntoIterator<Item = String>) -> Option<BTreeSet<String>> {
    let set: BTreeSet<String> = routes
        .into_iter()
        .map(|r| r.trim().to_string())
        .filter(|r| !r.is_empty())
        .collect();
    (!set.is_empty()).then_some(set)
}
