use std::fmt;
use std::str::FromStr;

use anyhow::{Result, anyhow, bail};
use chrono::{NaiveDate, TimeDelta};
use serde::{Deserialize, Serialize};

/// How much history a run reprocesses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Full,
    Incremental,
}

impl FromStr for RunMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" | "full-refresh" => Ok(RunMode::Full),
            "incremental" => Ok(RunMode::Incremental),
            other => bail!("unknown run mode '{other}' (expected 'full' or 'incremental')"),
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Full => f.write_str("full"),
            RunMode::Incremental => f.write_str("incremental"),
        }
    }
}

/// Inclusive range of service dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl ServiceWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        if start > end {
            bail!("window start {start} is after end {end}");
        }
        Ok(Self { start, end })
    }

    /// `[today - lookback_days, today]`. Fails when the start would fall
    /// outside the representable date range.
    pub fn trailing(today: NaiveDate, lookback_days: u32) -> Result<Self> {
        let start = today
            .checked_sub_signed(TimeDelta::days(i64::from(lookback_days)))
            .ok_or_else(|| anyhow!("lookback of {lookback_days} days from {today} is out of range"))?;
        Ok(Self { start, end: today })
    }

    /// Smallest window holding every date, `None` for no dates.
    pub fn covering(dates: impl IntoIterator<Item = NaiveDate>) -> Option<Self> {
        let mut dates = dates.into_iter();
        let first = dates.next()?;
        let (start, end) = dates.fold((first, first), |(lo, hi), d| (lo.min(d), hi.max(d)));
        Some(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    pub fn dates(&self) -> impl Iterator<Item = NaiveDate> + use<> {
        let end = self.end;
        self.start.iter_days().take_while(move |d| *d <= end)
    }

    pub fn len_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    /// Widens both ends by `days`.
    pub fn padded(&self, days: u32) -> Result<Self> {
        let pad = TimeDelta::days(i64::from(days));
        match (self.start.checked_sub_signed(pad), self.end.checked_add_signed(pad)) {
            (Some(start), Some(end)) => Ok(Self { start, end }),
            _ => bail!("padding {self} by {days} days is out of range"),
        }
    }
}

impl fmt::Display for ServiceWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Lookback lengths for the event table, in days.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLookbacks {
    pub full_days: u32,
    pub incremental_days: u32,
}

impl Default for EventLookbacks {
    fn default() -> Self {
        Self {
            full_days: 45,
            incremental_days: 3,
        }
    }
}

/// The window an event-resolution run reprocesses.
pub fn event_window(mode: RunMode, today: NaiveDate, lookbacks: &EventLookbacks) -> Result<ServiceWindow> {
    let days = match mode {
        RunMode::Full => lookbacks.full_days,
        RunMode::Incremental => lookbacks.incremental_days,
    };
    ServiceWindow::trailing(today, days)
}
