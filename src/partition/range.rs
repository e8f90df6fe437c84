//! Date ranges, presets and their expansion into partition keys

use super::key::PartitionKey;
use crate::error::FlowError;
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Inclusive calendar-date range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self { start: day, end: day }
    }

    /// A range with start after end selects no days
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    pub fn validate(&self) -> Result<(), FlowError> {
        if self.is_empty() {
            return Err(FlowError::InvalidRange {
                start: self.start,
                end: self.end,
            });
        }
        Ok(())
    }

    /// Every day from start to end, both included
    pub fn days(&self) -> Vec<NaiveDate> {
        let mut days = Vec::new();
        let mut day = self.start;
        while day <= self.end {
            days.push(day);
            match day.succ_opt() {
                Some(next) => day = next,
                None => break,
            }
        }
        days
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        expand_range(self)
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..={}", self.start, self.end)
    }
}

/// Desired subscription set for a range, in calendar order.
///
/// An inverted range yields no keys.
pub fn expand_range(range: &DateRange) -> Vec<PartitionKey> {
    range.days().into_iter().map(PartitionKey::from_date).collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RangePreset {
    Today,
    Yesterday,
    Last7,
    Custom,
}

impl RangePreset {
    pub fn as_str(&self) -> &'static str {
        match self {
            RangePreset::Today => "today",
            RangePreset::Yesterday => "yesterday",
            RangePreset::Last7 => "last7",
            RangePreset::Custom => "custom",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "today" => Some(RangePreset::Today),
            "yesterday" => Some(RangePreset::Yesterday),
            "last7" | "last_7" | "7d" => Some(RangePreset::Last7),
            "custom" => Some(RangePreset::Custom),
            _ => None,
        }
    }

    /// Range selected by this preset; `Custom` keeps `current`
    pub fn resolve(&self, today: NaiveDate, current: DateRange) -> DateRange {
        match self {
            RangePreset::Today => DateRange::single(today),
            RangePreset::Yesterday => DateRange::single(today.pred_opt().unwrap_or(today)),
            RangePreset::Last7 => DateRange::new(
                today.checked_sub_signed(Duration::days(6)).unwrap_or(today),
                today,
            ),
            RangePreset::Custom => current,
        }
    }
}

/// Range control surface state: the active preset and the range it produced.
///
/// Every change replaces the whole range.
#[derive(Clone)]
pub struct RangeControl {
    preset: RangePreset,
    range: DateRange,
    today_fn: Arc<dyn Fn() -> NaiveDate + Send + Sync>,
}

impl RangeControl {
    /// Starts on the `Today` preset
    pub fn new(today_fn: Arc<dyn Fn() -> NaiveDate + Send + Sync>) -> Self {
        let today = today_fn();
        Self {
            preset: RangePreset::Today,
            range: DateRange::single(today),
            today_fn,
        }
    }

    pub fn set_preset(&mut self, preset: RangePreset) -> DateRange {
        let today = (self.today_fn)();
        self.preset = preset;
        self.range = preset.resolve(today, self.range);
        self.range
    }

    /// Explicit start/end always switch the control to `Custom`
    pub fn set_range(&mut self, start: NaiveDate, end: NaiveDate) -> DateRange {
        self.preset = RangePreset::Custom;
        self.range = DateRange::new(start, end);
        self.range
    }

    pub fn preset(&self) -> RangePreset {
        self.preset
    }

    pub fn range(&self) -> DateRange {
        self.range
    }
}

impl fmt::Debug for RangeControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeControl")
            .field("preset", &self.preset)
            .field("range", &self.range)
            .finish()
    }
}
