//! Core data types for the flow pipeline

use crate::error::FlowError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

const MILLIS_PER_MINUTE: i64 = 60 * 1000;

/// One flow-rate measurement (ml/min)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl Sample {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }

    pub fn epoch_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

/// One output point: a bucket (or a raw sample when unbucketed)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AggregatedPoint {
    pub bucket_start: DateTime<Utc>,
    pub value: f64,
}

/// Aggregation selected on the control surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    Raw,
    #[serde(rename = "15min")]
    Min15,
    Hourly,
    Daily,
}

impl AggregationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AggregationMode::Raw => "raw",
            AggregationMode::Min15 => "15min",
            AggregationMode::Hourly => "hourly",
            AggregationMode::Daily => "daily",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "raw" => Some(AggregationMode::Raw),
            "15min" | "min15" | "15m" => Some(AggregationMode::Min15),
            "hourly" | "1h" => Some(AggregationMode::Hourly),
            "daily" | "1d" => Some(AggregationMode::Daily),
            _ => None,
        }
    }

    /// Bucket width in minutes, `None` for raw
    pub fn bucket_minutes(&self) -> Option<i64> {
        match self {
            AggregationMode::Raw => None,
            AggregationMode::Min15 => Some(15),
            AggregationMode::Hourly => Some(60),
            AggregationMode::Daily => Some(24 * 60),
        }
    }

    pub fn aggregation(&self) -> Aggregation {
        match self.bucket_minutes() {
            Some(minutes) => Aggregation::Bucket(BucketWidth::from_minutes(minutes)),
            None => Aggregation::Raw,
        }
    }

    pub fn all() -> [AggregationMode; 4] {
        [
            AggregationMode::Raw,
            AggregationMode::Min15,
            AggregationMode::Hourly,
            AggregationMode::Daily,
        ]
    }
}

/// How the aggregator treats the series
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    Raw,
    Bucket(BucketWidth),
}

/// Fixed bucket width, always at least one minute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketWidth {
    millis: i64,
}

impl BucketWidth {
    pub fn try_from_minutes(minutes: i64) -> Result<Self, FlowError> {
        if minutes < 1 {
            return Err(FlowError::InvalidAggregationParams {
                name: "bucket width (minutes)",
                value: minutes,
                clamped: 1,
            });
        }
        Ok(Self {
            millis: minutes.saturating_mul(MILLIS_PER_MINUTE),
        })
    }

    /// Non-positive widths are clamped to one minute
    pub fn from_minutes(minutes: i64) -> Self {
        Self::try_from_minutes(minutes).unwrap_or_else(|e| {
            log::warn!("⚠️  {}", e);
            Self {
                millis: MILLIS_PER_MINUTE,
            }
        })
    }

    pub fn as_millis(&self) -> i64 {
        self.millis
    }

    pub fn as_duration(&self) -> Duration {
        Duration::milliseconds(self.millis)
    }
}

/// Moving-average settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Smoothing {
    pub enabled: bool,
    pub window: usize,
}

impl Smoothing {
    pub const DEFAULT_WINDOW: usize = 3;

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            window: Self::DEFAULT_WINDOW,
        }
    }

    pub fn try_new(enabled: bool, window: i64) -> Result<Self, FlowError> {
        if window < 1 {
            return Err(FlowError::InvalidAggregationParams {
                name: "smoothing window",
                value: window,
                clamped: 1,
            });
        }
        Ok(Self {
            enabled,
            window: usize::try_from(window).unwrap_or(usize::MAX),
        })
    }

    /// Windows below one are clamped to one
    pub fn new(enabled: bool, window: i64) -> Self {
        Self::try_new(enabled, window).unwrap_or(Self { enabled, window: 1 })
    }
}

impl Default for Smoothing {
    fn default() -> Self {
        Self::disabled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_bucket_widths() {
        assert_eq!(AggregationMode::Raw.aggregation(), Aggregation::Raw);
        assert_eq!(
            AggregationMode::Min15.aggregation(),
            Aggregation::Bucket(BucketWidth::from_minutes(15))
        );
        assert_eq!(
            AggregationMode::Daily.bucket_minutes(),
            Some(1440)
        );
    }

    #[test]
    fn test_mode_names_round_trip() {
        for mode in AggregationMode::all() {
            assert_eq!(AggregationMode::from_str(mode.as_str()), Some(mode));
        }
        assert_eq!(AggregationMode::from_str("min15"), Some(AggregationMode::Min15));
        assert_eq!(AggregationMode::from_str("weekly"), None);
    }

    #[test]
    fn test_bucket_width_clamps() {
        assert!(BucketWidth::try_from_minutes(0).is_err());
        assert_eq!(BucketWidth::from_minutes(0).as_millis(), 60_000);
        assert_eq!(BucketWidth::from_minutes(-30).as_millis(), 60_000);
        assert_eq!(BucketWidth::from_minutes(60).as_duration(), Duration::hours(1));
    }

    #[test]
    fn test_smoothing_window_clamps() {
        assert!(matches!(
            Smoothing::try_new(true, 0),
            Err(FlowError::InvalidAggregationParams { clamped: 1, .. })
        ));
        assert_eq!(Smoothing::new(true, -4).window, 1);
        assert_eq!(Smoothing::new(true, 5).window, 5);
        assert!(!Smoothing::default().enabled);
    }

    #[test]
    fn test_mode_serializes_with_control_names() {
        let json = serde_json::to_string(&AggregationMode::Min15).unwrap();
        assert_eq!(json, "\"15min\"");
    }
}
