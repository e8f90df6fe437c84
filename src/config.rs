//! Monitor configuration from environment variables

use crate::partition::RangePreset;
use crate::pipeline::types::{AggregationMode, Smoothing};
use chrono::{FixedOffset, Local, Offset};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for the flow monitor
///
/// Loaded from environment variables with sensible defaults.
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Path to SQLite database file
    pub db_path: String,

    /// Patient whose history is charted; also prefixes export file names
    pub patient_id: String,

    /// Fan-in channel capacity (deliveries from all partition subscriptions)
    pub channel_buffer: usize,

    /// SQLite poll interval per subscribed day, in milliseconds
    pub poll_interval_ms: u64,

    /// Directory CSV exports are written to
    pub export_dir: PathBuf,

    /// Offset of the local calendar used for day partitions and labels
    pub utc_offset: FixedOffset,

    /// Initial range preset
    pub preset: RangePreset,

    /// Initial aggregation mode
    pub mode: AggregationMode,

    /// Initial smoothing settings
    pub smoothing: Smoothing,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            db_path: "data/uroflow.db".to_string(),
            patient_id: "unknown".to_string(),
            channel_buffer: 1024,
            poll_interval_ms: 1000,
            export_dir: PathBuf::from("exports"),
            utc_offset: Local::now().offset().fix(),
            preset: RangePreset::Today,
            mode: AggregationMode::Hourly,
            smoothing: Smoothing::disabled(),
        }
    }
}

impl MonitorConfig {
    /// Load configuration from environment variables
    ///
    /// Environment variables:
    /// - `UROFLOW_DB_PATH` (default: data/uroflow.db)
    /// - `UROFLOW_PATIENT_ID` (default: unknown)
    /// - `UROFLOW_CHANNEL_BUFFER` (default: 1024)
    /// - `UROFLOW_POLL_INTERVAL_MS` (default: 1000)
    /// - `UROFLOW_EXPORT_DIR` (default: exports)
    /// - `UROFLOW_UTC_OFFSET_MINUTES` (default: host offset at startup)
    /// - `UROFLOW_PRESET` (default: today)
    /// - `UROFLOW_MODE` (default: hourly)
    /// - `UROFLOW_SMOOTHING` (default: false)
    /// - `UROFLOW_SMOOTHING_WINDOW` (default: 3)
    ///
    /// Unparseable values fall back to the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let smoothing_enabled = env::var("UROFLOW_SMOOTHING")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.smoothing.enabled);

        let smoothing_window = env::var("UROFLOW_SMOOTHING_WINDOW")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(Smoothing::DEFAULT_WINDOW as i64);

        Self {
            db_path: env::var("UROFLOW_DB_PATH").unwrap_or(defaults.db_path),

            patient_id: env::var("UROFLOW_PATIENT_ID").unwrap_or(defaults.patient_id),

            channel_buffer: env::var("UROFLOW_CHANNEL_BUFFER")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.channel_buffer),

            poll_interval_ms: env::var("UROFLOW_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.poll_interval_ms),

            export_dir: env::var("UROFLOW_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.export_dir),

            utc_offset: env::var("UROFLOW_UTC_OFFSET_MINUTES")
                .ok()
                .and_then(|s| s.parse::<i32>().ok())
                .and_then(|minutes| FixedOffset::east_opt(minutes.checked_mul(60)?))
                .unwrap_or(defaults.utc_offset),

            preset: env::var("UROFLOW_PRESET")
                .ok()
                .and_then(|s| RangePreset::from_str(&s))
                .unwrap_or(defaults.preset),

            mode: env::var("UROFLOW_MODE")
                .ok()
                .and_then(|s| AggregationMode::from_str(&s))
                .unwrap_or(defaults.mode),

            smoothing: Smoothing::new(smoothing_enabled, smoothing_window),
        }
    }

    /// Defaults for one patient, everything else as `Default`
    pub fn for_patient(patient_id: impl Into<String>) -> Self {
        Self {
            patient_id: patient_id.into(),
            ..Self::default()
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}
