//! Error types for the flow engine
//!
//! `SourceError` lives at the partition-source boundary. `FlowError` is what
//! the monitor and its control surface report. None of the variants are
//! fatal to the engine: range and parameter problems are clamped and kept
//! as warnings, subscription failures keep the partition's last snapshot.

use crate::partition::PartitionKey;
use chrono::NaiveDate;
use thiserror::Error;

/// Failure reported by a partition data source
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(String),

    #[error("partition source unavailable: {0}")]
    Unavailable(String),

    #[error("partition stream closed by source")]
    Closed,
}

impl From<rusqlite::Error> for SourceError {
    fn from(err: rusqlite::Error) -> Self {
        SourceError::Database(err.to_string())
    }
}

/// Errors surfaced by the monitor
#[derive(Debug, Error)]
pub enum FlowError {
    /// One partition's subscription failed; other partitions are unaffected
    #[error("subscription for {key} failed: {source}")]
    Subscription {
        key: PartitionKey,
        #[source]
        source: SourceError,
    },

    /// Start after end; treated as an empty range
    #[error("invalid range: start {start} is after end {end}")]
    InvalidRange { start: NaiveDate, end: NaiveDate },

    /// Non-positive bucket width or smoothing window; clamped
    #[error("invalid {name} {value}, clamped to {clamped}")]
    InvalidAggregationParams {
        name: &'static str,
        value: i64,
        clamped: i64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("invalid configuration value: {0}")]
    Config(String),

    #[error("monitor task is no longer running")]
    MonitorClosed,
}

pub type Result<T> = std::result::Result<T, FlowError>;
