//! Chart and export projections of aggregated points

use super::types::{AggregatedPoint, AggregationMode};
use chrono::{DateTime, FixedOffset, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub const EXPORT_HEADER: [&str; 2] = ["timestamp", "value"];

/// Parallel label/value arrays handed to the chart sink
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChartData {
    pub labels: Vec<String>,
    pub values: Vec<f64>,
}

impl ChartData {
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportRow {
    /// ISO-8601 UTC with millisecond precision
    pub timestamp: String,
    pub value: f64,
}

impl ExportRow {
    /// Value keeps full precision (shortest round-trip representation)
    pub fn record(&self) -> [String; 2] {
        [self.timestamp.clone(), self.value.to_string()]
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExportTable {
    pub rows: Vec<ExportRow>,
}

impl ExportTable {
    /// Header record first, then one record per row
    pub fn records(&self) -> Vec<[String; 2]> {
        let mut records = Vec::with_capacity(self.rows.len() + 1);
        records.push([EXPORT_HEADER[0].to_string(), EXPORT_HEADER[1].to_string()]);
        records.extend(self.rows.iter().map(ExportRow::record));
        records
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Display label for a bucket start, in the local calendar at `offset`
pub fn format_label(bucket_start: DateTime<Utc>, mode: AggregationMode, offset: &FixedOffset) -> String {
    let local = bucket_start.with_timezone(offset);
    let pattern = match mode {
        AggregationMode::Daily => "%Y-%m-%d",
        AggregationMode::Hourly => "%H : %Y-%m-%d",
        AggregationMode::Min15 => "%Y-%m-%d %H:%M:%S",
        AggregationMode::Raw => "%H:%M:%S",
    };
    local.format(pattern).to_string()
}

pub fn project_chart(points: &[AggregatedPoint], mode: AggregationMode, offset: &FixedOffset) -> ChartData {
    ChartData {
        labels: points
            .iter()
            .map(|p| format_label(p.bucket_start, mode, offset))
            .collect(),
        values: points.iter().map(|p| p.value).collect(),
    }
}

pub fn project_export(points: &[AggregatedPoint]) -> ExportTable {
    ExportTable {
        rows: points
            .iter()
            .map(|p| ExportRow {
                timestamp: p.bucket_start.to_rfc3339_opts(SecondsFormat::Millis, true),
                value: p.value,
            })
            .collect(),
    }
}
