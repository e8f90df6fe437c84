//! Consumers of projected output
//!
//! - `chart` - Chart sinks (log, watch channel, in-memory recorder)
//! - `csv_export` - CSV file export

pub mod chart;
pub mod csv_export;

use crate::error::FlowError;
use crate::partition::DateRange;
use crate::pipeline::projector::{ChartData, ExportTable};
use std::path::PathBuf;

pub use chart::{ChannelChartSink, LogChartSink, VecChartSink};
pub use csv_export::{write_csv, CsvExportSink};

/// Receives chart data whenever the projection changes
pub trait ChartSink: Send + Sync {
    fn publish(&self, chart: &ChartData);
}

/// Receives an export table with its suggested file name
pub trait ExportSink: Send + Sync {
    /// Returns where the table ended up
    fn export(&self, filename: &str, table: &ExportTable) -> Result<PathBuf, FlowError>;
}

/// Suggested export name: `{patient}_flow_{start}_to_{end}.csv`
///
/// The patient id is reduced to `[A-Za-z0-9_-]` so the name always stays a
/// single path component.
pub fn export_filename(patient_id: &str, range: &DateRange) -> String {
    format!(
        "{}_flow_{}_to_{}.csv",
        file_stem(patient_id),
        range.start.format("%Y-%m-%d"),
        range.end.format("%Y-%m-%d")
    )
}

fn file_stem(patient_id: &str) -> String {
    let stem: String = patient_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "patient".to_string()
    } else {
        stem
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_export_filename() {
        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 3, 7).unwrap(),
        );
        assert_eq!(export_filename("p-42", &range), "p-42_flow_2024-03-01_to_2024-03-07.csv");
    }

    #[test]
    fn test_export_filename_stays_one_path_component() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        let range = DateRange::new(day, day);

        let name = export_filename("../../etc/p 1", &range);
        assert_eq!(name, "______etc_p_1_flow_2024-03-07_to_2024-03-07.csv");
        assert!(!name.contains('/') && !name.contains(".."));

        assert_eq!(export_filename("", &range), "patient_flow_2024-03-07_to_2024-03-07.csv");
    }
}
