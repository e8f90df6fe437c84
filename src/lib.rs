//! # uroflow
//!
//! Live urine-flow charting engine.
//!
//! A patient's flow history lives in a store partitioned by calendar day.
//! The engine keeps one live subscription per day of the selected date
//! range, merges every partition's latest snapshot into a single ordered
//! series, and re-projects that series into chart and export data on every
//! change.
//!
//! ```text
//! DateRange ─→ PartitionKey list
//!                 ↓
//! SubscriptionSet (one pump task per day, epoch-tagged deliveries)
//!                 ↓
//! SeriesStore (whole-partition replace, stable time sort)
//!                 ↓
//! aggregate() ─→ smooth() ─→ project_chart() / project_export()
//!                 ↓
//! ChartSink / ExportSink
//! ```
//!
//! `FlowMonitor` owns the whole flow as a single tokio task. Next to the
//! day subscriptions it watches the patient's device status and alert
//! history through a `NodeFeed`.
//!
//! ## Module Organization
//!
//! - `partition` - Day partition keys, date ranges and presets
//! - `source` - Partition and node sources (in-memory, SQLite) and node parsing
//! - `pipeline` - Store, subscriptions, aggregation, smoothing, projection, monitor
//! - `sink` - Chart and export consumers
//! - `config` - Environment-driven configuration

pub mod config;
pub mod error;
pub mod partition;
pub mod pipeline;
pub mod sink;
pub mod source;

pub use config::MonitorConfig;
pub use error::{FlowError, Result, SourceError};
pub use partition::{DateRange, PartitionKey, RangeControl, RangePreset};
pub use pipeline::{
    AggregatedPoint, AggregationMode, Alert, ChartData, ExportTable, FlowMonitor, MonitorStatus, Sample,
    SeriesStore, Smoothing, SubscriptionSet,
};
pub use sink::{ChartSink, ExportSink};
pub use source::{NodeEvent, NodeFeed, PartitionSource, SourceEvent, Subscription};
