//! # Flow pipeline
//!
//! Everything between the partition sources and the sinks.
//!
//! ## Module Organization
//!
//! - `types` - Samples, aggregated points, modes, bucket widths, smoothing settings
//! - `store` - Merged series built from per-day snapshots
//! - `subscriptions` - One live subscription per day, epoch-tagged fan-in
//! - `patient` - Device status and alert history watches
//! - `aggregate` - Raw pass-through or fixed-width averaging buckets
//! - `smoothing` - Centered moving average
//! - `projector` - Chart labels/values and export rows
//! - `monitor` - Owner task tying it all together

pub mod aggregate;
pub mod monitor;
pub mod patient;
pub mod projector;
pub mod smoothing;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-export commonly used types
pub use aggregate::aggregate;
pub use monitor::{ExportSummary, FlowMonitor, MonitorCommand, MonitorStatus};
pub use patient::{Alert, NodeDelivery, PatientWatch, WatchTarget};
pub use projector::{format_label, project_chart, project_export, ChartData, ExportRow, ExportTable};
pub use smoothing::{moving_average, smooth};
pub use store::{SeriesSnapshot, SeriesStore};
pub use subscriptions::{Accepted, Delivery, Reconciliation, SubscriptionSet, SubscriptionState};
pub use types::{AggregatedPoint, Aggregation, AggregationMode, BucketWidth, Sample, Smoothing};
