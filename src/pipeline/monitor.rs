//! Flow monitor: the single owner task
//!
//! Control-surface commands and partition deliveries are both handled in one
//! `select!` loop, so range changes, store updates and re-projection never
//! interleave. After each burst of deliveries the series is re-aggregated
//! once and the chart is published if it changed. Device status and alert
//! updates go through the same loop and only touch the status.

use super::aggregate::aggregate;
use super::projector::{project_chart, project_export, ChartData};
use super::smoothing::smooth;
use super::store::SeriesStore;
use super::patient::{Alert, NodeDelivery, PatientWatch};
use super::subscriptions::{Delivery, SubscriptionSet};
use super::types::{AggregatedPoint, AggregationMode, Smoothing};
use crate::config::MonitorConfig;
use crate::error::{FlowError, Result};
use crate::partition::{expand_range, DateRange, PartitionKey, RangeControl, RangePreset};
use crate::sink::{export_filename, ChartSink, ExportSink};
use crate::source::{NodeFeed, PartitionSource};
use chrono::{FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_BUFFER: usize = 64;

const RANGE_NOTICE: &str = "range";
const SMOOTHING_NOTICE: &str = "smoothing";

/// Control-surface requests handled by the owner task
#[derive(Debug)]
pub enum MonitorCommand {
    SetRange { start: NaiveDate, end: NaiveDate },
    SetPreset(RangePreset),
    SetMode(AggregationMode),
    SetSmoothing { enabled: bool, window: i64 },
    Export(oneshot::Sender<Result<ExportSummary>>),
    Status(oneshot::Sender<MonitorStatus>),
    Shutdown,
}

/// What the monitor is showing right now
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitorStatus {
    pub range: DateRange,
    pub preset: RangePreset,
    pub mode: AggregationMode,
    pub smoothing: Smoothing,
    pub active_keys: Vec<PartitionKey>,
    /// Samples in the merged series
    pub fetched_points: usize,
    /// Points after aggregation and smoothing
    pub aggregated_points: usize,
    /// Some open day has not reported yet
    pub loading: bool,
    /// Device assigned in the patient record
    pub device_id: Option<String>,
    pub device_status: String,
    pub alerts: Vec<Alert>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportSummary {
    pub filename: String,
    pub path: PathBuf,
    pub rows: usize,
}

/// Last computed projection and the inputs it was computed from
struct Projection {
    version: u64,
    mode: AggregationMode,
    smoothing: Smoothing,
    fetched: usize,
    points: Vec<AggregatedPoint>,
}

struct MonitorLoop {
    patient_id: String,
    offset: FixedOffset,
    control: RangeControl,
    mode: AggregationMode,
    smoothing: Smoothing,
    store: Arc<SeriesStore>,
    subscriptions: SubscriptionSet,
    patient: PatientWatch,
    chart_sink: Arc<dyn ChartSink>,
    export_sink: Arc<dyn ExportSink>,
    notices: BTreeMap<&'static str, String>,
    projection: Option<Projection>,
    published: Option<ChartData>,
    /// Most deliveries taken per burst before commands get a turn
    drain_limit: usize,
}

impl MonitorLoop {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<MonitorCommand>,
        mut deliveries: mpsc::Receiver<Delivery>,
        mut node_deliveries: mpsc::Receiver<NodeDelivery>,
    ) {
        log::info!("🚀 Starting flow monitor");
        log::info!("   ├─ Patient: {}", self.patient_id);
        log::info!("   ├─ Range: {} ({})", self.control.range(), self.control.preset().as_str());
        log::info!("   ├─ Mode: {}", self.mode.as_str());
        log::info!(
            "   └─ Smoothing: {} (window {})",
            if self.smoothing.enabled { "on" } else { "off" },
            self.smoothing.window
        );

        let initial = self.control.range();
        self.apply_range(initial);
        self.patient.start();

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(MonitorCommand::Shutdown) | None => break,
                    Some(command) => self.handle(command),
                },

                Some(delivery) = deliveries.recv() => {
                    let subscriptions = &mut self.subscriptions;
                    let taken = drain_burst(delivery, &mut deliveries, self.drain_limit, |d| {
                        subscriptions.accept(d);
                    });
                    log::debug!("Accepted burst of {} deliveries", taken);
                    self.refresh();
                }

                Some(delivery) = node_deliveries.recv() => {
                    self.patient.accept(delivery);
                }
            }
        }

        log::info!("🛑 Flow monitor shutting down ({} subscriptions)", self.subscriptions.len());
        self.subscriptions.shutdown().await;
        self.patient.shutdown().await;
        log::info!("✅ Flow monitor stopped");
    }

    fn handle(&mut self, command: MonitorCommand) {
        match command {
            MonitorCommand::SetRange { start, end } => {
                let range = self.control.set_range(start, end);
                self.apply_range(range);
            }
            MonitorCommand::SetPreset(preset) => {
                let range = self.control.set_preset(preset);
                self.apply_range(range);
            }
            MonitorCommand::SetMode(mode) => {
                log::info!("📊 Aggregation mode: {}", mode.as_str());
                self.mode = mode;
                self.refresh();
            }
            MonitorCommand::SetSmoothing { enabled, window } => {
                self.smoothing = match Smoothing::try_new(enabled, window) {
                    Ok(smoothing) => {
                        self.notices.remove(SMOOTHING_NOTICE);
                        smoothing
                    }
                    Err(e) => {
                        log::warn!("⚠️  {}", e);
                        self.notices.insert(SMOOTHING_NOTICE, e.to_string());
                        Smoothing::new(enabled, window)
                    }
                };
                self.refresh();
            }
            MonitorCommand::Export(reply) => {
                let _ = reply.send(self.export());
            }
            MonitorCommand::Status(reply) => {
                let _ = reply.send(self.status());
            }
            MonitorCommand::Shutdown => {}
        }
    }

    fn apply_range(&mut self, range: DateRange) {
        match range.validate() {
            Ok(()) => {
                self.notices.remove(RANGE_NOTICE);
            }
            Err(e) => {
                log::warn!("⚠️  {}", e);
                self.notices.insert(RANGE_NOTICE, e.to_string());
            }
        }

        let keys = expand_range(&range);
        self.subscriptions.reconcile(&keys);
        self.refresh();
    }

    /// Re-aggregate if the series or the settings moved, then publish the
    /// chart if it differs from the last one published
    fn refresh(&mut self) {
        let snapshot = self.store.snapshot_series();

        let current = self.projection.as_ref().is_some_and(|p| {
            p.version == snapshot.version() && p.mode == self.mode && p.smoothing == self.smoothing
        });
        if current {
            return;
        }

        let aggregated = aggregate(&snapshot, self.mode.aggregation());
        let points = smooth(&aggregated, self.smoothing);
        let chart = project_chart(&points, self.mode, &self.offset);

        if self.published.as_ref() != Some(&chart) {
            log::debug!("Publishing chart: {} points from {} samples", chart.len(), snapshot.len());
            self.chart_sink.publish(&chart);
            self.published = Some(chart);
        }

        self.projection = Some(Projection {
            version: snapshot.version(),
            mode: self.mode,
            smoothing: self.smoothing,
            fetched: snapshot.len(),
            points,
        });
    }

    fn export(&mut self) -> Result<ExportSummary> {
        self.refresh();

        let points = self.projection.as_ref().map(|p| p.points.as_slice()).unwrap_or(&[]);
        let table = project_export(points);
        let filename = export_filename(&self.patient_id, &self.control.range());
        let path = self.export_sink.export(&filename, &table)?;

        Ok(ExportSummary {
            filename,
            path,
            rows: table.len(),
        })
    }

    fn status(&self) -> MonitorStatus {
        let (fetched_points, aggregated_points) = self
            .projection
            .as_ref()
            .map_or((0, 0), |p| (p.fetched, p.points.len()));

        let warnings = self
            .notices
            .values()
            .cloned()
            .chain(self.subscriptions.errors().iter().map(ToString::to_string))
            .chain(self.patient.errors())
            .collect();

        MonitorStatus {
            range: self.control.range(),
            preset: self.control.preset(),
            mode: self.mode,
            smoothing: self.smoothing,
            active_keys: self.subscriptions.active_keys(),
            fetched_points,
            aggregated_points,
            loading: self.subscriptions.is_loading(),
            device_id: self.patient.device_id().map(str::to_string),
            device_status: self.patient.device_status().to_string(),
            alerts: self.patient.alerts().to_vec(),
            warnings,
        }
    }
}

/// Apply `first` plus at most `limit` deliveries already queued behind it.
/// Returns how many were applied.
fn drain_burst<T>(
    first: T,
    queue: &mut mpsc::Receiver<T>,
    limit: usize,
    mut apply: impl FnMut(T),
) -> usize {
    apply(first);
    let mut taken = 1;
    while taken <= limit {
        match queue.try_recv() {
            Ok(next) => {
                apply(next);
                taken += 1;
            }
            Err(_) => break,
        }
    }
    taken
}

/// Handle to a running monitor task
#[derive(Debug)]
pub struct FlowMonitor {
    commands: mpsc::Sender<MonitorCommand>,
    task: JoinHandle<()>,
}

impl FlowMonitor {
    /// Spawn the monitor; "today" follows the wall clock at `config.utc_offset`
    pub fn spawn(
        config: MonitorConfig,
        source: Arc<dyn PartitionSource>,
        chart_sink: Arc<dyn ChartSink>,
        export_sink: Arc<dyn ExportSink>,
    ) -> Self {
        let offset = config.utc_offset;
        let today_fn = Arc::new(move || Utc::now().with_timezone(&offset).date_naive());
        Self::spawn_with_clock(config, source, chart_sink, export_sink, today_fn)
    }

    /// Spawn with an injected "today" for presets
    pub fn spawn_with_clock(
        config: MonitorConfig,
        source: Arc<dyn PartitionSource>,
        chart_sink: Arc<dyn ChartSink>,
        export_sink: Arc<dyn ExportSink>,
        today_fn: Arc<dyn Fn() -> NaiveDate + Send + Sync>,
    ) -> Self {
        Self::launch(config, source, None, chart_sink, export_sink, today_fn)
    }

    /// Like `spawn`, also watching the patient's device and alerts on `feed`
    pub fn spawn_with_feed(
        config: MonitorConfig,
        source: Arc<dyn PartitionSource>,
        feed: Arc<dyn NodeFeed>,
        chart_sink: Arc<dyn ChartSink>,
        export_sink: Arc<dyn ExportSink>,
    ) -> Self {
        let offset = config.utc_offset;
        let today_fn = Arc::new(move || Utc::now().with_timezone(&offset).date_naive());
        Self::launch(config, source, Some(feed), chart_sink, export_sink, today_fn)
    }

    /// `spawn_with_feed` with an injected "today"
    pub fn spawn_with_feed_and_clock(
        config: MonitorConfig,
        source: Arc<dyn PartitionSource>,
        feed: Arc<dyn NodeFeed>,
        chart_sink: Arc<dyn ChartSink>,
        export_sink: Arc<dyn ExportSink>,
        today_fn: Arc<dyn Fn() -> NaiveDate + Send + Sync>,
    ) -> Self {
        Self::launch(config, source, Some(feed), chart_sink, export_sink, today_fn)
    }

    fn launch(
        config: MonitorConfig,
        source: Arc<dyn PartitionSource>,
        feed: Option<Arc<dyn NodeFeed>>,
        chart_sink: Arc<dyn ChartSink>,
        export_sink: Arc<dyn ExportSink>,
        today_fn: Arc<dyn Fn() -> NaiveDate + Send + Sync>,
    ) -> Self {
        let store = Arc::new(SeriesStore::new());
        let (subscriptions, deliveries) =
            SubscriptionSet::new(source, store.clone(), config.channel_buffer);
        let (patient, node_deliveries) =
            PatientWatch::new(feed, config.patient_id.clone(), config.channel_buffer);

        let mut control = RangeControl::new(today_fn);
        control.set_preset(config.preset);

        let runner = MonitorLoop {
            patient_id: config.patient_id,
            offset: config.utc_offset,
            control,
            mode: config.mode,
            smoothing: config.smoothing,
            store,
            subscriptions,
            patient,
            chart_sink,
            export_sink,
            notices: BTreeMap::new(),
            projection: None,
            published: None,
            drain_limit: config.channel_buffer.max(1),
        };

        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let task = tokio::spawn(runner.run(rx, deliveries, node_deliveries));

        Self { commands: tx, task }
    }

    async fn send(&self, command: MonitorCommand) -> Result<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| FlowError::MonitorClosed)
    }

    /// Switch to an explicit range (preset becomes custom)
    pub async fn set_range(&self, start: NaiveDate, end: NaiveDate) -> Result<()> {
        self.send(MonitorCommand::SetRange { start, end }).await
    }

    pub async fn set_preset(&self, preset: RangePreset) -> Result<()> {
        self.send(MonitorCommand::SetPreset(preset)).await
    }

    pub async fn set_mode(&self, mode: AggregationMode) -> Result<()> {
        self.send(MonitorCommand::SetMode(mode)).await
    }

    /// Windows below one are clamped and reported as a warning
    pub async fn set_smoothing(&self, enabled: bool, window: i64) -> Result<()> {
        self.send(MonitorCommand::SetSmoothing { enabled, window }).await
    }

    /// Export the current projection through the export sink
    pub async fn export(&self) -> Result<ExportSummary> {
        let (tx, rx) = oneshot::channel();
        self.send(MonitorCommand::Export(tx)).await?;
        rx.await.map_err(|_| FlowError::MonitorClosed)?
    }

    pub async fn status(&self) -> Result<MonitorStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(MonitorCommand::Status(tx)).await?;
        rx.await.map_err(|_| FlowError::MonitorClosed)
    }

    /// Stop the task; returns once every subscription is cancelled
    pub async fn shutdown(self) -> Result<()> {
        let _ = self.commands.send(MonitorCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            log::error!("❌ Flow monitor task failed: {}", e);
            return Err(FlowError::MonitorClosed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::{CsvExportSink, VecChartSink};
    use crate::source::MemorySource;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
    }

    fn spawn(source: &MemorySource, chart: Arc<VecChartSink>) -> FlowMonitor {
        let config = MonitorConfig {
            utc_offset: FixedOffset::east_opt(0).unwrap(),
            ..MonitorConfig::for_patient("p1")
        };
        FlowMonitor::spawn_with_clock(
            config,
            Arc::new(source.clone()),
            chart,
            Arc::new(CsvExportSink::new(std::env::temp_dir())),
            Arc::new(today),
        )
    }

    #[tokio::test]
    async fn test_starts_on_today_and_publishes_empty_chart() {
        let source = MemorySource::new();
        let chart = Arc::new(VecChartSink::new());
        let monitor = spawn(&source, chart.clone());

        let status = monitor.status().await.unwrap();
        assert_eq!(status.range, DateRange::single(today()));
        assert_eq!(status.preset, RangePreset::Today);
        assert_eq!(status.active_keys, vec![PartitionKey::from_date(today())]);
        assert_eq!(chart.charts().first(), Some(&ChartData::default()));

        monitor.shutdown().await.unwrap();
        assert_eq!(source.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_parameter_problems_become_warnings() {
        let source = MemorySource::new();
        let monitor = spawn(&source, Arc::new(VecChartSink::new()));

        let yesterday = today().pred_opt().unwrap();
        monitor.set_range(today(), yesterday).await.unwrap();
        monitor.set_smoothing(true, 0).await.unwrap();

        let status = monitor.status().await.unwrap();
        assert!(status.active_keys.is_empty());
        assert_eq!(status.preset, RangePreset::Custom);
        assert_eq!(status.smoothing, Smoothing::new(true, 1));
        assert_eq!(status.warnings.len(), 2);

        monitor.set_preset(RangePreset::Yesterday).await.unwrap();
        monitor.set_smoothing(true, 3).await.unwrap();

        let status = monitor.status().await.unwrap();
        assert_eq!(status.range, DateRange::single(yesterday));
        assert!(status.warnings.is_empty());

        monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_commands_fail_after_shutdown() {
        let source = MemorySource::new();
        let monitor = spawn(&source, Arc::new(VecChartSink::new()));
        let commands = monitor.commands.clone();

        monitor.shutdown().await.unwrap();

        assert!(commands.send(MonitorCommand::SetMode(AggregationMode::Raw)).await.is_err());
    }

    #[tokio::test]
    async fn test_delivery_burst_is_bounded() {
        let (tx, mut rx) = mpsc::channel(32);
        for i in 1..=10 {
            tx.send(i).await.unwrap();
        }

        let first = rx.recv().await.unwrap();
        let mut applied = Vec::new();
        let taken = drain_burst(first, &mut rx, 3, |i| applied.push(i));

        assert_eq!(taken, 4);
        assert_eq!(applied, vec![1, 2, 3, 4]);
        // the rest stays queued for the next turn of the loop
        assert_eq!(rx.try_recv().ok(), Some(5));
    }
}
