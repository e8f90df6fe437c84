//! Integration tests for the flow monitor over an in-memory source
//!
//! Tests drive the monitor through its control surface and observe it the
//! way a UI would: through the chart sink, the status query and exports.

#[cfg(test)]
mod monitor_tests {
    use chrono::{FixedOffset, NaiveDate, TimeZone, Utc};
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use uroflow::pipeline::{AggregationMode, ChartData, FlowMonitor, MonitorStatus, Sample};
    use uroflow::sink::{CsvExportSink, VecChartSink};
    use uroflow::source::MemorySource;
    use uroflow::{MonitorConfig, PartitionKey, RangePreset, SourceError};

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 3, 7).unwrap()
    }

    fn day(d: u32) -> PartitionKey {
        PartitionKey::new(2024, 3, d)
    }

    fn sample(d: u32, hour: u32, minute: u32, value: f64) -> Sample {
        Sample::new(Utc.with_ymd_and_hms(2024, 3, d, hour, minute, 0).unwrap(), value)
    }

    struct Harness {
        source: MemorySource,
        chart: Arc<VecChartSink>,
        monitor: FlowMonitor,
        export_dir: TempDir,
    }

    fn start(source: MemorySource) -> Harness {
        let export_dir = TempDir::new().unwrap();
        let chart = Arc::new(VecChartSink::new());
        let config = MonitorConfig {
            utc_offset: FixedOffset::east_opt(0).unwrap(),
            channel_buffer: 64,
            ..MonitorConfig::for_patient("p1")
        };

        let monitor = FlowMonitor::spawn_with_clock(
            config,
            Arc::new(source.clone()),
            chart.clone(),
            Arc::new(CsvExportSink::new(export_dir.path())),
            Arc::new(today),
        );

        Harness {
            source,
            chart,
            monitor,
            export_dir,
        }
    }

    /// Poll status until `done` holds
    async fn wait_for(monitor: &FlowMonitor, done: impl Fn(&MonitorStatus) -> bool) -> MonitorStatus {
        for _ in 0..500 {
            let status = monitor.status().await.unwrap();
            if done(&status) {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("monitor did not reach expected state: {:?}", monitor.status().await);
    }

    async fn wait_for_chart(chart: &VecChartSink, done: impl Fn(&ChartData) -> bool) -> ChartData {
        for _ in 0..500 {
            if let Some(last) = chart.last() {
                if done(&last) {
                    return last;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("chart did not reach expected state: {:?}", chart.last());
    }

    async fn wait_for_subscribers(source: &MemorySource, expected: usize) {
        for _ in 0..500 {
            if source.total_subscribers() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} subscribers, found {}", expected, source.total_subscribers());
    }

    fn morning_source() -> MemorySource {
        let source = MemorySource::new();
        source.set_samples(
            day(7),
            vec![sample(7, 9, 0, 100.0), sample(7, 9, 30, 200.0), sample(7, 10, 15, 50.0)],
        );
        source
    }

    #[tokio::test]
    async fn test_hourly_chart_end_to_end() {
        // Test: today's samples reach the chart as hourly averages
        let h = start(morning_source());

        let chart = wait_for_chart(&h.chart, |c| !c.is_empty()).await;
        assert_eq!(chart.labels, vec!["09 : 2024-03-07", "10 : 2024-03-07"]);
        assert_eq!(chart.values, vec![150.0, 50.0]);

        let status = wait_for(&h.monitor, |s| !s.loading).await;
        assert_eq!(status.fetched_points, 3);
        assert_eq!(status.aggregated_points, 2);
        assert_eq!(status.active_keys, vec![day(7)]);
        assert!(status.warnings.is_empty());

        h.monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_mode_and_smoothing_reproject() {
        // Test: control changes re-project without resubscribing
        let h = start(morning_source());
        wait_for_chart(&h.chart, |c| c.len() == 2).await;

        h.monitor.set_mode(AggregationMode::Raw).await.unwrap();
        let raw = wait_for_chart(&h.chart, |c| c.len() == 3).await;
        assert_eq!(raw.values, vec![100.0, 200.0, 50.0]);
        assert_eq!(raw.labels[1], "09:30:00");

        h.monitor.set_smoothing(true, 3).await.unwrap();
        let smoothed = wait_for_chart(&h.chart, |c| c.values[0] == 150.0).await;
        assert_eq!(smoothed.values, vec![150.0, 350.0 / 3.0, 125.0]);

        // Same settings again: nothing new is published
        let published = h.chart.len();
        h.monitor.set_smoothing(true, 3).await.unwrap();
        h.monitor.set_mode(AggregationMode::Raw).await.unwrap();
        let status = h.monitor.status().await.unwrap();
        assert_eq!(status.aggregated_points, 3);
        assert_eq!(h.chart.len(), published);

        h.monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_range_shows_nothing() {
        // Test: start after end gives no subscriptions, empty chart and a warning
        let h = start(morning_source());
        wait_for_chart(&h.chart, |c| !c.is_empty()).await;

        h.monitor
            .set_range(today(), today().pred_opt().unwrap())
            .await
            .unwrap();

        let status = h.monitor.status().await.unwrap();
        assert!(status.active_keys.is_empty());
        assert_eq!(status.fetched_points, 0);
        assert_eq!(status.aggregated_points, 0);
        assert_eq!(status.warnings.len(), 1);
        assert_eq!(h.chart.last(), Some(ChartData::default()));

        wait_for_subscribers(&h.source, 0).await;
        h.monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_widening_range_picks_up_earlier_days() {
        // Test: today → last7 keeps today's subscription and adds the rest
        let source = morning_source();
        source.set_samples(day(3), vec![sample(3, 8, 0, 40.0)]);
        source.set_samples(day(1), vec![sample(1, 8, 0, 999.0)]);
        let h = start(source);
        wait_for(&h.monitor, |s| s.fetched_points == 3).await;

        h.monitor.set_preset(RangePreset::Last7).await.unwrap();

        let status = wait_for(&h.monitor, |s| s.fetched_points == 4 && !s.loading).await;
        assert_eq!(status.active_keys.len(), 7);
        assert_eq!(status.active_keys.first(), Some(&day(1)));
        assert_eq!(
            status.range.start,
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()
        );
        wait_for_subscribers(&h.source, 7).await;

        h.monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_day_cleared_removes_only_that_day() {
        // Test: an empty replacement drops exactly that day's samples
        let source = morning_source();
        source.set_samples(day(6), vec![sample(6, 23, 0, 10.0), sample(6, 23, 30, 20.0)]);
        let h = start(source);

        h.monitor
            .set_range(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap(), today())
            .await
            .unwrap();
        wait_for(&h.monitor, |s| s.fetched_points == 5).await;

        h.source.clear(day(6));

        let status = wait_for(&h.monitor, |s| s.fetched_points == 3).await;
        assert_eq!(status.active_keys, vec![day(6), day(7)]);
        let chart = wait_for_chart(&h.chart, |c| c.len() == 2).await;
        assert_eq!(chart.values, vec![150.0, 50.0]);

        h.monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_source_error_is_isolated() {
        // Test: a failing day keeps its last snapshot and other days keep updating
        let source = morning_source();
        source.set_samples(day(6), vec![sample(6, 12, 0, 10.0)]);
        let h = start(source);
        h.monitor
            .set_range(NaiveDate::from_ymd_opt(2024, 3, 6).unwrap(), today())
            .await
            .unwrap();
        wait_for(&h.monitor, |s| s.fetched_points == 4).await;

        h.source
            .fail(day(6), SourceError::Unavailable("permission denied".to_string()));
        let status = wait_for(&h.monitor, |s| !s.warnings.is_empty()).await;
        assert_eq!(status.fetched_points, 4);
        assert!(status.warnings[0].contains("2024-03-06"));

        h.source.set_samples(day(7), vec![sample(7, 9, 0, 1.0)]);
        let status = wait_for(&h.monitor, |s| s.fetched_points == 2).await;
        assert_eq!(status.warnings.len(), 1);

        h.monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_export_writes_current_projection() {
        // Test: export uses the aggregated series and the suggested file name
        let h = start(morning_source());
        wait_for(&h.monitor, |s| s.aggregated_points == 2).await;

        let summary = h.monitor.export().await.unwrap();
        assert_eq!(summary.filename, "p1_flow_2024-03-07_to_2024-03-07.csv");
        assert_eq!(summary.rows, 2);
        assert_eq!(summary.path, h.export_dir.path().join(&summary.filename));

        let content = std::fs::read_to_string(&summary.path).unwrap();
        assert_eq!(
            content,
            "timestamp,value\n2024-03-07T09:00:00.000Z,150\n2024-03-07T10:00:00.000Z,50\n"
        );

        h.monitor.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_leaves_no_listeners() {
        // Test: teardown cancels every subscription before returning
        let h = start(morning_source());
        h.monitor.set_preset(RangePreset::Last7).await.unwrap();
        wait_for(&h.monitor, |s| !s.loading).await;
        wait_for_subscribers(&h.source, 7).await;

        h.monitor.shutdown().await.unwrap();

        assert_eq!(h.source.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_device_status_and_alerts_reach_status() {
        // Test: patient record, device node and alert list are watched live
        let source = morning_source();
        source.put_node("patients/p1", json!({ "name": "A", "bedNo": "12", "deviceId": "dev-9" }));
        source.put_node("devices/dev-9", json!({ "status": "online" }));

        let export_dir = TempDir::new().unwrap();
        let config = MonitorConfig {
            utc_offset: FixedOffset::east_opt(0).unwrap(),
            ..MonitorConfig::for_patient("p1")
        };
        let monitor = FlowMonitor::spawn_with_feed_and_clock(
            config,
            Arc::new(source.clone()),
            Arc::new(source.clone()),
            Arc::new(VecChartSink::new()),
            Arc::new(CsvExportSink::new(export_dir.path())),
            Arc::new(today),
        );

        let status = wait_for(&monitor, |s| s.device_status == "online").await;
        assert_eq!(status.device_id.as_deref(), Some("dev-9"));
        assert!(status.alerts.is_empty());

        source.put_node(
            "alerts/p1",
            json!({ "-A1": { "message": "no flow for 2h" }, "-A2": { "message": "bag full" } }),
        );
        source.put_node("devices/dev-9", json!({ "battery": 5 }));
        let status = wait_for(&monitor, |s| s.alerts.len() == 2 && s.device_status == "offline").await;
        assert_eq!(status.alerts[0].id, "-A1");
        assert_eq!(status.alerts[1].record["message"], "bag full");

        // the flow chart is unaffected by the side feeds
        let status = wait_for(&monitor, |s| s.aggregated_points == 2).await;
        assert_eq!(status.fetched_points, 3);

        monitor.shutdown().await.unwrap();
        assert_eq!(source.node_watcher_count("devices/dev-9"), 0);
        assert_eq!(source.node_watcher_count("alerts/p1"), 0);
    }

    #[tokio::test]
    async fn test_monitor_without_feed_reports_unknown_device() {
        // Test: a monitor spawned without a node feed still charts normally
        let h = start(morning_source());
        let status = wait_for(&h.monitor, |s| s.aggregated_points == 2).await;

        assert_eq!(status.device_status, "Unknown");
        assert_eq!(status.device_id, None);
        assert!(status.alerts.is_empty());

        h.monitor.shutdown().await.unwrap();
    }
}
