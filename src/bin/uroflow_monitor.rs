//! Flow Monitor - live chart of one patient's flow history
//!
//! Subscribes to the days of the selected range in the SQLite store, logs
//! every chart change and optionally exports the final projection as CSV.
//! The patient's device status and alert count are logged on exit.
//!
//! Usage:
//!   cargo run --release --bin uroflow_monitor -- [--preset today|yesterday|last7]
//!       [--start YYYY-MM-DD --end YYYY-MM-DD] [--mode raw|15min|hourly|daily]
//!       [--smooth <window>] [--export]
//!
//! Environment variables: see `MonitorConfig::from_env`.

use chrono::NaiveDate;
use dotenv::dotenv;
use log::{error, info, warn};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use uroflow::pipeline::{AggregationMode, FlowMonitor, Smoothing};
use uroflow::sink::{CsvExportSink, LogChartSink};
use uroflow::source::SqliteSource;
use uroflow::{MonitorConfig, RangePreset};

fn arg_value(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|arg| arg == flag)
        .and_then(|idx| args.get(idx + 1))
        .cloned()
}

fn parse_date(flag: &str, value: Option<String>) -> Option<NaiveDate> {
    let value = value?;
    match NaiveDate::parse_from_str(&value, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(e) => {
            warn!("⚠️  Ignoring {} {}: {}", flag, value, e);
            None
        }
    }
}

/// Command-line overrides on top of the environment
fn apply_args(config: &mut MonitorConfig, args: &[String]) {
    if let Some(preset) = arg_value(args, "--preset") {
        match RangePreset::from_str(&preset) {
            Some(preset) => config.preset = preset,
            None => warn!("⚠️  Unknown preset '{}', keeping {}", preset, config.preset.as_str()),
        }
    }

    if let Some(mode) = arg_value(args, "--mode") {
        match AggregationMode::from_str(&mode) {
            Some(mode) => config.mode = mode,
            None => warn!("⚠️  Unknown mode '{}', keeping {}", mode, config.mode.as_str()),
        }
    }

    if let Some(window) = arg_value(args, "--smooth") {
        match window.parse::<i64>() {
            Ok(window) => config.smoothing = Smoothing::new(true, window),
            Err(_) => warn!("⚠️  Invalid smoothing window '{}'", window),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().collect();

    let mut config = MonitorConfig::from_env();
    apply_args(&mut config, &args);

    let start = parse_date("--start", arg_value(&args, "--start"));
    let end = parse_date("--end", arg_value(&args, "--end"));
    let export_on_exit = args.iter().any(|arg| arg == "--export");

    info!("🚀 Flow Monitor");
    info!("   ├─ Database: {}", config.db_path);
    info!("   ├─ Patient: {}", config.patient_id);
    info!("   ├─ Poll interval: {}ms", config.poll_interval_ms);
    info!("   ├─ UTC offset: {}", config.utc_offset);
    info!("   └─ Export on exit: {}", if export_on_exit { "yes" } else { "no" });

    if let Some(parent) = Path::new(&config.db_path).parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let source = Arc::new(SqliteSource::open(
        &config.db_path,
        config.patient_id.clone(),
        config.poll_interval(),
    )?);
    let export_sink = CsvExportSink::new(config.export_dir.clone());

    let monitor = FlowMonitor::spawn_with_feed(
        config,
        source.clone(),
        source,
        Arc::new(LogChartSink),
        Arc::new(export_sink),
    );

    match (start, end) {
        (Some(start), Some(end)) => monitor.set_range(start, end).await?,
        (None, None) => {}
        _ => warn!("⚠️  --start and --end must be given together, ignoring"),
    }

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    if export_on_exit {
        match monitor.export().await {
            Ok(summary) => info!("✅ Exported {} rows to {}", summary.rows, summary.path.display()),
            Err(e) => error!("❌ Export failed: {}", e),
        }
    }

    let status = monitor.status().await?;
    info!(
        "📟 Device {}: {} ({} alerts)",
        status.device_id.as_deref().unwrap_or("-"),
        status.device_status,
        status.alerts.len()
    );
    for warning in &status.warnings {
        warn!("⚠️  {}", warning);
    }

    monitor.shutdown().await?;
    info!("✅ Shutdown complete");

    Ok(())
}
