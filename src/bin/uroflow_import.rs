//! History Import - load a JSON store export into SQLite
//!
//! Reads a `history/{patient}/{year}/{month}/{day}/...` export and writes
//! every sample into `flow_samples`. Each imported day replaces whatever
//! the table held for that patient and day. Patient records, devices and
//! alert lists (`patients/*`, `devices/*`, `alerts/*`) go to `store_nodes`.
//!
//! Usage:
//!   cargo run --release --bin uroflow_import -- <export.json> [--patient <id>]
//!
//! Without `--patient`, every patient under `history` is imported.

use chrono::FixedOffset;
use dotenv::dotenv;
use log::{info, warn};
use rusqlite::{params, Connection};
use serde_json::Value;
use std::env;
use std::fs;
use uroflow::source::node::history_partitions;
use uroflow::source::sqlite::{ensure_schema, insert_sample, put_node};
use uroflow::MonitorConfig;

/// Replace each day of one patient's history; returns (days, samples)
fn import_patient(
    conn: &mut Connection,
    patient_id: &str,
    history: &Value,
    offset: &FixedOffset,
) -> Result<(usize, usize), rusqlite::Error> {
    let partitions = history_partitions(history, offset);
    let tx = conn.transaction()?;

    let mut samples = 0;
    for (key, day) in &partitions {
        tx.execute(
            "DELETE FROM flow_samples WHERE patient_id = ?1 AND year = ?2 AND month = ?3 AND day = ?4",
            params![patient_id, key.year, key.month, key.day],
        )?;
        for sample in day {
            insert_sample(&tx, patient_id, *key, sample)?;
        }
        samples += day.len();
    }

    tx.commit()?;
    Ok((partitions.len(), samples))
}

/// Top-level branches copied as single nodes
const NODE_BRANCHES: [&str; 3] = ["patients", "devices", "alerts"];

/// Write every `{branch}/{id}` child of the export; returns the node count
fn import_nodes(
    conn: &mut Connection,
    export: &Value,
    only_patient: Option<&String>,
) -> Result<usize, rusqlite::Error> {
    let tx = conn.transaction()?;
    let mut count = 0;

    for branch in NODE_BRANCHES {
        let Some(children) = export.get(branch).and_then(Value::as_object) else {
            continue;
        };
        for (id, node) in children {
            // devices are shared, everything else is per patient
            if branch != "devices" && only_patient.is_some_and(|only| only != id) {
                continue;
            }
            put_node(&tx, &format!("{}/{}", branch, id), node)?;
            count += 1;
        }
    }

    tx.commit()?;
    Ok(count)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let Some(input) = args.get(1).filter(|arg| !arg.starts_with("--")) else {
        return Err("usage: uroflow_import <export.json> [--patient <id>]".into());
    };
    let only_patient = args
        .iter()
        .position(|arg| arg == "--patient")
        .and_then(|idx| args.get(idx + 1));

    let config = MonitorConfig::from_env();

    info!("📥 History Import");
    info!("   ├─ Input: {}", input);
    info!("   ├─ Database: {}", config.db_path);
    info!("   └─ UTC offset: {}", config.utc_offset);

    let export: Value = serde_json::from_str(&fs::read_to_string(input)?)?;
    let Some(patients) = export.get("history").and_then(Value::as_object) else {
        return Err(format!("{} has no 'history' object", input).into());
    };

    let mut conn = Connection::open(&config.db_path)?;
    ensure_schema(&conn)?;

    let mut total_days = 0;
    let mut total_samples = 0;

    for (patient_id, history) in patients {
        if only_patient.is_some_and(|only| only != patient_id) {
            continue;
        }
        let (days, samples) = import_patient(&mut conn, patient_id, history, &config.utc_offset)?;
        info!("   ├─ {}: {} days, {} samples", patient_id, days, samples);
        total_days += days;
        total_samples += samples;
    }

    let nodes = import_nodes(&mut conn, &export, only_patient)?;

    if total_days == 0 && nodes == 0 {
        warn!("⚠️  Nothing imported");
    }
    info!(
        "✅ Imported {} days, {} samples, {} nodes",
        total_days, total_samples, nodes
    );

    Ok(())
}
