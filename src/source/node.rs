//! Sample extraction from JSON store nodes
//!
//! A day node is an arbitrary tree written by devices. Any object carrying
//! `ts` plus `volume_ml` or `flowRate` is a sample; everything else is
//! walked into.

use crate::partition::PartitionKey;
use crate::pipeline::types::Sample;
use chrono::{DateTime, FixedOffset, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;

/// Collect every sample in `node`, depth first.
///
/// Naive timestamps are read in the local calendar at `offset`. Values that
/// are not numbers count as 0. Samples with unreadable timestamps are skipped.
pub fn gather_samples(node: &Value, offset: &FixedOffset) -> Vec<Sample> {
    let mut samples = Vec::new();
    gather(node, offset, &mut samples);
    samples
}

fn gather(node: &Value, offset: &FixedOffset, out: &mut Vec<Sample>) {
    match node {
        Value::Object(map) => {
            if let Some(ts) = map.get("ts").filter(|ts| is_truthy(ts)) {
                if let Some(raw) = map.get("volume_ml").or_else(|| map.get("flowRate")) {
                    match parse_timestamp(ts, offset) {
                        Some(timestamp) => out.push(Sample::new(timestamp, parse_value(raw))),
                        None => log::debug!("Skipping sample with unreadable ts: {}", ts),
                    }
                    return;
                }
            }
            for child in map.values() {
                gather(child, offset, out);
            }
        }
        Value::Array(items) => {
            for child in items {
                gather(child, offset, out);
            }
        }
        _ => {}
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn parse_timestamp(ts: &Value, offset: &FixedOffset) -> Option<DateTime<Utc>> {
    match ts {
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => {
            if let Ok(parsed) = DateTime::parse_from_rfc3339(s) {
                return Some(parsed.with_timezone(&Utc));
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"]
                .iter()
                .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
                .and_then(|naive| offset.from_local_datetime(&naive).single())
                .map(|local| local.with_timezone(&Utc))
        }
        _ => None,
    }
}

fn parse_value(raw: &Value) -> f64 {
    let value = match raw {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.trim().parse::<f64>().unwrap_or(0.0),
        Value::Bool(true) => 1.0,
        _ => 0.0,
    };
    if value.is_nan() {
        0.0
    } else {
        value
    }
}

/// Split a patient history tree (`{year: {month: {day: node}}}`) into
/// per-day sample batches, in calendar order.
///
/// Branches whose names are not numbers are skipped.
pub fn history_partitions(history: &Value, offset: &FixedOffset) -> Vec<(PartitionKey, Vec<Sample>)> {
    let mut partitions = Vec::new();

    let Some(years) = history.as_object() else {
        return partitions;
    };

    for (year, months) in years {
        let Ok(year) = year.parse::<i32>() else {
            log::warn!("Skipping history branch '{}': not a year", year);
            continue;
        };
        let Some(months) = months.as_object() else { continue };

        for (month, days) in months {
            let Ok(month) = month.parse::<u32>() else { continue };
            let Some(days) = days.as_object() else { continue };

            for (day, node) in days {
                let Ok(day) = day.parse::<u32>() else { continue };
                let key = PartitionKey::new(year, month, day);
                if key.date().is_none() {
                    log::warn!("Skipping history node {}: not a calendar day", key);
                    continue;
                }
                partitions.push((key, gather_samples(node, offset)));
            }
        }
    }

    partitions.sort_by_key(|(key, _)| *key);
    partitions
}
