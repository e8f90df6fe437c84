//! Raw pass-through and fixed-width bucket averaging

use super::types::{AggregatedPoint, Aggregation, BucketWidth, Sample};
use chrono::{DateTime, Duration, TimeZone, Utc};

/// Aggregate a series. Pure and deterministic; empty input gives empty output.
pub fn aggregate(series: &[Sample], aggregation: Aggregation) -> Vec<AggregatedPoint> {
    if series.is_empty() {
        return Vec::new();
    }

    match aggregation {
        Aggregation::Raw => raw_points(series),
        Aggregation::Bucket(width) => bucket_points(series, width),
    }
}

/// Samples sorted by timestamp (stable), relabelled as points
fn raw_points(series: &[Sample]) -> Vec<AggregatedPoint> {
    let mut sorted = series.to_vec();
    sorted.sort_by_key(|sample| sample.timestamp);

    sorted
        .into_iter()
        .map(|sample| AggregatedPoint {
            bucket_start: sample.timestamp,
            value: sample.value,
        })
        .collect()
}

/// Contiguous buckets from the epoch-aligned floor of the earliest sample to
/// the bucket holding the latest one. Empty buckets are emitted as 0.
fn bucket_points(series: &[Sample], width: BucketWidth) -> Vec<AggregatedPoint> {
    let width_ms = width.as_millis();

    let (earliest, latest) = series.iter().fold((series[0], series[0]), |(lo, hi), s| {
        (
            if s.timestamp < lo.timestamp { *s } else { lo },
            if s.timestamp > hi.timestamp { *s } else { hi },
        )
    });

    let earliest_ms = earliest.epoch_millis();
    let origin_ms = earliest_ms.div_euclid(width_ms) * width_ms;
    // Whole milliseconds only
    let origin = bucket_origin(origin_ms, earliest.timestamp);

    let bucket_count = ((latest.epoch_millis() - origin_ms) / width_ms) as usize + 1;

    // (sum, count) per bucket index
    let mut buckets = vec![(0.0_f64, 0_u64); bucket_count];
    for sample in series {
        let index = ((sample.epoch_millis() - origin_ms) / width_ms) as usize;
        let bucket = &mut buckets[index];
        bucket.0 += sample.value;
        bucket.1 += 1;
    }

    buckets
        .into_iter()
        .enumerate()
        .map(|(index, (sum, count))| AggregatedPoint {
            bucket_start: origin + Duration::milliseconds(index as i64 * width_ms),
            value: if count > 0 { sum / count as f64 } else { 0.0 },
        })
        .collect()
}

fn bucket_origin(origin_ms: i64, fallback: DateTime<Utc>) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(origin_ms).single().unwrap_or(fallback)
}
