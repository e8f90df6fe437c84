//! Centered moving average over aggregated points

use super::types::{AggregatedPoint, Smoothing};

/// Apply `smoothing`, or pass the points through when it is disabled
pub fn smooth(points: &[AggregatedPoint], smoothing: Smoothing) -> Vec<AggregatedPoint> {
    if !smoothing.enabled {
        return points.to_vec();
    }
    moving_average(points, smoothing.window)
}

/// Mean over `[i - w/2, i + w/2]`, truncated at both ends of the sequence.
///
/// Boundary windows are narrower, never padded. Window 0 behaves as 1.
pub fn moving_average(points: &[AggregatedPoint], window: usize) -> Vec<AggregatedPoint> {
    if points.is_empty() {
        return Vec::new();
    }

    let half = window.max(1) / 2;
    let last = points.len() - 1;

    points
        .iter()
        .enumerate()
        .map(|(i, point)| {
            let start = i.saturating_sub(half);
            let end = i.saturating_add(half).min(last);
            let span = &points[start..=end];
            let sum: f64 = span.iter().map(|p| p.value).sum();

            AggregatedPoint {
                bucket_start: point.bucket_start,
                value: sum / span.len() as f64,
            }
        })
        .collect()
}
