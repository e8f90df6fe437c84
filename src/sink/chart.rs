use super::ChartSink;
use crate::pipeline::projector::ChartData;
use std::sync::{Mutex, PoisonError};
use tokio::sync::watch;

/// Logs a one-line summary of each published chart
#[derive(Debug, Default)]
pub struct LogChartSink;

impl ChartSink for LogChartSink {
    fn publish(&self, chart: &ChartData) {
        match (chart.labels.first(), chart.labels.last()) {
            (Some(first), Some(last)) => {
                let peak = chart.values.iter().copied().fold(f64::MIN, f64::max);
                log::info!(
                    "📈 Chart: {} points [{} .. {}], peak {:.1} ml/min",
                    chart.len(),
                    first,
                    last,
                    peak
                );
            }
            _ => log::info!("📈 Chart: no data"),
        }
    }
}

/// Publishes into a `watch` channel; receivers always see the latest chart
#[derive(Debug)]
pub struct ChannelChartSink {
    tx: watch::Sender<ChartData>,
}

impl ChannelChartSink {
    pub fn new() -> (Self, watch::Receiver<ChartData>) {
        let (tx, rx) = watch::channel(ChartData::default());
        (Self { tx }, rx)
    }

    pub fn subscribe(&self) -> watch::Receiver<ChartData> {
        self.tx.subscribe()
    }
}

impl ChartSink for ChannelChartSink {
    fn publish(&self, chart: &ChartData) {
        self.tx.send_replace(chart.clone());
    }
}

/// Keeps every published chart, in order
#[derive(Debug, Default)]
pub struct VecChartSink {
    charts: Mutex<Vec<ChartData>>,
}

impl VecChartSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn charts(&self) -> Vec<ChartData> {
        self.charts.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn last(&self) -> Option<ChartData> {
        self.charts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.charts.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChartSink for VecChartSink {
    fn publish(&self, chart: &ChartData) {
        self.charts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(chart.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chart(values: &[f64]) -> ChartData {
        ChartData {
            labels: values.iter().map(|v| v.to_string()).collect(),
            values: values.to_vec(),
        }
    }

    #[test]
    fn test_channel_sink_keeps_latest() {
        let (sink, rx) = ChannelChartSink::new();
        assert!(rx.borrow().is_empty());

        sink.publish(&chart(&[1.0]));
        sink.publish(&chart(&[1.0, 2.0]));

        assert_eq!(*rx.borrow(), chart(&[1.0, 2.0]));
    }

    #[test]
    fn test_vec_sink_records_in_order() {
        let sink = VecChartSink::new();
        sink.publish(&chart(&[]));
        sink.publish(&chart(&[3.0]));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.last(), Some(chart(&[3.0])));
    }

    #[test]
    fn test_log_sink_accepts_empty_chart() {
        LogChartSink.publish(&ChartData::default());
        LogChartSink.publish(&chart(&[4.0, 9.5]));
    }
}
