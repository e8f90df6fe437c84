//! Patient side feeds: device status and alert history
//!
//! Three node watches run next to the day subscriptions:
//! `patients/{id}` (only to learn the assigned device), `devices/{device}`
//! and `alerts/{id}`. Like day partitions, every watch is pumped into one
//! fan-in channel under an epoch, and a device reassignment reopens the
//! device watch under a new epoch so the old device can no longer report.

use crate::error::SourceError;
use crate::source::{NodeEvent, NodeFeed};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Shown until a device reports
pub const STATUS_UNKNOWN: &str = "Unknown";
/// Device node without a status (or no device node at all)
pub const STATUS_OFFLINE: &str = "offline";

/// One entry of a patient's alert history, as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Child key under `alerts/{patient}`
    pub id: String,
    pub record: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum WatchTarget {
    Patient,
    Device,
    Alerts,
}

impl fmt::Display for WatchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WatchTarget::Patient => "patient",
            WatchTarget::Device => "device",
            WatchTarget::Alerts => "alerts",
        };
        f.write_str(name)
    }
}

/// One event from a node pump task
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDelivery {
    pub target: WatchTarget,
    pub epoch: u64,
    pub event: NodeEvent,
}

struct WatchHandle {
    path: String,
    epoch: u64,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    last_error: Option<SourceError>,
}

pub struct PatientWatch {
    feed: Option<Arc<dyn NodeFeed>>,
    patient_id: String,
    deliveries: mpsc::Sender<NodeDelivery>,
    handles: BTreeMap<WatchTarget, WatchHandle>,
    retired: Vec<JoinHandle<()>>,
    next_epoch: u64,
    device_id: Option<String>,
    device_status: String,
    alerts: Vec<Alert>,
}

impl PatientWatch {
    /// `feed == None` gives a watch that never opens anything
    pub fn new(
        feed: Option<Arc<dyn NodeFeed>>,
        patient_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<NodeDelivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let watch = Self {
            feed,
            patient_id: patient_id.into(),
            deliveries: tx,
            handles: BTreeMap::new(),
            retired: Vec::new(),
            next_epoch: 1,
            device_id: None,
            device_status: STATUS_UNKNOWN.to_string(),
            alerts: Vec::new(),
        };
        (watch, rx)
    }

    /// Open the patient record and alert watches
    pub fn start(&mut self) {
        let Some(feed) = &self.feed else {
            log::debug!("No node feed; device status and alerts stay empty");
            return;
        };
        log::info!("👤 Watching patient {} (feed: {})", self.patient_id, feed.feed_name());

        let patient_path = format!("patients/{}", self.patient_id);
        let alerts_path = format!("alerts/{}", self.patient_id);
        self.open(WatchTarget::Patient, patient_path);
        self.open(WatchTarget::Alerts, alerts_path);
    }

    fn open(&mut self, target: WatchTarget, path: String) {
        let Some(feed) = self.feed.clone() else {
            return;
        };
        self.close(target);

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(pump(
            feed,
            path.clone(),
            target,
            epoch,
            self.deliveries.clone(),
            stop_rx,
        ));

        log::debug!("Watching {} as {} (epoch {})", path, target, epoch);
        self.handles.insert(
            target,
            WatchHandle {
                path,
                epoch,
                stop: Some(stop_tx),
                task,
                last_error: None,
            },
        );
    }

    fn close(&mut self, target: WatchTarget) -> bool {
        let Some(mut handle) = self.handles.remove(&target) else {
            return false;
        };
        if let Some(stop) = handle.stop.take() {
            let _ = stop.send(());
        }
        self.retired.push(handle.task);
        self.retired.retain(|task| !task.is_finished());
        true
    }

    /// Close every watch and wait for the pump tasks to exit
    pub async fn shutdown(&mut self) {
        let targets: Vec<WatchTarget> = self.handles.keys().copied().collect();
        for target in targets {
            self.close(target);
        }
        for task in self.retired.drain(..) {
            if let Err(e) = task.await {
                log::warn!("⚠️  Node watch task ended abnormally: {}", e);
            }
        }
    }

    /// Apply one delivery if its epoch is still current. Returns true when
    /// the visible device status or alert list changed.
    pub fn accept(&mut self, delivery: NodeDelivery) -> bool {
        let NodeDelivery { target, epoch, event } = delivery;

        let handle = match self.handles.get_mut(&target) {
            Some(handle) if handle.epoch == epoch => handle,
            _ => {
                log::debug!("Dropping stale {} delivery (epoch {})", target, epoch);
                return false;
            }
        };

        let node = match event {
            NodeEvent::Snapshot(node) => {
                handle.last_error = None;
                node
            }
            NodeEvent::Error(error) => {
                log::warn!("⚠️  Watch on {} failed: {}", handle.path, error);
                handle.last_error = Some(error);
                return false;
            }
        };

        match target {
            WatchTarget::Patient => self.assign_device(device_id_of(node.as_ref())),
            WatchTarget::Device => {
                let status = status_of(node.as_ref());
                if status == self.device_status {
                    return false;
                }
                log::info!("📟 Device {} is {}", self.device_id.as_deref().unwrap_or("-"), status);
                self.device_status = status;
                true
            }
            WatchTarget::Alerts => {
                let alerts = alerts_of(node.as_ref());
                if alerts == self.alerts {
                    return false;
                }
                log::info!("🔔 {} alerts for patient {}", alerts.len(), self.patient_id);
                self.alerts = alerts;
                true
            }
        }
    }

    fn assign_device(&mut self, device_id: Option<String>) -> bool {
        if device_id == self.device_id {
            return false;
        }
        log::info!(
            "🔗 Patient {} device: {} → {}",
            self.patient_id,
            self.device_id.as_deref().unwrap_or("none"),
            device_id.as_deref().unwrap_or("none")
        );

        self.close(WatchTarget::Device);
        self.device_status = STATUS_UNKNOWN.to_string();
        if let Some(id) = &device_id {
            self.open(WatchTarget::Device, format!("devices/{}", id));
        }
        self.device_id = device_id;
        true
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn device_status(&self) -> &str {
        &self.device_status
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    /// Failing watches as `path: error`
    pub fn errors(&self) -> Vec<String> {
        self.handles
            .values()
            .filter_map(|handle| {
                handle
                    .last_error
                    .as_ref()
                    .map(|error| format!("{}: {}", handle.path, error))
            })
            .collect()
    }

    pub fn watched_paths(&self) -> Vec<String> {
        self.handles.values().map(|handle| handle.path.clone()).collect()
    }
}

impl fmt::Debug for PatientWatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatientWatch")
            .field("patient_id", &self.patient_id)
            .field("paths", &self.watched_paths())
            .field("device_status", &self.device_status)
            .field("alerts", &self.alerts.len())
            .finish()
    }
}

/// `deviceId` of a patient record; absent, null and empty mean no device
fn device_id_of(patient: Option<&Value>) -> Option<String> {
    match patient?.get("deviceId")? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn status_of(device: Option<&Value>) -> String {
    device
        .and_then(|node| node.get("status"))
        .and_then(Value::as_str)
        .filter(|status| !status.is_empty())
        .unwrap_or(STATUS_OFFLINE)
        .to_string()
}

/// Children of the alerts node in key order; null children are skipped
fn alerts_of(node: Option<&Value>) -> Vec<Alert> {
    match node {
        Some(Value::Object(map)) => map
            .iter()
            .filter(|(_, record)| !record.is_null())
            .map(|(id, record)| Alert {
                id: id.clone(),
                record: record.clone(),
            })
            .collect(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter(|(_, record)| !record.is_null())
            .map(|(index, record)| Alert {
                id: index.to_string(),
                record: record.clone(),
            })
            .collect(),
        _ => Vec::new(),
    }
}

/// Forward one node's events until stopped or the feed ends the stream
async fn pump(
    feed: Arc<dyn NodeFeed>,
    path: String,
    target: WatchTarget,
    epoch: u64,
    deliveries: mpsc::Sender<NodeDelivery>,
    mut stop: oneshot::Receiver<()>,
) {
    let watched = tokio::select! {
        biased;
        _ = &mut stop => return,
        result = feed.watch(&path) => result,
    };

    let mut watch = match watched {
        Ok(watch) => watch,
        Err(error) => {
            let delivery = NodeDelivery {
                target,
                epoch,
                event: NodeEvent::Error(error),
            };
            tokio::select! {
                biased;
                _ = &mut stop => {}
                _ = deliveries.send(delivery) => {}
            }
            return;
        }
    };

    loop {
        let (event, ended) = tokio::select! {
            biased;
            _ = &mut stop => break,
            event = watch.next_event() => match event {
                Some(event) => (event, false),
                None => (NodeEvent::Error(SourceError::Closed), true),
            },
        };

        let delivered = tokio::select! {
            biased;
            _ = &mut stop => break,
            sent = deliveries.send(NodeDelivery { target, epoch, event }) => sent.is_ok(),
        };

        if ended || !delivered {
            break;
        }
    }

    watch.cancel();
}
