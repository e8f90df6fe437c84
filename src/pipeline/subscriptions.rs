//! Live subscription registry keyed by day partition
//!
//! The set holds exactly one subscription per desired key. Each one is
//! served by a pump task that forwards source events into a shared bounded
//! fan-in channel, tagged with the key and the epoch the key was opened
//! under. The owner calls `accept` for every delivery; deliveries whose
//! epoch no longer matches an open handle are dropped, so a batch racing a
//! close (or a close followed by a reopen) never reaches the store.

use super::store::SeriesStore;
use crate::error::{FlowError, SourceError};
use crate::partition::PartitionKey;
use crate::source::{PartitionSource, SourceEvent};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Lifecycle of one key: Closed → Opening → Open → Closing → Closed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Opening,
    Open,
    Closing,
    Closed,
}

/// One event from a pump task
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub key: PartitionKey,
    pub epoch: u64,
    pub event: SourceEvent,
}

/// Outcome of a delivery that matched a live epoch
#[derive(Debug, Clone, PartialEq)]
pub enum Accepted {
    /// Snapshot handed to the store; `changed` is false for identical content
    Applied {
        key: PartitionKey,
        changed: bool,
        samples: usize,
    },
    /// Source error; the last snapshot stays in the store
    Failed { key: PartitionKey, error: SourceError },
}

/// Membership changes made by one `reconcile`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub opened: Vec<PartitionKey>,
    pub closed: Vec<PartitionKey>,
    pub retained: Vec<PartitionKey>,
}

impl Reconciliation {
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty()
    }
}

struct SubscriptionHandle {
    epoch: u64,
    state: SubscriptionState,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
    last_error: Option<SourceError>,
}

pub struct SubscriptionSet {
    source: Arc<dyn PartitionSource>,
    store: Arc<SeriesStore>,
    deliveries: mpsc::Sender<Delivery>,
    handles: BTreeMap<PartitionKey, SubscriptionHandle>,
    /// Pump tasks of closed keys, awaited on shutdown
    retired: Vec<JoinHandle<()>>,
    next_epoch: u64,
}

impl SubscriptionSet {
    /// Returns the set and the receiving end of its fan-in channel
    pub fn new(
        source: Arc<dyn PartitionSource>,
        store: Arc<SeriesStore>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Delivery>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let set = Self {
            source,
            store,
            deliveries: tx,
            handles: BTreeMap::new(),
            retired: Vec::new(),
            next_epoch: 1,
        };
        (set, rx)
    }

    /// Bring the open set in line with `desired`.
    ///
    /// Stale keys are closed (and their data released) before new keys are
    /// opened. Keys in both sets keep their subscription and epoch.
    pub fn reconcile(&mut self, desired: &[PartitionKey]) -> Reconciliation {
        let desired: BTreeSet<PartitionKey> = desired.iter().copied().collect();

        let closed: Vec<PartitionKey> = self
            .handles
            .keys()
            .filter(|key| !desired.contains(key))
            .copied()
            .collect();
        for key in &closed {
            self.close(*key);
        }

        let mut opened = Vec::new();
        let mut retained = Vec::new();
        for key in desired {
            if self.handles.contains_key(&key) {
                retained.push(key);
            } else {
                self.open(key);
                opened.push(key);
            }
        }

        let result = Reconciliation {
            opened,
            closed,
            retained,
        };
        if !result.is_noop() {
            log::info!(
                "🔁 Subscriptions reconciled: +{} -{} ={} (source: {})",
                result.opened.len(),
                result.closed.len(),
                result.retained.len(),
                self.source.name()
            );
        }
        result
    }

    /// Open `key` under a fresh epoch; returns the key's epoch
    pub fn open(&mut self, key: PartitionKey) -> u64 {
        if let Some(handle) = self.handles.get(&key) {
            return handle.epoch;
        }

        let epoch = self.next_epoch;
        self.next_epoch += 1;

        let (stop_tx, stop_rx) = oneshot::channel();
        let task = tokio::spawn(pump(
            self.source.clone(),
            key,
            epoch,
            self.deliveries.clone(),
            stop_rx,
        ));

        log::debug!("Opening {} (epoch {})", key, epoch);
        self.handles.insert(
            key,
            SubscriptionHandle {
                epoch,
                state: SubscriptionState::Opening,
                stop: Some(stop_tx),
                task,
                last_error: None,
            },
        );
        epoch
    }

    /// Stop `key`'s subscription and release its data. Returns false if it
    /// was not open.
    pub fn close(&mut self, key: PartitionKey) -> bool {
        let Some(mut handle) = self.handles.remove(&key) else {
            return false;
        };

        handle.state = SubscriptionState::Closing;
        if let Some(stop) = handle.stop.take() {
            let _ = stop.send(());
        }
        self.retired.push(handle.task);
        self.retired.retain(|task| !task.is_finished());

        self.store.clear_partition(key);
        log::debug!("Closed {} (epoch {})", key, handle.epoch);
        true
    }

    pub fn close_all(&mut self) {
        let keys: Vec<PartitionKey> = self.handles.keys().copied().collect();
        for key in keys {
            self.close(key);
        }
    }

    /// Close everything and wait for every pump task to exit
    pub async fn shutdown(&mut self) {
        self.close_all();
        for task in self.retired.drain(..) {
            if let Err(e) = task.await {
                log::warn!("⚠️  Subscription task ended abnormally: {}", e);
            }
        }
    }

    /// Apply one delivery if its epoch is still current
    pub fn accept(&mut self, delivery: Delivery) -> Option<Accepted> {
        let Delivery { key, epoch, event } = delivery;

        let handle = match self.handles.get_mut(&key) {
            Some(handle) if handle.epoch == epoch => handle,
            _ => {
                log::debug!("Dropping stale delivery for {} (epoch {})", key, epoch);
                return None;
            }
        };

        match event {
            SourceEvent::Replace(mut samples) => {
                handle.state = SubscriptionState::Open;
                handle.last_error = None;
                let reported = samples.len();
                samples.retain(|sample| key.admits(sample.timestamp));
                if samples.len() < reported {
                    log::warn!(
                        "⚠️  Dropped {} samples outside {} (timestamps off by more than a day)",
                        reported - samples.len(),
                        key
                    );
                }
                let count = samples.len();
                let changed = self.store.apply_partition(key, samples);
                Some(Accepted::Applied {
                    key,
                    changed,
                    samples: count,
                })
            }
            SourceEvent::Error(error) => {
                log::warn!("⚠️  Subscription for {} failed: {}", key, error);
                handle.last_error = Some(error.clone());
                Some(Accepted::Failed { key, error })
            }
        }
    }

    pub fn active_keys(&self) -> Vec<PartitionKey> {
        self.handles.keys().copied().collect()
    }

    pub fn state(&self, key: &PartitionKey) -> SubscriptionState {
        self.handles
            .get(key)
            .map_or(SubscriptionState::Closed, |handle| handle.state)
    }

    pub fn epoch(&self, key: &PartitionKey) -> Option<u64> {
        self.handles.get(key).map(|handle| handle.epoch)
    }

    /// True while some key has neither delivered data nor failed
    pub fn is_loading(&self) -> bool {
        self.handles
            .values()
            .any(|h| h.state == SubscriptionState::Opening && h.last_error.is_none())
    }

    /// Current per-key failures, as warnings
    pub fn errors(&self) -> Vec<FlowError> {
        self.handles
            .iter()
            .filter_map(|(key, handle)| {
                handle.last_error.clone().map(|source| FlowError::Subscription {
                    key: *key,
                    source,
                })
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

impl std::fmt::Debug for SubscriptionSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionSet")
            .field("source", &self.source.name())
            .field("keys", &self.active_keys())
            .field("next_epoch", &self.next_epoch)
            .finish()
    }
}

/// Forward one key's events until stopped or the source ends the stream
async fn pump(
    source: Arc<dyn PartitionSource>,
    key: PartitionKey,
    epoch: u64,
    deliveries: mpsc::Sender<Delivery>,
    mut stop: oneshot::Receiver<()>,
) {
    let subscribed = tokio::select! {
        biased;
        _ = &mut stop => return,
        result = source.subscribe(key) => result,
    };

    let mut subscription = match subscribed {
        Ok(subscription) => subscription,
        Err(error) => {
            let delivery = Delivery {
                key,
                epoch,
                event: SourceEvent::Error(error),
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
            event = subscription.next_event() => match event {
                Some(event) => (event, false),
                None => (SourceEvent::Error(SourceError::Closed), true),
            },
        };

        let delivered = tokio::select! {
            biased;
            _ = &mut stop => break,
            sent = deliveries.send(Delivery { key, epoch, event }) => sent.is_ok(),
        };

        if ended || !delivered {
            break;
        }
    }

    subscription.cancel();
}
