//! In-process partition source
//!
//! Holds day snapshots in memory and pushes a full replacement to every
//! live subscriber on each change. Single nodes (patient records, devices,
//! alert lists) are kept by path and watched the same way. Backs the tests
//! and any embedding that receives store notifications through its own
//! channel.

use super::node::{gather_samples, history_partitions};
use super::{NodeEvent, NodeFeed, PartitionSource, SourceEvent, Subscription};
use crate::error::SourceError;
use crate::partition::PartitionKey;
use crate::pipeline::types::Sample;
use async_trait::async_trait;
use chrono::{FixedOffset, Offset, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

type Subscribers<E = SourceEvent> = Vec<(u64, mpsc::UnboundedSender<E>)>;

#[derive(Debug, Default)]
struct MemoryInner {
    partitions: HashMap<PartitionKey, Vec<Sample>>,
    subscribers: HashMap<PartitionKey, Subscribers>,
    refusals: HashMap<PartitionKey, SourceError>,
    nodes: HashMap<String, Value>,
    node_watchers: HashMap<String, Subscribers<NodeEvent>>,
    next_subscriber_id: u64,
}

impl MemoryInner {
    fn broadcast(&mut self, key: PartitionKey, event: SourceEvent) {
        if let Some(subscribers) = self.subscribers.get_mut(&key) {
            subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }

    fn broadcast_node(&mut self, path: &str, event: NodeEvent) {
        if let Some(watchers) = self.node_watchers.get_mut(path) {
            watchers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        }
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_subscriber_id;
        self.next_subscriber_id += 1;
        id
    }
}

#[derive(Debug, Clone)]
pub struct MemorySource {
    inner: Arc<Mutex<MemoryInner>>,
    offset: FixedOffset,
}

impl MemorySource {
    /// Naive node timestamps are read at UTC
    pub fn new() -> Self {
        Self::with_offset(Utc.fix())
    }

    pub fn with_offset(offset: FixedOffset) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MemoryInner::default())),
            offset,
        }
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace a day's content and notify its subscribers
    pub fn set_samples(&self, key: PartitionKey, samples: Vec<Sample>) {
        let mut inner = self.lock();
        if samples.is_empty() {
            inner.partitions.remove(&key);
        } else {
            inner.partitions.insert(key, samples.clone());
        }
        inner.broadcast(key, SourceEvent::Replace(samples));
    }

    /// Replace a day's content from a raw store node
    pub fn set_node(&self, key: PartitionKey, node: &Value) {
        self.set_samples(key, gather_samples(node, &self.offset));
    }

    pub fn clear(&self, key: PartitionKey) {
        self.set_samples(key, Vec::new());
    }

    /// Load a `{year: {month: {day: node}}}` tree; returns the number of days loaded
    pub fn load_history(&self, history: &Value) -> usize {
        let partitions = history_partitions(history, &self.offset);
        let count = partitions.len();
        for (key, samples) in partitions {
            self.set_samples(key, samples);
        }
        count
    }

    /// Report an error to the day's live subscribers without touching its content
    pub fn fail(&self, key: PartitionKey, error: SourceError) {
        self.lock().broadcast(key, SourceEvent::Error(error));
    }

    /// Make future `subscribe` calls for `key` fail (or succeed again with `None`)
    pub fn set_refusal(&self, key: PartitionKey, error: Option<SourceError>) {
        let mut inner = self.lock();
        match error {
            Some(error) => inner.refusals.insert(key, error),
            None => inner.refusals.remove(&key),
        };
    }

    pub fn samples(&self, key: &PartitionKey) -> Vec<Sample> {
        self.lock().partitions.get(key).cloned().unwrap_or_default()
    }

    /// Live subscribers for one day
    pub fn subscriber_count(&self, key: &PartitionKey) -> usize {
        self.lock().subscribers.get(key).map_or(0, Vec::len)
    }

    pub fn total_subscribers(&self) -> usize {
        self.lock().subscribers.values().map(Vec::len).sum()
    }

    /// Write the node at `path` and notify its watchers
    pub fn put_node(&self, path: &str, node: Value) {
        let mut inner = self.lock();
        inner.nodes.insert(path.to_string(), node.clone());
        inner.broadcast_node(path, NodeEvent::Snapshot(Some(node)));
    }

    pub fn remove_node(&self, path: &str) {
        let mut inner = self.lock();
        inner.nodes.remove(path);
        inner.broadcast_node(path, NodeEvent::Snapshot(None));
    }

    /// Report an error to the node's watchers without touching its content
    pub fn fail_node(&self, path: &str, error: SourceError) {
        self.lock().broadcast_node(path, NodeEvent::Error(error));
    }

    pub fn node(&self, path: &str) -> Option<Value> {
        self.lock().nodes.get(path).cloned()
    }

    pub fn node_watcher_count(&self, path: &str) -> usize {
        self.lock().node_watchers.get(path).map_or(0, Vec::len)
    }
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PartitionSource for MemorySource {
    async fn subscribe(&self, key: PartitionKey) -> Result<Subscription, SourceError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut inner = self.lock();
            if let Some(error) = inner.refusals.get(&key) {
                return Err(error.clone());
            }

            let current = inner.partitions.get(&key).cloned().unwrap_or_default();
            // Receiver is alive, so the initial report cannot fail
            let _ = tx.send(SourceEvent::Replace(current));

            let id = inner.next_id();
            inner.subscribers.entry(key).or_default().push((id, tx));
            id
        };

        let inner = Arc::downgrade(&self.inner);
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = inner.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(subscribers) = inner.subscribers.get_mut(&key) {
                    subscribers.retain(|(sid, _)| *sid != id);
                    if subscribers.is_empty() {
                        inner.subscribers.remove(&key);
                    }
                }
            }
        }))
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[async_trait]
impl NodeFeed for MemorySource {
    async fn watch(&self, path: &str) -> Result<Subscription<NodeEvent>, SourceError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let id = {
            let mut inner = self.lock();
            let _ = tx.send(NodeEvent::Snapshot(inner.nodes.get(path).cloned()));

            let id = inner.next_id();
            inner.node_watchers.entry(path.to_string()).or_default().push((id, tx));
            id
        };

        let inner = Arc::downgrade(&self.inner);
        let path = path.to_string();
        Ok(Subscription::new(rx, move || {
            if let Some(inner) = inner.upgrade() {
                let mut inner = inner.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(watchers) = inner.node_watchers.get_mut(&path) {
                    watchers.retain(|(wid, _)| *wid != id);
                    if watchers.is_empty() {
                        inner.node_watchers.remove(&path);
                    }
                }
            }
        }))
    }

    fn feed_name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn key() -> PartitionKey {
        PartitionKey::new(2024, 3, 7)
    }

    fn sample(minute: u32, value: f64) -> Sample {
        Sample::new(Utc.with_ymd_and_hms(2024, 3, 7, 9, minute, 0).unwrap(), value)
    }

    #[tokio::test]
    async fn test_initial_report_then_replacements() {
        let source = MemorySource::new();
        source.set_samples(key(), vec![sample(0, 1.0)]);

        let mut sub = source.subscribe(key()).await.unwrap();
        assert_eq!(sub.next_event().await, Some(SourceEvent::Replace(vec![sample(0, 1.0)])));

        source.set_samples(key(), vec![sample(0, 1.0), sample(5, 2.0)]);
        assert_eq!(
            sub.next_event().await,
            Some(SourceEvent::Replace(vec![sample(0, 1.0), sample(5, 2.0)]))
        );

        source.clear(key());
        assert_eq!(sub.next_event().await, Some(SourceEvent::Replace(vec![])));
    }

    #[tokio::test]
    async fn test_empty_partition_reports_empty_replacement() {
        let source = MemorySource::new();
        let mut sub = source.subscribe(key()).await.unwrap();
        assert_eq!(sub.next_event().await, Some(SourceEvent::Replace(vec![])));
    }

    #[tokio::test]
    async fn test_cancel_unregisters_listener() {
        let source = MemorySource::new();
        let mut first = source.subscribe(key()).await.unwrap();
        let _second = source.subscribe(key()).await.unwrap();
        assert_eq!(source.subscriber_count(&key()), 2);

        first.cancel();
        first.cancel();
        assert_eq!(source.subscriber_count(&key()), 1);

        drop(_second);
        assert_eq!(source.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_refusal_and_failure() {
        let source = MemorySource::new();
        source.set_refusal(key(), Some(SourceError::Unavailable("offline".to_string())));
        assert!(source.subscribe(key()).await.is_err());

        source.set_refusal(key(), None);
        let mut sub = source.subscribe(key()).await.unwrap();
        let _initial = sub.next_event().await;

        source.fail(key(), SourceError::Closed);
        assert_eq!(sub.next_event().await, Some(SourceEvent::Error(SourceError::Closed)));
    }

    #[tokio::test]
    async fn test_set_node_and_history() {
        let source = MemorySource::new();
        source.set_node(key(), &json!({ "a": { "ts": "2024-03-07T09:00:00Z", "flowRate": 12 } }));
        assert_eq!(source.samples(&key()), vec![sample(0, 12.0)]);

        let loaded = source.load_history(&json!({
            "2024": { "03": { "08": { "a": { "ts": "2024-03-08T09:00:00Z", "volume_ml": 3 } } } }
        }));
        assert_eq!(loaded, 1);
        assert_eq!(source.samples(&PartitionKey::new(2024, 3, 8)).len(), 1);
    }

    #[tokio::test]
    async fn test_node_watch_reports_writes_and_removal() {
        let source = MemorySource::new();
        source.put_node("devices/dev-1", json!({ "status": "online" }));

        let mut watch = source.watch("devices/dev-1").await.unwrap();
        assert_eq!(
            watch.next_event().await,
            Some(NodeEvent::Snapshot(Some(json!({ "status": "online" }))))
        );
        assert_eq!(source.node_watcher_count("devices/dev-1"), 1);

        source.put_node("devices/dev-2", json!({ "status": "online" }));
        source.remove_node("devices/dev-1");
        assert_eq!(watch.next_event().await, Some(NodeEvent::Snapshot(None)));

        drop(watch);
        assert_eq!(source.node_watcher_count("devices/dev-1"), 0);
    }
}
