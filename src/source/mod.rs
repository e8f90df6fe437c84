//! Partition data sources
//!
//! A source hands out one live subscription per day partition. Each
//! subscription reports the partition's entire content whenever it changes,
//! starting with one report right after `subscribe`, so consumers only ever
//! replace, never patch. Single store nodes (patient records, devices,
//! alert lists) are watched the same way through `NodeFeed`.
//!
//! - `memory` - In-process source, also used by tests
//! - `sqlite` - Polls a `flow_samples` table per day
//! - `node` - Sample extraction from JSON store nodes

pub mod memory;
pub mod node;
pub mod sqlite;

use crate::error::SourceError;
use crate::partition::PartitionKey;
use crate::pipeline::types::Sample;
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

pub use memory::MemorySource;
pub use node::{gather_samples, history_partitions};
pub use sqlite::SqliteSource;

/// What a subscription yields
#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    /// Full content of the partition; empty means cleared
    Replace(Vec<Sample>),
    Error(SourceError),
}

/// What a node watch yields
#[derive(Debug, Clone, PartialEq)]
pub enum NodeEvent {
    /// Current node content; `None` while the node does not exist
    Snapshot(Option<Value>),
    Error(SourceError),
}

/// Live subscription to one partition (or, with `NodeEvent`, one node).
///
/// Cancelling is idempotent and also happens on drop.
pub struct Subscription<E = SourceEvent> {
    events: mpsc::UnboundedReceiver<E>,
    canceller: Option<Box<dyn FnOnce() + Send>>,
}

impl<E> Subscription<E> {
    pub fn new(
        events: mpsc::UnboundedReceiver<E>,
        canceller: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            events,
            canceller: Some(Box::new(canceller)),
        }
    }

    /// `None` once the source has stopped or the subscription was cancelled
    pub async fn next_event(&mut self) -> Option<E> {
        if self.canceller.is_none() {
            return None;
        }
        self.events.recv().await
    }

    pub fn cancel(&mut self) {
        if let Some(canceller) = self.canceller.take() {
            canceller();
            self.events.close();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.canceller.is_none()
    }
}

impl<E> Drop for Subscription<E> {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl<E> std::fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Backend trait for day-partitioned sample stores
#[async_trait]
pub trait PartitionSource: Send + Sync {
    /// Open a live subscription for `key`
    async fn subscribe(&self, key: PartitionKey) -> Result<Subscription, SourceError>;

    /// Backend name for logging
    fn name(&self) -> &'static str;
}

/// Backend trait for single-node watches (`patients/{id}`, `devices/{id}`,
/// `alerts/{patient}`)
#[async_trait]
pub trait NodeFeed: Send + Sync {
    /// Watch the node at `path`; the first event is its current content
    async fn watch(&self, path: &str) -> Result<Subscription<NodeEvent>, SourceError>;

    /// Backend name for logging
    fn feed_name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = mpsc::unbounded_channel();
        let counter = calls.clone();
        let mut subscription = Subscription::new(rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tx.send(SourceEvent::Replace(Vec::new())).unwrap();
        subscription.cancel();
        subscription.cancel();
        drop(subscription);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_events_after_cancel() {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscription = Subscription::new(rx, || {});

        tx.send(SourceEvent::Replace(Vec::new())).unwrap();
        subscription.cancel();

        assert!(subscription.next_event().await.is_none());
        assert!(tx.send(SourceEvent::Replace(Vec::new())).is_err());
    }
}
