//! Merged, time-ordered sample series built from per-day snapshots
//!
//! The store is the only mutable state shared between the subscription
//! side and the read path. Every mutation replaces one partition wholesale,
//! then rebuilds the flattened series. Readers get an `Arc` to the last
//! rebuilt series and never see the partition map.

use super::types::Sample;
use crate::partition::PartitionKey;
use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Immutable view of the flattened series at one store version
#[derive(Debug, Clone)]
pub struct SeriesSnapshot {
    version: u64,
    samples: Arc<[Sample]>,
}

impl SeriesSnapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }
}

impl Deref for SeriesSnapshot {
    type Target = [Sample];

    fn deref(&self) -> &[Sample] {
        &self.samples
    }
}

#[derive(Debug)]
struct StoreInner {
    /// Keys are partitions with a non-empty snapshot
    partitions: BTreeMap<PartitionKey, Vec<Sample>>,
    series: Arc<[Sample]>,
    version: u64,
}

impl StoreInner {
    /// Concatenate in key order, then stable sort so ties keep snapshot order
    fn rebuild(&mut self) {
        let mut merged: Vec<Sample> = self.partitions.values().flatten().copied().collect();
        merged.sort_by_key(|sample| sample.timestamp);
        self.series = merged.into();
        self.version += 1;
    }
}

#[derive(Debug)]
pub struct SeriesStore {
    inner: RwLock<StoreInner>,
}

impl SeriesStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                partitions: BTreeMap::new(),
                series: Arc::from(Vec::new()),
                version: 0,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the snapshot for `key`.
    ///
    /// An empty batch removes the partition's contribution. Returns whether
    /// the flattened series changed; re-applying identical content is a no-op.
    pub fn apply_partition(&self, key: PartitionKey, samples: Vec<Sample>) -> bool {
        let mut inner = self.write();

        if samples.is_empty() {
            if inner.partitions.remove(&key).is_none() {
                return false;
            }
        } else {
            if inner.partitions.get(&key) == Some(&samples) {
                return false;
            }
            inner.partitions.insert(key, samples);
        }

        inner.rebuild();
        log::debug!(
            "🧩 Partition {} applied: {} samples in series (v{})",
            key,
            inner.series.len(),
            inner.version
        );
        true
    }

    pub fn clear_partition(&self, key: PartitionKey) -> bool {
        self.apply_partition(key, Vec::new())
    }

    pub fn snapshot_series(&self) -> SeriesSnapshot {
        let inner = self.read();
        SeriesSnapshot {
            version: inner.version,
            samples: Arc::clone(&inner.series),
        }
    }

    /// Bumped on every change to the flattened series
    pub fn version(&self) -> u64 {
        self.read().version
    }

    pub fn partition_keys(&self) -> Vec<PartitionKey> {
        self.read().partitions.keys().copied().collect()
    }

    pub fn partition_len(&self, key: &PartitionKey) -> usize {
        self.read().partitions.get(key).map_or(0, Vec::len)
    }

    pub fn len(&self) -> usize {
        self.read().series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().series.is_empty()
    }
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new()
    }
}
