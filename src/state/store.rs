//! In-memory keyed state shared by the detector and the window aggregator
//!
//! Two maps live behind reader-writer locks: per-key running statistics and
//! per-key open-window accumulators. Snapshots take both read locks together
//! so writers are quiesced and the two maps are captured at a single point
//! in time, then clone. State volumes here are per-key scalars, so the clone
//! is cheap relative to the checkpoint interval.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use crate::detector::RunningStats;
use crate::event::MetricKey;
use crate::window::WindowAccumulator;

/// Serializable capture of all keyed state at one instant
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub stats: HashMap<MetricKey, RunningStats>,
    pub windows: HashMap<MetricKey, BTreeMap<i64, WindowAccumulator>>,
}

impl StateSnapshot {
    pub fn key_count(&self) -> usize {
        self.stats.len()
    }

    pub fn open_window_count(&self) -> usize {
        self.windows.values().map(|w| w.len()).sum()
    }
}

/// Shared keyed state store
#[derive(Debug, Default)]
pub struct KeyedStateStore {
    stats: RwLock<HashMap<MetricKey, RunningStats>>,
    windows: RwLock<HashMap<MetricKey, BTreeMap<i64, WindowAccumulator>>>,
}

impl KeyedStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn stats(&self, key: &MetricKey) -> Option<RunningStats> {
        self.stats.read().await.get(key).copied()
    }

    pub async fn put_stats(&self, key: MetricKey, stats: RunningStats) {
        self.stats.write().await.insert(key, stats);
    }

    pub async fn tracked_key_count(&self) -> usize {
        self.stats.read().await.len()
    }

    pub async fn window(&self, key: &MetricKey, window_start: i64) -> Option<WindowAccumulator> {
        self.windows
            .read()
            .await
            .get(key)
            .and_then(|per_key| per_key.get(&window_start))
            .copied()
    }

    pub async fn put_window(&self, key: MetricKey, window_start: i64, acc: WindowAccumulator) {
        self.windows
            .write()
            .await
            .entry(key)
            .or_default()
            .insert(window_start, acc);
    }

    pub async fn remove_window(
        &self,
        key: &MetricKey,
        window_start: i64,
    ) -> Option<WindowAccumulator> {
        let mut windows = self.windows.write().await;
        let per_key = windows.get_mut(key)?;
        let removed = per_key.remove(&window_start);
        if per_key.is_empty() {
            windows.remove(key);
        }
        removed
    }

    /// Fold a value into the accumulator for `(key, window_start)`, creating
    /// it on first touch
    pub async fn fold_window(&self, key: MetricKey, window_start: i64, value: f64) {
        let mut windows = self.windows.write().await;
        windows
            .entry(key)
            .or_default()
            .entry(window_start)
            .and_modify(|acc| acc.fold(value))
            .or_insert_with(|| WindowAccumulator::seed(value));
    }

    /// Remove and return every accumulator whose window start is below
    /// `bound`, ascending by window start within each key
    pub async fn take_windows_before(
        &self,
        bound: i64,
    ) -> Vec<(MetricKey, i64, WindowAccumulator)> {
        let mut windows = self.windows.write().await;
        let mut taken = Vec::new();
        for (key, per_key) in windows.iter_mut() {
            let open = per_key.split_off(&bound);
            for (start, acc) in std::mem::replace(per_key, open) {
                taken.push((key.clone(), start, acc));
            }
        }
        windows.retain(|_, per_key| !per_key.is_empty());
        taken
    }

    /// Capture all keyed state. Both locks are held for the duration of the
    /// clone so the snapshot is internally consistent.
    pub async fn snapshot(&self) -> StateSnapshot {
        let stats = self.stats.read().await;
        let windows = self.windows.read().await;
        StateSnapshot {
            stats: stats.clone(),
            windows: windows.clone(),
        }
    }

    /// Replace all keyed state with the snapshot's contents
    pub async fn restore(&self, snapshot: StateSnapshot) {
        let mut stats = self.stats.write().await;
        let mut windows = self.windows.write().await;
        *stats = snapshot.stats;
        *windows = snapshot.windows;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(service: &str) -> MetricKey {
        MetricKey::new(service, "cpu_usage")
    }

    #[tokio::test]
    async fn test_stats_roundtrip() {
        let store = KeyedStateStore::new();
        assert!(store.stats(&key("api-gateway")).await.is_none());

        let stats = RunningStats::default().update(50.0);
        store.put_stats(key("api-gateway"), stats).await;
        assert_eq!(store.stats(&key("api-gateway")).await, Some(stats));
        assert_eq!(store.tracked_key_count().await, 1);
    }

    #[tokio::test]
    async fn test_window_accessors() {
        let store = KeyedStateStore::new();
        assert!(store.window(&key("a"), 0).await.is_none());

        store.fold_window(key("a"), 0, 2.0).await;
        store.fold_window(key("a"), 0, 4.0).await;
        let acc = store.window(&key("a"), 0).await.unwrap();
        assert_eq!(acc.count, 2);
        assert_eq!(acc.sum, 6.0);

        let removed = store.remove_window(&key("a"), 0).await.unwrap();
        assert_eq!(removed, acc);
        assert!(store.window(&key("a"), 0).await.is_none());
        assert_eq!(store.snapshot().await.open_window_count(), 0);
    }

    #[tokio::test]
    async fn test_take_windows_before_splits_open_from_closed() {
        let store = KeyedStateStore::new();
        store.fold_window(key("a"), 0, 1.0).await;
        store.fold_window(key("a"), 60_000, 2.0).await;
        store.fold_window(key("a"), 120_000, 3.0).await;

        let taken = store.take_windows_before(120_000).await;
        let starts: Vec<i64> = taken.iter().map(|(_, s, _)| *s).collect();
        assert_eq!(starts, vec![0, 60_000]);

        // the open window survives
        let snap = store.snapshot().await;
        assert_eq!(snap.open_window_count(), 1);
        assert!(snap.windows[&key("a")].contains_key(&120_000));
    }

    #[tokio::test]
    async fn test_snapshot_restore_roundtrip() {
        let store = KeyedStateStore::new();
        store
            .put_stats(key("api-gateway"), RunningStats::default().update(50.0))
            .await;
        store.fold_window(key("api-gateway"), 60_000, 50.0).await;

        let snap = store.snapshot().await;
        assert_eq!(snap.key_count(), 1);
        assert_eq!(snap.open_window_count(), 1);

        let fresh = KeyedStateStore::new();
        fresh.restore(snap.clone()).await;
        assert_eq!(fresh.snapshot().await, snap);
    }

    #[tokio::test]
    async fn test_restore_replaces_existing_state() {
        let store = KeyedStateStore::new();
        store
            .put_stats(key("stale"), RunningStats::default().update(1.0))
            .await;

        store.restore(StateSnapshot::default()).await;
        assert!(store.stats(&key("stale")).await.is_none());
        assert_eq!(store.tracked_key_count().await, 0);
    }
}
