//! Metric store collaborator
//!
//! The column-oriented metric store is a boundary: the pipeline hands it raw
//! events, window aggregates, anomalies and service health rows, and never
//! waits on the writes. [`StoreWriter`] spawns each insert onto the runtime
//! and logs failures. [`MemoryMetricStore`] is the in-process implementation
//! used by tests; the binary wires [`NullMetricStore`] until a real store
//! client exists, since the in-memory maps retain every row forever.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::event::{AggregatedMetric, AnomalyRecord, MetricEvent, MetricKey};

/// One service-health row, refreshed when anomalies fire
#[derive(Debug, Clone, PartialEq)]
pub struct ServiceHealth {
    pub service: String,
    pub status: String,
    pub updated_at: i64,
}

/// Write-side interface of the metric store
#[async_trait]
pub trait MetricStore: Send + Sync {
    async fn insert_raw(&self, event: &MetricEvent) -> Result<()>;
    async fn insert_aggregate(&self, aggregate: &AggregatedMetric) -> Result<()>;
    async fn insert_anomaly(&self, anomaly: &AnomalyRecord) -> Result<()>;
    async fn insert_service_health(&self, health: &ServiceHealth) -> Result<()>;

    /// Raw events for `(service, metric)` with `from <= timestamp < to`,
    /// ascending by timestamp
    async fn query_range(
        &self,
        service: &str,
        metric: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<MetricEvent>>;
}

/// In-memory metric store over concurrent maps
#[derive(Debug, Default)]
pub struct MemoryMetricStore {
    raw: DashMap<MetricKey, Vec<MetricEvent>>,
    aggregates: DashMap<MetricKey, Vec<AggregatedMetric>>,
    anomalies: DashMap<MetricKey, Vec<AnomalyRecord>>,
    health: DashMap<String, ServiceHealth>,
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raw_count(&self) -> usize {
        self.raw.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn aggregate_count(&self) -> usize {
        self.aggregates.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn anomaly_count(&self) -> usize {
        self.anomalies.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn health(&self, service: &str) -> Option<ServiceHealth> {
        self.health.get(service).map(|entry| entry.value().clone())
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn insert_raw(&self, event: &MetricEvent) -> Result<()> {
        self.raw.entry(event.key()).or_default().push(event.clone());
        Ok(())
    }

    async fn insert_aggregate(&self, aggregate: &AggregatedMetric) -> Result<()> {
        let key = MetricKey::new(&aggregate.service, &aggregate.metric);
        self.aggregates.entry(key).or_default().push(aggregate.clone());
        Ok(())
    }

    async fn insert_anomaly(&self, anomaly: &AnomalyRecord) -> Result<()> {
        self.anomalies
            .entry(anomaly.event.key())
            .or_default()
            .push(anomaly.clone());
        Ok(())
    }

    async fn insert_service_health(&self, health: &ServiceHealth) -> Result<()> {
        self.health.insert(health.service.clone(), health.clone());
        Ok(())
    }

    async fn query_range(
        &self,
        service: &str,
        metric: &str,
        from: i64,
        to: i64,
    ) -> Result<Vec<MetricEvent>> {
        let key = MetricKey::new(service, metric);
        let mut events: Vec<MetricEvent> = self
            .raw
            .get(&key)
            .map(|entry| {
                entry
                    .value()
                    .iter()
                    .filter(|e| e.timestamp >= from && e.timestamp < to)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        events.sort_by_key(|e| e.timestamp);
        Ok(events)
    }
}

/// Discarding metric store with bounded memory.
///
/// Acknowledges every write, logs it at debug and keeps only counters, so
/// long-running processes never accumulate per-event rows.
#[derive(Debug, Default)]
pub struct NullMetricStore {
    discarded: AtomicU64,
}

impl NullMetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetricStore for NullMetricStore {
    async fn insert_raw(&self, event: &MetricEvent) -> Result<()> {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(event_id = %event.id, "raw metric discarded, no store configured");
        Ok(())
    }

    async fn insert_aggregate(&self, aggregate: &AggregatedMetric) -> Result<()> {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(
            service = %aggregate.service,
            metric = %aggregate.metric,
            window_start = aggregate.window_start,
            "aggregate discarded, no store configured"
        );
        Ok(())
    }

    async fn insert_anomaly(&self, anomaly: &AnomalyRecord) -> Result<()> {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(event_id = %anomaly.event.id, "anomaly discarded, no store configured");
        Ok(())
    }

    async fn insert_service_health(&self, health: &ServiceHealth) -> Result<()> {
        self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(service = %health.service, "service health discarded, no store configured");
        Ok(())
    }

    async fn query_range(
        &self,
        _service: &str,
        _metric: &str,
        _from: i64,
        _to: i64,
    ) -> Result<Vec<MetricEvent>> {
        Ok(Vec::new())
    }
}

/// Fire-and-forget writer over a [`MetricStore`].
///
/// Each record is handed to a spawned task; the pipeline's event loop never
/// blocks on storage latency. Failures are logged and dropped, matching the
/// store's advisory role.
#[derive(Clone)]
pub struct StoreWriter {
    store: Arc<dyn MetricStore>,
}

impl StoreWriter {
    pub fn new(store: Arc<dyn MetricStore>) -> Self {
        Self { store }
    }

    pub fn record_raw(&self, event: MetricEvent) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.insert_raw(&event).await {
                warn!(event_id = %event.id, error = %e, "raw metric write failed");
            }
        });
    }

    pub fn record_aggregate(&self, aggregate: AggregatedMetric) {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            if let Err(e) = store.insert_aggregate(&aggregate).await {
                warn!(
                    service = %aggregate.service,
                    metric = %aggregate.metric,
                    window_start = aggregate.window_start,
                    error = %e,
                    "aggregate write failed"
                );
            }
        });
    }

    pub fn record_anomaly(&self, anomaly: AnomalyRecord) {
        let store = Arc::clone(&self.store);
        let health = ServiceHealth {
            service: anomaly.event.service.clone(),
            status: anomaly.severity.as_str().to_string(),
            updated_at: crate::event::now_millis(),
        };
        tokio::spawn(async move {
            if let Err(e) = store.insert_anomaly(&anomaly).await {
                warn!(event_id = %anomaly.event.id, error = %e, "anomaly write failed");
            }
            if let Err(e) = store.insert_service_health(&health).await {
                warn!(service = %health.service, error = %e, "service health write failed");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Severity;

    fn event(ts: i64, value: f64) -> MetricEvent {
        MetricEvent {
            id: format!("evt-{ts}"),
            timestamp: ts,
            service: "api-gateway".to_string(),
            metric: "cpu_usage".to_string(),
            value,
            host: "host-1".to_string(),
            region: "us-east-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_query_range_filters_and_sorts() {
        let store = MemoryMetricStore::new();
        for ts in [30_000, 10_000, 20_000, 70_000] {
            store.insert_raw(&event(ts, 1.0)).await.unwrap();
        }

        let events = store
            .query_range("api-gateway", "cpu_usage", 10_000, 60_000)
            .await
            .unwrap();
        let stamps: Vec<i64> = events.iter().map(|e| e.timestamp).collect();
        assert_eq!(stamps, vec![10_000, 20_000, 30_000]);
    }

    #[tokio::test]
    async fn test_query_range_unknown_key_is_empty() {
        let store = MemoryMetricStore::new();
        let events = store
            .query_range("nope", "cpu_usage", 0, i64::MAX)
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_null_store_accepts_writes_without_retaining() {
        let store = NullMetricStore::new();
        for ts in [10_000, 20_000, 30_000] {
            store.insert_raw(&event(ts, 1.0)).await.unwrap();
        }

        assert_eq!(store.discarded(), 3);
        let events = store
            .query_range("api-gateway", "cpu_usage", 0, i64::MAX)
            .await
            .unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_anomaly_write_refreshes_service_health() {
        let store = Arc::new(MemoryMetricStore::new());
        let writer = StoreWriter::new(store.clone());

        let anomaly = AnomalyRecord {
            event: event(1_000, 95.0),
            observed: 95.0,
            expected: 50.0,
            deviation: 45.0,
            severity: Severity::Critical,
        };
        writer.record_anomaly(anomaly);

        // spawned writes; yield until they land
        for _ in 0..100 {
            if store.anomaly_count() == 1 && store.health("api-gateway").is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(store.anomaly_count(), 1);
        let health = store.health("api-gateway").unwrap();
        assert_eq!(health.status, "critical");
    }
}
