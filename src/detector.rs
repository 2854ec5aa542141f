//! Online anomaly detection over per-key running statistics
//!
//! For every event the detector folds the value into the key's
//! [`RunningStats`] and, once a key has accumulated enough samples, compares
//! the value against the running average using a cheap range-based standard
//! deviation proxy:
//!
//! ```text
//! stddev = sqrt(0.1 * (max - min)^2)
//! anomaly when |value - avg| > z * stddev
//! ```
//!
//! The proxy is deliberately not a true variance estimator; it is preserved
//! for behavioral compatibility with the upstream pipeline this engine
//! replaces. A consequence kept as-is: when `max == min` the proxy is zero
//! and any deviation flags.
//!
//! Detection compares against the stats as they stood before the current
//! event (the baseline the event deviated from); the emitted record's
//! expected value is that prior average.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::error::Result;
use crate::event::{AnomalyRecord, MetricEvent, Severity};
use crate::state::KeyedStateStore;

/// Incrementally maintained statistics for one key
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RunningStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
}

impl RunningStats {
    /// Fold one value in: running-mean update plus min/max widening.
    /// The first sample seeds min and max with the value itself.
    pub fn update(&self, value: f64) -> RunningStats {
        if self.count == 0 {
            return RunningStats {
                min: value,
                max: value,
                avg: value,
                count: 1,
            };
        }

        let count = self.count + 1;
        RunningStats {
            min: self.min.min(value),
            max: self.max.max(value),
            avg: (self.avg * self.count as f64 + value) / count as f64,
            count,
        }
    }

    /// The range-based standard deviation proxy
    pub fn stddev_proxy(&self) -> f64 {
        let range = self.max - self.min;
        (0.1 * range * range).sqrt()
    }
}

/// Configuration for the anomaly detector
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Minimum samples a key must have before any event can flag
    pub min_samples: u64,
    /// Multiplier on the stddev proxy forming the flag threshold
    pub z_multiplier: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_samples: 10,
            z_multiplier: 2.0,
        }
    }
}

/// Stateful anomaly detector over the shared keyed state store.
///
/// The anomaly verdict is an explicit second output returned alongside the
/// pass-through rather than a shared side-output channel; the caller decides
/// where it goes.
pub struct AnomalyDetector {
    store: Arc<KeyedStateStore>,
    config: DetectorConfig,
}

impl AnomalyDetector {
    pub fn new(store: Arc<KeyedStateStore>, config: DetectorConfig) -> Self {
        Self { store, config }
    }

    /// Process one event: update the key's running statistics and return an
    /// anomaly record when the value deviates beyond the threshold.
    ///
    /// The original event always flows downstream regardless of the verdict;
    /// this method only decides the side output.
    pub async fn process(&self, event: &MetricEvent) -> Result<Option<AnomalyRecord>> {
        let key = event.key();
        let prior = self.store.stats(&key).await.unwrap_or_default();
        let updated = prior.update(event.value);
        self.store.put_stats(key.clone(), updated).await;

        if prior.count < self.config.min_samples {
            return Ok(None);
        }

        let threshold = self.config.z_multiplier * prior.stddev_proxy();
        let deviation = (event.value - prior.avg).abs();
        if deviation <= threshold {
            return Ok(None);
        }

        let severity = if deviation > 2.0 * threshold {
            Severity::Critical
        } else {
            Severity::High
        };

        debug!(
            key = %key,
            value = event.value,
            expected = prior.avg,
            deviation,
            threshold,
            severity = %severity,
            "anomaly flagged"
        );

        Ok(Some(AnomalyRecord {
            event: event.clone(),
            observed: event.value,
            expected: prior.avg,
            deviation,
            severity,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::MetricKey;

    fn event(value: f64, n: u64) -> MetricEvent {
        MetricEvent {
            id: format!("evt-{n}"),
            timestamp: 1_700_000_000_000 + n as i64 * 1_000,
            service: "api-gateway".to_string(),
            metric: "cpu_usage".to_string(),
            value,
            host: "host-1".to_string(),
            region: "us-east-1".to_string(),
        }
    }

    fn detector() -> (AnomalyDetector, Arc<KeyedStateStore>) {
        let store = Arc::new(KeyedStateStore::new());
        (
            AnomalyDetector::new(store.clone(), DetectorConfig::default()),
            store,
        )
    }

    #[test]
    fn test_running_stats_mean_and_count() {
        let values = [50.0, 52.0, 48.0, 51.0, 49.0];
        let mut stats = RunningStats::default();
        for v in values {
            stats = stats.update(v);
        }
        assert_eq!(stats.count, values.len() as u64);
        let mean: f64 = values.iter().sum::<f64>() / values.len() as f64;
        assert!((stats.avg - mean).abs() < 1e-9);
        assert_eq!(stats.min, 48.0);
        assert_eq!(stats.max, 52.0);
    }

    #[test]
    fn test_running_stats_first_sample_seeds_min_max() {
        let stats = RunningStats::default().update(73.0);
        assert_eq!(stats.min, 73.0);
        assert_eq!(stats.max, 73.0);
        assert_eq!(stats.avg, 73.0);
        assert_eq!(stats.count, 1);
    }

    #[test]
    fn test_min_avg_max_ordering_invariant() {
        let mut stats = RunningStats::default();
        for v in [3.0, -2.0, 17.5, 0.0, 8.0] {
            stats = stats.update(v);
            assert!(stats.min <= stats.avg && stats.avg <= stats.max);
        }
    }

    #[test]
    fn test_stddev_proxy() {
        let stats = RunningStats {
            min: 47.0,
            max: 55.0,
            avg: 50.0,
            count: 10,
        };
        // sqrt(0.1 * 64) = 2.529...
        assert!((stats.stddev_proxy() - 2.5298).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_no_anomaly_within_first_ten_events() {
        let (detector, _) = detector();
        let values = [50.0, 52.0, 48.0, 51.0, 49.0, 50.0, 53.0, 47.0, 52.0, 95.0];
        for (i, v) in values.iter().enumerate() {
            let verdict = detector.process(&event(*v, i as u64)).await.unwrap();
            assert!(verdict.is_none(), "event {i} flagged too early");
        }
    }

    #[tokio::test]
    async fn test_eleventh_event_flags_with_prior_baseline() {
        let (detector, store) = detector();
        let values = [50.0, 52.0, 48.0, 51.0, 49.0, 50.0, 53.0, 47.0, 52.0, 50.0];
        for (i, v) in values.iter().enumerate() {
            assert!(detector.process(&event(*v, i as u64)).await.unwrap().is_none());
        }

        let prior = store
            .stats(&MetricKey::new("api-gateway", "cpu_usage"))
            .await
            .unwrap();
        // Baseline: mean ~50.2, range 6 -> proxy ~1.897, threshold ~3.79
        let verdict = detector.process(&event(95.0, 10)).await.unwrap().unwrap();
        assert!((verdict.expected - prior.avg).abs() < 1e-9);
        assert!((verdict.deviation - (95.0 - prior.avg).abs()).abs() < 1e-9);
        assert_eq!(verdict.severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_value_within_threshold_does_not_flag() {
        let (detector, _) = detector();
        for (i, v) in [50.0, 52.0, 48.0, 51.0, 49.0, 50.0, 53.0, 47.0, 52.0, 50.0]
            .iter()
            .enumerate()
        {
            detector.process(&event(*v, i as u64)).await.unwrap();
        }
        // range 6 -> threshold ~3.79; 51 deviates by ~0.8
        let verdict = detector.process(&event(51.0, 10)).await.unwrap();
        assert!(verdict.is_none());
    }

    #[tokio::test]
    async fn test_constant_series_flags_any_deviation() {
        let (detector, _) = detector();
        for i in 0..10 {
            detector.process(&event(50.0, i)).await.unwrap();
        }
        // max == min -> proxy 0 -> any deviation flags (accepted behavior)
        let verdict = detector.process(&event(50.001, 10)).await.unwrap();
        assert!(verdict.is_some());
    }

    #[tokio::test]
    async fn test_stats_updated_even_when_flagging() {
        let (detector, store) = detector();
        for i in 0..10 {
            detector.process(&event(50.0, i)).await.unwrap();
        }
        detector.process(&event(95.0, 10)).await.unwrap();

        let stats = store
            .stats(&MetricKey::new("api-gateway", "cpu_usage"))
            .await
            .unwrap();
        assert_eq!(stats.count, 11);
        assert_eq!(stats.max, 95.0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (detector, store) = detector();
        detector.process(&event(50.0, 0)).await.unwrap();

        let other = MetricEvent {
            service: "checkout".to_string(),
            ..event(10.0, 1)
        };
        detector.process(&other).await.unwrap();

        let a = store
            .stats(&MetricKey::new("api-gateway", "cpu_usage"))
            .await
            .unwrap();
        let b = store
            .stats(&MetricKey::new("checkout", "cpu_usage"))
            .await
            .unwrap();
        assert_eq!(a.count, 1);
        assert_eq!(b.count, 1);
        assert_eq!(a.avg, 50.0);
        assert_eq!(b.avg, 10.0);
    }
}
