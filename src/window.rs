//! Tumbling event-time windows
//!
//! Events are assigned to fixed-size, epoch-aligned windows by flooring the
//! event timestamp to the window length. Per key, open windows are held in a
//! `BTreeMap` keyed by window start so firing naturally walks them in
//! ascending order. A window fires when the watermark passes its end; an
//! event whose window closed more than the allowed lateness ago is rejected
//! as late-for-window and never folded.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

use crate::error::WindowError;
use crate::event::{AggregatedMetric, MetricEvent, MetricKey};
use crate::state::KeyedStateStore;
use crate::watermark::Watermark;

/// A half-open event-time interval `[start, end)` in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    /// The tumbling window containing `timestamp`, aligned to the epoch
    pub fn containing(timestamp: i64, length_ms: i64) -> Self {
        let start = timestamp.div_euclid(length_ms) * length_ms;
        Self {
            start,
            end: start + length_ms,
        }
    }

    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Partial aggregate for one open window of one key
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowAccumulator {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
}

impl WindowAccumulator {
    pub fn seed(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
            count: 1,
        }
    }

    pub fn fold(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Tumbling-window aggregator over the shared keyed state store.
///
/// Window length and allowed lateness are fixed at construction; the
/// watermark is supplied by the caller on both paths so the aggregator never
/// tracks time itself.
pub struct TumblingWindowAggregator {
    store: Arc<KeyedStateStore>,
    window_length_ms: i64,
    allowed_lateness_ms: i64,
}

impl TumblingWindowAggregator {
    pub fn new(
        store: Arc<KeyedStateStore>,
        window_length_ms: i64,
        allowed_lateness_ms: i64,
    ) -> Result<Self, WindowError> {
        if window_length_ms <= 0 {
            return Err(WindowError::InvalidLength {
                length_ms: window_length_ms,
            });
        }
        Ok(Self {
            store,
            window_length_ms,
            allowed_lateness_ms,
        })
    }

    pub fn window_length_ms(&self) -> i64 {
        self.window_length_ms
    }

    /// Fold one event into its window's accumulator.
    ///
    /// Rejects the event when its window closed for good: the window end has
    /// fallen more than the allowed lateness behind the watermark. Events
    /// inside the lateness grace period still fold even though the watermark
    /// already passed their window end.
    pub async fn fold(
        &self,
        event: &MetricEvent,
        watermark: Watermark,
    ) -> Result<TimeWindow, WindowError> {
        let window = TimeWindow::containing(event.timestamp, self.window_length_ms);
        if window.end <= watermark.timestamp.saturating_sub(self.allowed_lateness_ms) {
            return Err(WindowError::LateForWindow {
                window_end: window.end,
                watermark: watermark.timestamp,
            });
        }

        self.store
            .fold_window(event.key(), window.start, event.value)
            .await;
        Ok(window)
    }

    /// Fire every window whose end the watermark has passed, in ascending
    /// window-start order per key, and drop their state.
    pub async fn fire_ready(&self, watermark: Watermark) -> Vec<AggregatedMetric> {
        // a window with start < bound has end <= watermark
        let bound = watermark.timestamp.saturating_sub(self.window_length_ms - 1);
        let fired = self.store.take_windows_before(bound).await;

        let mut out = Vec::with_capacity(fired.len());
        for (key, start, acc) in fired {
            let window = TimeWindow {
                start,
                end: start + self.window_length_ms,
            };
            debug!(key = %key, window = %window, count = acc.count, "window fired");
            out.push(Self::emit(&key, window, &acc));
        }
        out
    }

    fn emit(key: &MetricKey, window: TimeWindow, acc: &WindowAccumulator) -> AggregatedMetric {
        AggregatedMetric {
            service: key.service.clone(),
            metric: key.metric.clone(),
            timestamp: window.end,
            min: acc.min,
            max: acc.max,
            avg: acc.avg(),
            count: acc.count,
            window_start: window.start,
            window_end: window.end,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: i64 = 60_000;

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

    fn aggregator(lateness_ms: i64) -> TumblingWindowAggregator {
        TumblingWindowAggregator::new(Arc::new(KeyedStateStore::new()), MINUTE, lateness_ms)
            .unwrap()
    }

    #[test]
    fn test_window_assignment_alignment() {
        let w = TimeWindow::containing(125_000, MINUTE);
        assert_eq!(w.start, 120_000);
        assert_eq!(w.end, 180_000);
        assert!(w.contains(125_000));
        assert!(!w.contains(180_000));

        // boundary timestamp belongs to the window it starts
        let w = TimeWindow::containing(180_000, MINUTE);
        assert_eq!(w.start, 180_000);
    }

    #[test]
    fn test_window_assignment_negative_timestamp() {
        let w = TimeWindow::containing(-1, MINUTE);
        assert_eq!(w.start, -60_000);
        assert_eq!(w.end, 0);
    }

    #[test]
    fn test_invalid_window_length_rejected() {
        let store = Arc::new(KeyedStateStore::new());
        assert!(TumblingWindowAggregator::new(store, 0, 0).is_err());
    }

    #[test]
    fn test_accumulator_fold() {
        let mut acc = WindowAccumulator::seed(50.0);
        acc.fold(42.0);
        acc.fold(58.0);
        assert_eq!(acc.min, 42.0);
        assert_eq!(acc.max, 58.0);
        assert_eq!(acc.count, 3);
        assert!((acc.avg() - 50.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_fire_after_watermark_passes_window_end() {
        let agg = aggregator(0);
        let wm = Watermark::min();
        agg.fold(&event(10_000, 50.0), wm).await.unwrap();
        agg.fold(&event(20_000, 60.0), wm).await.unwrap();

        // watermark just short of the window end keeps it open
        assert!(agg.fire_ready(Watermark::new(59_999)).await.is_empty());

        let fired = agg.fire_ready(Watermark::new(60_000)).await;
        assert_eq!(fired.len(), 1);
        let m = &fired[0];
        assert_eq!(m.window_start, 0);
        assert_eq!(m.window_end, 60_000);
        assert_eq!(m.min, 50.0);
        assert_eq!(m.max, 60.0);
        assert_eq!(m.count, 2);
        assert!((m.avg - 55.0).abs() < 1e-9);

        // fired state is gone
        assert!(agg.fire_ready(Watermark::new(120_000)).await.is_empty());
    }

    #[tokio::test]
    async fn test_fire_order_ascending_per_key() {
        let agg = aggregator(0);
        let wm = Watermark::min();
        agg.fold(&event(130_000, 3.0), wm).await.unwrap();
        agg.fold(&event(10_000, 1.0), wm).await.unwrap();
        agg.fold(&event(70_000, 2.0), wm).await.unwrap();

        let fired = agg.fire_ready(Watermark::new(180_000)).await;
        let starts: Vec<i64> = fired.iter().map(|m| m.window_start).collect();
        assert_eq!(starts, vec![0, 60_000, 120_000]);
    }

    #[tokio::test]
    async fn test_grace_period_accepts_event_past_window_end() {
        let agg = aggregator(5_000);
        // watermark at 62s: window [0, 60s) ended but is within the 5s grace
        let wm = Watermark::new(62_000);
        assert!(agg.fold(&event(59_000, 50.0), wm).await.is_ok());

        // past the grace: window end 60s <= 66s - 5s
        let wm = Watermark::new(66_000);
        let err = agg.fold(&event(59_000, 50.0), wm).await.unwrap_err();
        assert!(matches!(err, WindowError::LateForWindow { .. }));
    }

    #[tokio::test]
    async fn test_keys_fire_independently() {
        let agg = aggregator(0);
        let wm = Watermark::min();
        agg.fold(&event(10_000, 1.0), wm).await.unwrap();
        let mut other = event(10_000, 9.0);
        other.service = "checkout".to_string();
        agg.fold(&other, wm).await.unwrap();

        let mut fired = agg.fire_ready(Watermark::new(60_000)).await;
        fired.sort_by(|a, b| a.service.cmp(&b.service));
        assert_eq!(fired.len(), 2);
        assert_eq!(fired[0].service, "api-gateway");
        assert_eq!(fired[1].service, "checkout");
    }
}
