//! Watermarking for out-of-order metric streams
//!
//! The watermark is the engine's estimate that no event older than it will
//! still arrive. It is computed from the maximum observed event time minus a
//! configured allowed lateness, and is monotonically non-decreasing: an
//! out-of-order event can never move it backwards.
//!
//! There is a single global watermark per engine instance; window firing is
//! keyed by time, so a window closes only once the global watermark passes
//! its end.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, trace};

/// Event-time lower bound in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Watermark {
    /// The watermark timestamp in milliseconds since epoch
    pub timestamp: i64,
}

impl Watermark {
    pub fn new(timestamp: i64) -> Self {
        Self { timestamp }
    }

    /// The minimum possible watermark (beginning of time)
    pub fn min() -> Self {
        Self { timestamp: i64::MIN }
    }

    pub fn is_min(&self) -> bool {
        self.timestamp == i64::MIN
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::min()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Watermark({})", self.timestamp)
    }
}

/// Outcome of observing one event's timestamp
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// Event time is at or ahead of the current watermark
    OnTime,
    /// Event time fell below the watermark; still processed for statistics
    /// but excluded from closed windows
    Late {
        /// How far behind the watermark the event was, in milliseconds
        late_by: i64,
    },
}

impl Observation {
    pub fn is_late(&self) -> bool {
        matches!(self, Observation::Late { .. })
    }
}

/// Tracks the maximum observed event time and derives the watermark as
/// `max_observed - allowed_lateness`.
#[derive(Debug)]
pub struct WatermarkTracker {
    /// Maximum event time seen so far
    max_timestamp: i64,
    /// Allowed lateness in milliseconds
    allowed_lateness_ms: i64,
    /// Current watermark, never decreases
    current: Watermark,
    /// Count of late observations, for diagnostics
    late_count: u64,
}

impl WatermarkTracker {
    pub fn new(allowed_lateness: Duration) -> Self {
        Self {
            max_timestamp: i64::MIN,
            allowed_lateness_ms: allowed_lateness.as_millis() as i64,
            current: Watermark::min(),
            late_count: 0,
        }
    }

    /// Observe one event timestamp, advancing the watermark when the event
    /// pushes the maximum observed time forward.
    ///
    /// Late events (timestamp below the current watermark) do not advance
    /// anything and are reported via [`Observation::Late`] rather than being
    /// silently dropped.
    pub fn observe(&mut self, event_time: i64) -> Observation {
        trace!(event_time, watermark = self.current.timestamp, "observing event time");

        if !self.current.is_min() && event_time < self.current.timestamp {
            let late_by = self.current.timestamp - event_time;
            self.late_count += 1;
            debug!(event_time, late_by, "late event observed");
            return Observation::Late { late_by };
        }

        if event_time > self.max_timestamp {
            self.max_timestamp = event_time;
            let candidate = Watermark::new(event_time.saturating_sub(self.allowed_lateness_ms));
            if candidate > self.current {
                self.current = candidate;
                debug!(watermark = self.current.timestamp, "advanced watermark");
            }
        }

        Observation::OnTime
    }

    /// The current watermark without advancing it
    pub fn current(&self) -> Watermark {
        self.current
    }

    /// Allowed lateness in milliseconds
    pub fn allowed_lateness_ms(&self) -> i64 {
        self.allowed_lateness_ms
    }

    /// Number of late events seen since creation or restore
    pub fn late_count(&self) -> u64 {
        self.late_count
    }

    /// Restore the tracker to a checkpointed watermark position.
    ///
    /// `max_timestamp` is rebuilt from the watermark; replayed events at or
    /// above the restored watermark re-advance it naturally.
    pub fn restore(&mut self, watermark: Watermark) {
        self.current = watermark;
        self.max_timestamp = if watermark.is_min() {
            i64::MIN
        } else {
            watermark.timestamp.saturating_add(self.allowed_lateness_ms)
        };
        self.late_count = 0;
        debug!(watermark = %watermark, "watermark restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(lateness_secs: u64) -> WatermarkTracker {
        WatermarkTracker::new(Duration::from_secs(lateness_secs))
    }

    #[test]
    fn test_watermark_advances_with_lateness_bound() {
        let mut t = tracker(5);
        t.observe(10_000);
        t.observe(20_000);
        assert_eq!(t.current().timestamp, 15_000);
    }

    #[test]
    fn test_watermark_monotonic_under_out_of_order_input() {
        let mut t = tracker(5);
        t.observe(30_000);
        let wm1 = t.current();
        t.observe(20_000);
        t.observe(27_000);
        let wm2 = t.current();
        assert!(wm2 >= wm1);
        assert_eq!(wm2.timestamp, 25_000);
    }

    #[test]
    fn test_late_observation_reported_not_dropped() {
        let mut t = tracker(5);
        t.observe(30_000);
        // Watermark is 25_000; an older event is late but still observed
        let obs = t.observe(20_000);
        assert_eq!(obs, Observation::Late { late_by: 5_000 });
        assert_eq!(t.late_count(), 1);
        // Watermark unchanged by a late event
        assert_eq!(t.current().timestamp, 25_000);
    }

    #[test]
    fn test_event_between_watermark_and_max_is_on_time() {
        let mut t = tracker(5);
        t.observe(30_000);
        // 26_000 is below max (30_000) but above watermark (25_000)
        assert_eq!(t.observe(26_000), Observation::OnTime);
        assert_eq!(t.current().timestamp, 25_000);
    }

    #[test]
    fn test_initial_state_is_min() {
        let t = tracker(5);
        assert!(t.current().is_min());
    }

    #[test]
    fn test_first_event_never_late() {
        let mut t = tracker(5);
        assert_eq!(t.observe(-1_000), Observation::OnTime);
    }

    #[test]
    fn test_restore_positions_watermark() {
        let mut t = tracker(5);
        t.restore(Watermark::new(40_000));
        assert_eq!(t.current().timestamp, 40_000);

        // Replayed events below the restored watermark are late
        assert!(t.observe(30_000).is_late());
        // Newer events advance it again
        t.observe(60_000);
        assert_eq!(t.current().timestamp, 55_000);
    }

    #[test]
    fn test_monotonicity_over_random_sequence() {
        let mut t = tracker(10);
        let mut prev = t.current();
        for ts in [5_000, 50_000, 3_000, 49_000, 51_000, 7_000, 100_000] {
            t.observe(ts);
            let cur = t.current();
            assert!(cur >= prev, "watermark regressed at ts={ts}");
            prev = cur;
        }
    }
}
