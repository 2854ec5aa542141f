//! Event model for the metrics stream
//!
//! Defines the typed representation of a raw metric event, the composite
//! key that partitions all per-entity state, and the derived anomaly and
//! aggregate records emitted by the pipeline.
//!
//! Raw events arrive as JSON and pass through a schema-validated decode step
//! ([`decode_event`]) that yields either a fully populated [`MetricEvent`] or
//! a decode error. Partially populated events never enter the pipeline.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProcessorError, Result};

/// A single metric reading from a service host.
///
/// Immutable once constructed. The JSON wire shape uses exactly these field
/// names on both the input topic and the processed-events output topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricEvent {
    /// Opaque event identity
    pub id: String,
    /// Event timestamp, epoch milliseconds
    pub timestamp: i64,
    /// Originating service name
    pub service: String,
    /// Metric name (e.g. `cpu_usage`)
    pub metric: String,
    /// Observed numeric value
    pub value: f64,
    /// Originating host
    pub host: String,
    /// Deployment region
    pub region: String,
}

impl MetricEvent {
    /// The composite key partitioning all per-entity state for this event
    pub fn key(&self) -> MetricKey {
        MetricKey {
            service: self.service.clone(),
            metric: self.metric.clone(),
        }
    }
}

impl fmt::Display for MetricEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} = {} @ {} ({})",
            self.service, self.metric, self.value, self.timestamp, self.host
        )
    }
}

/// Composite key of (service, metric).
///
/// Structured rather than string-concatenated so that `("a-b", "c")` and
/// `("a", "b-c")` can never collide. Stable for the lifetime of a
/// service/metric pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MetricKey {
    pub service: String,
    pub metric: String,
}

impl MetricKey {
    pub fn new(service: impl Into<String>, metric: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            metric: metric.into(),
        }
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.service, self.metric)
    }
}

/// Severity label attached to an anomaly record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An anomaly verdict for a single event, emitted on the alert boundary.
///
/// Emitted once, never mutated. `expected` is the running average the event
/// deviated from, i.e. the baseline before the event was folded in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    /// The triggering event
    pub event: MetricEvent,
    /// Observed value (same as `event.value`, kept explicit for the alert shape)
    pub observed: f64,
    /// Baseline running average at detection time
    pub expected: f64,
    /// Absolute deviation magnitude
    pub deviation: f64,
    /// Severity label
    pub severity: Severity,
}

impl AnomalyRecord {
    /// Alert message for the alert stream
    pub fn message(&self) -> String {
        format!(
            "Anomaly detected for {} {}",
            self.event.service, self.event.metric
        )
    }

    /// Serialize to the alert-stream JSON shape: the MetricEvent fields plus
    /// `alert_type`, `alert_message`, `severity`.
    pub fn to_alert_json(&self) -> Result<String> {
        let mut value = serde_json::to_value(&self.event)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| ProcessorError::Serialization("event is not a JSON object".into()))?;
        obj.insert("alert_type".into(), "anomaly".into());
        obj.insert("alert_message".into(), self.message().into());
        obj.insert("severity".into(), self.severity.as_str().into());
        obj.insert("expected_value".into(), self.expected.into());
        obj.insert("deviation".into(), self.deviation.into());
        Ok(value.to_string())
    }
}

/// Aggregate of one (key, tumbling window) pair, emitted when the window
/// closes. Consumed once by the aggregate output boundary as one document
/// per fired window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatedMetric {
    pub service: String,
    pub metric: String,
    /// Emission timestamp, epoch milliseconds
    pub timestamp: i64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub count: u64,
    pub window_start: i64,
    pub window_end: i64,
}

impl AggregatedMetric {
    pub fn key(&self) -> MetricKey {
        MetricKey::new(self.service.clone(), self.metric.clone())
    }
}

/// Decode a raw payload into a [`MetricEvent`].
///
/// This is a strict, schema-validated step: missing or mistyped fields fail
/// the whole event with [`ProcessorError::Decode`], leaving watermark and
/// stats untouched. There is no partially populated fallback.
pub fn decode_event(payload: &[u8]) -> Result<MetricEvent> {
    serde_json::from_slice(payload).map_err(|e| ProcessorError::Decode {
        reason: e.to_string(),
    })
}

/// Current wall-clock time in epoch milliseconds, used for emission stamps
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_event() -> MetricEvent {
        MetricEvent {
            id: "evt-1".to_string(),
            timestamp: 1_700_000_000_000,
            service: "api-gateway".to_string(),
            metric: "cpu_usage".to_string(),
            value: 73.5,
            host: "host-3".to_string(),
            region: "us-east-1".to_string(),
        }
    }

    #[test]
    fn test_decode_valid_event() {
        let json = r#"{"id":"e1","timestamp":1700000000000,"service":"api-gateway",
            "metric":"cpu_usage","value":42.5,"host":"h1","region":"eu-west-1"}"#;
        let event = decode_event(json.as_bytes()).unwrap();
        assert_eq!(event.id, "e1");
        assert_eq!(event.value, 42.5);
        assert_eq!(event.key(), MetricKey::new("api-gateway", "cpu_usage"));
    }

    #[test]
    fn test_decode_missing_value_field_fails() {
        let json = r#"{"id":"e1","timestamp":1700000000000,"service":"s",
            "metric":"m","host":"h1","region":"r1"}"#;
        let err = decode_event(json.as_bytes()).unwrap_err();
        assert!(matches!(err, ProcessorError::Decode { .. }));
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(decode_event(b"not json").is_err());
    }

    #[test]
    fn test_event_json_round_trip_shape() {
        let event = sample_event();
        let json = serde_json::to_value(&event).unwrap();
        for field in ["id", "timestamp", "service", "metric", "value", "host", "region"] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
        let back: MetricEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_key_no_concatenation_collision() {
        let a = MetricKey::new("a-b", "c");
        let b = MetricKey::new("a", "b-c");
        assert_ne!(a, b);
    }

    #[test]
    fn test_alert_json_shape() {
        let record = AnomalyRecord {
            event: sample_event(),
            observed: 95.0,
            expected: 50.2,
            deviation: 44.8,
            severity: Severity::High,
        };

        let json: serde_json::Value =
            serde_json::from_str(&record.to_alert_json().unwrap()).unwrap();
        assert_eq!(json["alert_type"], "anomaly");
        assert_eq!(json["severity"], "high");
        assert_eq!(
            json["alert_message"],
            "Anomaly detected for api-gateway cpu_usage"
        );
        assert_eq!(json["service"], "api-gateway");
        assert_eq!(json["expected_value"], 50.2);
    }

    #[test]
    fn test_aggregated_metric_document_shape() {
        let agg = AggregatedMetric {
            service: "api-gateway".to_string(),
            metric: "cpu_usage".to_string(),
            timestamp: 1_700_000_100_000,
            min: 40.0,
            max: 80.0,
            avg: 60.0,
            count: 12,
            window_start: 1_700_000_040_000,
            window_end: 1_700_000_100_000,
        };

        let json = serde_json::to_value(&agg).unwrap();
        for field in [
            "service", "metric", "timestamp", "min", "max", "avg", "count",
            "window_start", "window_end",
        ] {
            assert!(json.get(field).is_some(), "missing field {field}");
        }
    }
}
