//! Stateful stream-processing engine for service metric events
//!
//! The engine consumes JSON metric events from Kafka, keeps per-key running
//! statistics, flags anomalies onto an alert stream, aggregates tumbling
//! event-time windows under a watermark, and periodically checkpoints all
//! keyed state together with the source offsets so a restarted process
//! resumes with at-least-once semantics.
//!
//! Module map:
//! - [`event`] — wire types and the strict decode step
//! - [`watermark`] — event-time progress tracking
//! - [`detector`] — running statistics and anomaly detection
//! - [`window`] — tumbling-window aggregation
//! - [`state`] — keyed state store, checkpoints, recovery
//! - [`kafka`] — consumer/producer boundaries
//! - [`sink`] / [`storage`] — output and metric-store collaborator traits
//! - [`pipeline`] — the driver tying the stages together

pub mod config;
pub mod detector;
pub mod error;
pub mod event;
pub mod kafka;
pub mod pipeline;
pub mod sink;
pub mod state;
pub mod storage;
pub mod telemetry;
pub mod watermark;
pub mod window;

pub use config::ProcessorConfig;
pub use detector::{AnomalyDetector, DetectorConfig, RunningStats};
pub use error::{ProcessorError, Result, StateError, WindowError};
pub use event::{decode_event, AggregatedMetric, AnomalyRecord, MetricEvent, MetricKey, Severity};
pub use pipeline::{Pipeline, PipelineSinks, PipelineStats};
pub use sink::{MemorySink, RecordSink};
pub use state::{Checkpoint, CheckpointCoordinator, CheckpointStore, KeyedStateStore};
pub use storage::{MemoryMetricStore, MetricStore, NullMetricStore, StoreWriter};
pub use watermark::{Observation, Watermark, WatermarkTracker};
pub use window::{TimeWindow, TumblingWindowAggregator, WindowAccumulator};
