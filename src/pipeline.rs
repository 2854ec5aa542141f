//! Pipeline driver
//!
//! One logical task owns the whole per-event path, so per-key update order
//! is exactly arrival order:
//!
//! ```text
//! decode -> watermark observe -> detector -> emit event (+ anomaly)
//!        -> window fold -> on watermark advance, fire windows -> emit aggregates
//! ```
//!
//! Delivery failures and malformed events are counted and logged, never
//! fatal. The checkpoint coordinator observes the pipeline through
//! [`PipelineCheckpointSource`]; each event is processed under a quiesce
//! lock that a capture also takes, so a snapshot only ever observes the
//! pipeline between events and positions and keyed state describe the same
//! instant.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::ProcessorConfig;
use crate::detector::AnomalyDetector;
use crate::error::{ProcessorError, Result, WindowError};
use crate::event::{decode_event, MetricEvent};
use crate::kafka::SourcedEvent;
use crate::sink::RecordSink;
use crate::state::checkpoint::{CapturedState, CheckpointSource};
use crate::state::{Checkpoint, KeyedStateStore, SourcePosition};
use crate::storage::StoreWriter;
use crate::watermark::{Observation, Watermark, WatermarkTracker};
use crate::window::TumblingWindowAggregator;
use async_trait::async_trait;

/// Counters for pipeline activity
#[derive(Debug, Default)]
pub struct PipelineStats {
    pub events_processed: AtomicU64,
    pub events_malformed: AtomicU64,
    pub late_events: AtomicU64,
    pub late_for_window: AtomicU64,
    pub anomalies_emitted: AtomicU64,
    pub windows_fired: AtomicU64,
    pub delivery_failures: AtomicU64,
}

/// Plain-value view of [`PipelineStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PipelineStatsSnapshot {
    pub events_processed: u64,
    pub events_malformed: u64,
    pub late_events: u64,
    pub late_for_window: u64,
    pub anomalies_emitted: u64,
    pub windows_fired: u64,
    pub delivery_failures: u64,
}

impl PipelineStats {
    pub fn snapshot(&self) -> PipelineStatsSnapshot {
        PipelineStatsSnapshot {
            events_processed: self.events_processed.load(Ordering::Relaxed),
            events_malformed: self.events_malformed.load(Ordering::Relaxed),
            late_events: self.late_events.load(Ordering::Relaxed),
            late_for_window: self.late_for_window.load(Ordering::Relaxed),
            anomalies_emitted: self.anomalies_emitted.load(Ordering::Relaxed),
            windows_fired: self.windows_fired.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

/// Shared progress record: the watermark and source positions as of the last
/// fully processed event. Updated by the event loop after each event, read
/// by the checkpoint coordinator.
#[derive(Debug, Default)]
pub struct ProgressLog {
    inner: RwLock<ProgressInner>,
}

#[derive(Debug, Default)]
struct ProgressInner {
    watermark: Watermark,
    positions: HashMap<(String, i32), i64>,
}

impl ProgressLog {
    pub async fn record(&self, topic: &str, partition: i32, next_offset: i64, watermark: Watermark) {
        let mut inner = self.inner.write().await;
        inner.watermark = watermark;
        inner
            .positions
            .insert((topic.to_string(), partition), next_offset);
    }

    pub async fn restore(&self, watermark: Watermark, positions: &[SourcePosition]) {
        let mut inner = self.inner.write().await;
        inner.watermark = watermark;
        inner.positions = positions
            .iter()
            .map(|p| ((p.topic.clone(), p.partition), p.offset))
            .collect();
    }

    pub async fn capture(&self) -> (Watermark, Vec<SourcePosition>) {
        let inner = self.inner.read().await;
        let mut positions: Vec<SourcePosition> = inner
            .positions
            .iter()
            .map(|((topic, partition), offset)| SourcePosition {
                topic: topic.clone(),
                partition: *partition,
                offset: *offset,
            })
            .collect();
        positions.sort_by(|a, b| (&a.topic, a.partition).cmp(&(&b.topic, b.partition)));
        (inner.watermark, positions)
    }
}

/// Checkpoint view over the pipeline's progress and keyed state
pub struct PipelineCheckpointSource {
    progress: Arc<ProgressLog>,
    store: Arc<KeyedStateStore>,
    quiesce: Arc<Mutex<()>>,
}

#[async_trait]
impl CheckpointSource for PipelineCheckpointSource {
    async fn capture(&self) -> CapturedState {
        // the event loop holds this lock across each whole event, so the
        // capture runs at an event boundary and positions and keyed state
        // describe the same instant
        let _gate = self.quiesce.lock().await;
        let (watermark, positions) = self.progress.capture().await;
        let state = self.store.snapshot().await;
        CapturedState {
            watermark,
            positions,
            state,
        }
    }
}

/// The output destinations of one pipeline
pub struct PipelineSinks {
    /// Pass-through processed events
    pub events: Arc<dyn RecordSink>,
    /// Anomaly alerts
    pub alerts: Arc<dyn RecordSink>,
    /// Fired window aggregates
    pub aggregates: Arc<dyn RecordSink>,
}

/// The stream-processing engine for one partition set
pub struct Pipeline {
    store: Arc<KeyedStateStore>,
    detector: AnomalyDetector,
    aggregator: TumblingWindowAggregator,
    watermark: WatermarkTracker,
    sinks: PipelineSinks,
    writer: StoreWriter,
    progress: Arc<ProgressLog>,
    stats: Arc<PipelineStats>,
    quiesce: Arc<Mutex<()>>,
    source_topic: String,
}

impl Pipeline {
    pub fn new(
        config: &ProcessorConfig,
        store: Arc<KeyedStateStore>,
        sinks: PipelineSinks,
        writer: StoreWriter,
    ) -> Result<Self> {
        let detector = AnomalyDetector::new(Arc::clone(&store), config.detector);
        let aggregator = TumblingWindowAggregator::new(
            Arc::clone(&store),
            config.window.length_ms,
            config.window.allowed_lateness_ms,
        )?;
        let watermark = WatermarkTracker::new(config.window.allowed_lateness());

        Ok(Self {
            store,
            detector,
            aggregator,
            watermark,
            sinks,
            writer,
            progress: Arc::new(ProgressLog::default()),
            stats: Arc::new(PipelineStats::default()),
            quiesce: Arc::new(Mutex::new(())),
            source_topic: config.kafka.source_topic.clone(),
        })
    }

    pub fn stats(&self) -> Arc<PipelineStats> {
        Arc::clone(&self.stats)
    }

    pub fn progress(&self) -> Arc<ProgressLog> {
        Arc::clone(&self.progress)
    }

    /// The view the checkpoint coordinator snapshots
    pub fn checkpoint_source(&self) -> Arc<PipelineCheckpointSource> {
        Arc::new(PipelineCheckpointSource {
            progress: Arc::clone(&self.progress),
            store: Arc::clone(&self.store),
            quiesce: Arc::clone(&self.quiesce),
        })
    }

    /// Load a restored checkpoint into the pipeline. Must run before any
    /// input is admitted.
    pub async fn restore(&mut self, checkpoint: &Checkpoint) -> Result<()> {
        self.store.restore(checkpoint.state.clone()).await;
        self.watermark.restore(checkpoint.watermark);
        self.progress
            .restore(checkpoint.watermark, &checkpoint.positions)
            .await;
        info!(
            checkpoint_id = checkpoint.checkpoint_id,
            watermark = %checkpoint.watermark,
            keys = checkpoint.state.key_count(),
            open_windows = checkpoint.state.open_window_count(),
            "pipeline state restored"
        );
        Ok(())
    }

    /// Process raw messages from the channel until it closes or shutdown is
    /// signalled; on shutdown the already-buffered input is drained first.
    pub async fn run(
        &mut self,
        mut rx: mpsc::Receiver<SourcedEvent>,
        mut shutdown: oneshot::Receiver<()>,
    ) -> Result<()> {
        info!(topic = %self.source_topic, "pipeline running");
        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Some(sourced) => self.process(sourced).await?,
                    None => break,
                },
                _ = &mut shutdown => {
                    info!("pipeline shutdown requested, draining buffered input");
                    rx.close();
                    while let Some(sourced) = rx.recv().await {
                        self.process(sourced).await?;
                    }
                    break;
                }
            }
        }
        let stats = self.stats.snapshot();
        info!(
            events = stats.events_processed,
            malformed = stats.events_malformed,
            late = stats.late_events,
            anomalies = stats.anomalies_emitted,
            windows = stats.windows_fired,
            "pipeline stopped"
        );
        Ok(())
    }

    /// Drive one raw message through the whole per-event path.
    ///
    /// Holds the quiesce lock for the duration, so a concurrent checkpoint
    /// capture never sees keyed state ahead of the recorded positions.
    pub async fn process(&mut self, sourced: SourcedEvent) -> Result<()> {
        let quiesce = Arc::clone(&self.quiesce);
        let _gate = quiesce.lock().await;

        let event = match decode_event(&sourced.payload) {
            Ok(event) => event,
            Err(e) => {
                // skip without touching the watermark
                self.stats.events_malformed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    partition = sourced.partition,
                    offset = sourced.offset,
                    error = %e,
                    "skipping malformed event"
                );
                self.record_progress(&sourced).await;
                return Ok(());
            }
        };

        let previous = self.watermark.current();
        let observation = self.watermark.observe(event.timestamp);
        if let Observation::Late { late_by } = observation {
            self.stats.late_events.fetch_add(1, Ordering::Relaxed);
            debug!(event_id = %event.id, late_by_ms = late_by, "late event");
        }

        // detection and pass-through happen for every event, late or not
        let anomaly = self.detector.process(&event).await?;

        self.emit_event(&event).await?;
        if let Some(anomaly) = anomaly {
            self.stats.anomalies_emitted.fetch_add(1, Ordering::Relaxed);
            match anomaly.to_alert_json() {
                Ok(json) => self.deliver(&self.sinks.alerts, &event.key().to_string(), &json),
                Err(e) => error!(event_id = %event.id, error = %e, "alert serialization failed"),
            }
            self.writer.record_anomaly(anomaly);
        }

        let watermark = self.watermark.current();
        match self.aggregator.fold(&event, watermark).await {
            Ok(_) => {}
            Err(WindowError::LateForWindow { window_end, .. }) => {
                self.stats.late_for_window.fetch_add(1, Ordering::Relaxed);
                debug!(
                    event_id = %event.id,
                    window_end,
                    watermark = %watermark,
                    "event past its window's lateness horizon, not folded"
                );
            }
            Err(e) => return Err(e.into()),
        }

        if watermark > previous {
            self.fire_windows(watermark).await?;
        }

        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
        self.record_progress(&sourced).await;
        Ok(())
    }

    async fn emit_event(&self, event: &MetricEvent) -> Result<()> {
        let json = serde_json::to_string(event)?;
        self.deliver(&self.sinks.events, &event.key().to_string(), &json);
        self.writer.record_raw(event.clone());
        Ok(())
    }

    async fn fire_windows(&mut self, watermark: Watermark) -> Result<()> {
        let fired = self.aggregator.fire_ready(watermark).await;
        let mut batch = Vec::with_capacity(fired.len());
        for aggregate in fired {
            self.stats.windows_fired.fetch_add(1, Ordering::Relaxed);
            batch.push((
                aggregate.key().to_string(),
                serde_json::to_string(&aggregate)?,
            ));
            self.writer.record_aggregate(aggregate);
        }
        // one task per firing keeps the sink FIFO in window order
        self.deliver_batch(&self.sinks.aggregates, batch);
        Ok(())
    }

    /// Fire-and-forget delivery: exhausted retries are a log line and a
    /// counter, never a stalled pipeline
    fn deliver(&self, sink: &Arc<dyn RecordSink>, key: &str, payload: &str) {
        self.deliver_batch(sink, vec![(key.to_string(), payload.to_string())]);
    }

    /// Send a batch sequentially on one spawned task, preserving its order
    /// at the sink
    fn deliver_batch(&self, sink: &Arc<dyn RecordSink>, batch: Vec<(String, String)>) {
        if batch.is_empty() {
            return;
        }
        let sink = Arc::clone(sink);
        let stats = Arc::clone(&self.stats);
        tokio::spawn(async move {
            for (key, payload) in batch {
                if let Err(e) = sink.send(&key, &payload).await {
                    stats.delivery_failures.fetch_add(1, Ordering::Relaxed);
                    if let ProcessorError::Delivery {
                        boundary,
                        attempts,
                        reason,
                    } = &e
                    {
                        error!(boundary = %boundary, attempts, reason = %reason, "delivery failed");
                    } else {
                        error!(sink = sink.name(), error = %e, "delivery failed");
                    }
                }
            }
        });
    }

    async fn record_progress(&self, sourced: &SourcedEvent) {
        self.progress
            .record(
                &self.source_topic,
                sourced.partition,
                sourced.offset + 1,
                self.watermark.current(),
            )
            .await;
    }
}
