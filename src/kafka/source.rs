//! Kafka consumer for raw metric events
//!
//! The source hands undecoded payloads to the pipeline together with their
//! `(partition, offset)` coordinates; decoding happens inside the pipeline so
//! malformed events are counted and skipped there. Offsets are committed by
//! the caller after a checkpoint, never automatically, and consumption can
//! resume from checkpointed positions.

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::{Message, Offset, TopicPartitionList};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::config::KafkaConfig;
use crate::error::{ProcessorError, Result};
use crate::state::SourcePosition;

/// Configuration for the metric event consumer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSourceConfig {
    /// Kafka brokers (comma-separated list)
    pub brokers: String,
    /// Consumer group ID
    pub group_id: String,
    /// Topic carrying raw metric events
    pub topic: String,
    /// Offset reset policy when no committed offset exists
    #[serde(default = "default_offset_reset")]
    pub auto_offset_reset: String,
    /// Additional consumer configuration passed through to rdkafka
    #[serde(default)]
    pub extra_config: HashMap<String, String>,
}

fn default_offset_reset() -> String {
    "earliest".to_string()
}

impl From<&KafkaConfig> for KafkaSourceConfig {
    fn from(config: &KafkaConfig) -> Self {
        Self {
            brokers: config.bootstrap_servers.clone(),
            group_id: config.consumer_group.clone(),
            topic: config.source_topic.clone(),
            auto_offset_reset: default_offset_reset(),
            extra_config: HashMap::new(),
        }
    }
}

/// One raw message with its source coordinates
#[derive(Debug, Clone)]
pub struct SourcedEvent {
    pub payload: Vec<u8>,
    pub partition: i32,
    /// Offset of this message; the position to checkpoint is `offset + 1`
    pub offset: i64,
}

/// Kafka source for the processing pipeline
pub struct MetricSource {
    consumer: StreamConsumer,
    config: KafkaSourceConfig,
    consumed: AtomicU64,
    failed: AtomicU64,
}

impl MetricSource {
    pub fn new(config: KafkaSourceConfig) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", &config.auto_offset_reset);

        for (key, value) in &config.extra_config {
            client_config.set(key, value);
        }

        let consumer: StreamConsumer =
            client_config
                .create()
                .map_err(|e| ProcessorError::Configuration {
                    source: Box::new(e),
                })?;

        Ok(Self {
            consumer,
            config,
            consumed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
        })
    }

    /// Begin consumption, resuming from checkpointed positions when present.
    ///
    /// With positions the consumer is assigned those exact partition offsets;
    /// without, it subscribes and lets the group protocol place it.
    pub fn start_from(&self, positions: &[SourcePosition]) -> Result<()> {
        let resumable: Vec<&SourcePosition> = positions
            .iter()
            .filter(|p| p.topic == self.config.topic)
            .collect();

        if resumable.is_empty() {
            self.consumer
                .subscribe(&[self.config.topic.as_str()])
                .map_err(|e| ProcessorError::Configuration {
                    source: Box::new(e),
                })?;
            info!(topic = %self.config.topic, "subscribed, no positions to resume");
            return Ok(());
        }

        let mut assignment = TopicPartitionList::new();
        for position in &resumable {
            assignment
                .add_partition_offset(
                    &position.topic,
                    position.partition,
                    Offset::Offset(position.offset),
                )
                .map_err(|e| ProcessorError::Configuration {
                    source: Box::new(e),
                })?;
            info!(
                topic = %position.topic,
                partition = position.partition,
                offset = position.offset,
                "resuming from checkpointed position"
            );
        }

        self.consumer
            .assign(&assignment)
            .map_err(|e| ProcessorError::Execution {
                source: Box::new(e),
            })
    }

    /// Receive the next message
    pub async fn recv(&self) -> Result<SourcedEvent> {
        match self.consumer.recv().await {
            Ok(msg) => {
                let payload = msg.payload().unwrap_or_default().to_vec();
                self.consumed.fetch_add(1, Ordering::Relaxed);
                Ok(SourcedEvent {
                    payload,
                    partition: msg.partition(),
                    offset: msg.offset(),
                })
            }
            Err(e) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                Err(ProcessorError::Execution {
                    source: Box::new(e),
                })
            }
        }
    }

    /// Commit the consumer's current position, called after a checkpoint
    /// persists (at-least-once: never ahead of durable state)
    pub fn commit(&self) -> Result<()> {
        self.consumer
            .commit_consumer_state(rdkafka::consumer::CommitMode::Async)
            .map_err(|e| ProcessorError::Execution {
                source: Box::new(e),
            })
    }

    pub fn consumed(&self) -> u64 {
        self.consumed.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Pump messages into the pipeline's input channel until the channel
    /// closes or a shutdown signal arrives
    pub async fn run(
        &self,
        tx: mpsc::Sender<SourcedEvent>,
        mut shutdown: tokio::sync::oneshot::Receiver<()>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                received = self.recv() => {
                    match received {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                info!("input channel closed, source stopping");
                                return Ok(());
                            }
                        }
                        Err(e) => {
                            // transient broker errors: log and keep polling
                            error!(error = %e, "consumer receive failed");
                        }
                    }
                }
                _ = &mut shutdown => {
                    info!("source shutdown requested");
                    return Ok(());
                }
            }
        }
    }
}

impl std::fmt::Debug for MetricSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricSource")
            .field("topic", &self.config.topic)
            .field("group_id", &self.config.group_id)
            .field("consumed", &self.consumed.load(Ordering::Relaxed))
            .field("failed", &self.failed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaConfig;

    #[test]
    fn test_source_config_from_kafka_config() {
        let config = KafkaConfig::default();
        let source_config = KafkaSourceConfig::from(&config);
        assert_eq!(source_config.brokers, "kafka:9092");
        assert_eq!(source_config.topic, "metrics-data");
        assert_eq!(source_config.group_id, "metrics-processor");
        assert_eq!(source_config.auto_offset_reset, "earliest");
    }
}
