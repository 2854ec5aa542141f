//! Kafka producer behind the [`RecordSink`] boundary
//!
//! One sink per destination topic. Sends retry transient broker errors with
//! exponential backoff up to a bounded attempt count; exhaustion surfaces as
//! a delivery error and the pipeline keeps ingesting (at-least-once, no
//! global stall on one bad destination).

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::error::{ProcessorError, Result};
use crate::sink::RecordSink;

const DEFAULT_SEND_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_MAX_RETRIES: u32 = 5;
const DEFAULT_BASE_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Configuration for one producer-backed destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaSinkConfig {
    /// Kafka bootstrap servers
    pub brokers: String,
    /// Destination topic
    pub topic: String,
    /// Client ID for this producer
    pub client_id: String,
    /// Timeout for a single send attempt (milliseconds)
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,
    /// Retries before a send is abandoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base delay for exponential backoff (milliseconds)
    #[serde(default = "default_base_backoff")]
    pub base_backoff_ms: u64,
}

fn default_send_timeout() -> u64 {
    DEFAULT_SEND_TIMEOUT_MS
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_base_backoff() -> u64 {
    DEFAULT_BASE_BACKOFF_MS
}

impl KafkaSinkConfig {
    pub fn for_topic(brokers: impl Into<String>, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        Self {
            brokers: brokers.into(),
            client_id: format!("metrics-processor-{topic}"),
            topic,
            send_timeout_ms: default_send_timeout(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff(),
        }
    }
}

/// Delivery counters for one sink
#[derive(Debug, Clone, Copy, Default)]
pub struct SinkCounters {
    pub delivered: u64,
    pub retried: u64,
    pub abandoned: u64,
}

/// Producer-backed [`RecordSink`]
pub struct KafkaRecordSink {
    producer: FutureProducer,
    config: KafkaSinkConfig,
    delivered: AtomicU64,
    retried: AtomicU64,
    abandoned: AtomicU64,
}

impl KafkaRecordSink {
    pub fn new(config: KafkaSinkConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("client.id", &config.client_id)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", config.send_timeout_ms.to_string())
            .create()
            .map_err(|e| ProcessorError::Configuration {
                source: Box::new(e),
            })?;

        Ok(Self {
            producer,
            config,
            delivered: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            abandoned: AtomicU64::new(0),
        })
    }

    pub fn counters(&self) -> SinkCounters {
        SinkCounters {
            delivered: self.delivered.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Block until all buffered records are delivered, bounded by the send
    /// timeout. Called on shutdown.
    pub fn flush(&self) -> Result<()> {
        self.producer
            .flush(Timeout::After(Duration::from_millis(
                self.config.send_timeout_ms,
            )))
            .map_err(|e| ProcessorError::Execution {
                source: Box::new(e),
            })
    }

    fn is_retriable(error: &KafkaError) -> bool {
        matches!(
            error,
            KafkaError::MessageProduction(
                RDKafkaErrorCode::QueueFull
                    | RDKafkaErrorCode::NetworkException
                    | RDKafkaErrorCode::RequestTimedOut
                    | RDKafkaErrorCode::NotLeaderForPartition
                    | RDKafkaErrorCode::BrokerTransportFailure
            )
        )
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.config.base_backoff_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay).min(MAX_BACKOFF)
    }
}

#[async_trait]
impl RecordSink for KafkaRecordSink {
    async fn send(&self, key: &str, payload: &str) -> Result<()> {
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let record = FutureRecord::to(&self.config.topic)
                .key(key)
                .payload(payload);

            let result = self
                .producer
                .send(
                    record,
                    Timeout::After(Duration::from_millis(self.config.send_timeout_ms)),
                )
                .await;

            match result {
                Ok(_) => {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                    if attempts > 1 {
                        debug!(topic = %self.config.topic, attempts, "delivered after retry");
                    }
                    return Ok(());
                }
                Err((err, _)) => {
                    if attempts > self.config.max_retries || !Self::is_retriable(&err) {
                        self.abandoned.fetch_add(1, Ordering::Relaxed);
                        error!(
                            topic = %self.config.topic,
                            attempts,
                            error = %err,
                            "delivery abandoned"
                        );
                        return Err(ProcessorError::Delivery {
                            boundary: self.config.topic.clone(),
                            attempts,
                            reason: err.to_string(),
                        });
                    }

                    self.retried.fetch_add(1, Ordering::Relaxed);
                    let backoff = self.backoff(attempts);
                    warn!(
                        topic = %self.config.topic,
                        attempt = attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "send failed, retrying"
                    );
                    sleep(backoff).await;
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.config.topic
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_topic_defaults() {
        let config = KafkaSinkConfig::for_topic("kafka:9092", "alerts");
        assert_eq!(config.topic, "alerts");
        assert_eq!(config.client_id, "metrics-processor-alerts");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.base_backoff_ms, 100);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        // producer creation needs no live broker
        let sink =
            KafkaRecordSink::new(KafkaSinkConfig::for_topic("localhost:9092", "alerts")).unwrap();
        assert_eq!(sink.backoff(1), Duration::from_millis(100));
        assert_eq!(sink.backoff(2), Duration::from_millis(200));
        assert_eq!(sink.backoff(3), Duration::from_millis(400));
        assert_eq!(sink.backoff(10), MAX_BACKOFF);
    }

    #[test]
    fn test_retriable_classification() {
        assert!(KafkaRecordSink::is_retriable(&KafkaError::MessageProduction(
            RDKafkaErrorCode::QueueFull
        )));
        assert!(!KafkaRecordSink::is_retriable(
            &KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge)
        ));
    }
}
