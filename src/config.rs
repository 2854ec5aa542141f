//! Configuration for the stream processor
//!
//! All settings load from the environment with documented defaults so the
//! service runs unconfigured against a local stack. `from_env` applies each
//! `METRICS_*`/`KAFKA_*` variable when present; `validate` is called once at
//! startup before anything is wired up.

use crate::detector::DetectorConfig;
use crate::error::{ProcessorError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main processor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Kafka boundary configuration
    pub kafka: KafkaConfig,

    /// Windowing configuration
    pub window: WindowConfig,

    /// Anomaly detector configuration
    #[serde(default)]
    pub detector: DetectorConfig,

    /// Checkpointing configuration
    pub checkpoint: CheckpointConfig,

    /// Input channel capacity before backpressure
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            kafka: KafkaConfig::default(),
            window: WindowConfig::default(),
            detector: DetectorConfig::default(),
            checkpoint: CheckpointConfig::default(),
            buffer_size: default_buffer_size(),
        }
    }
}

impl ProcessorConfig {
    /// Build the configuration from environment variables, falling back to
    /// defaults for anything unset
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        env_string("KAFKA_BOOTSTRAP_SERVERS", &mut config.kafka.bootstrap_servers);
        env_string("KAFKA_SOURCE_TOPIC", &mut config.kafka.source_topic);
        env_string("KAFKA_SINK_TOPIC", &mut config.kafka.sink_topic);
        env_string("KAFKA_ALERTS_TOPIC", &mut config.kafka.alerts_topic);
        env_string("KAFKA_AGGREGATES_TOPIC", &mut config.kafka.aggregates_topic);
        env_string("KAFKA_CONSUMER_GROUP", &mut config.kafka.consumer_group);

        env_parse("WINDOW_LENGTH_MS", &mut config.window.length_ms)?;
        env_parse("ALLOWED_LATENESS_MS", &mut config.window.allowed_lateness_ms)?;

        env_parse("MIN_SAMPLES", &mut config.detector.min_samples)?;
        env_parse("ANOMALY_Z", &mut config.detector.z_multiplier)?;

        if let Ok(dir) = std::env::var("CHECKPOINT_DIR") {
            config.checkpoint.dir = PathBuf::from(dir);
        }
        env_parse("CHECKPOINT_INTERVAL_MS", &mut config.checkpoint.interval_ms)?;
        env_parse("CHECKPOINT_RETENTION", &mut config.checkpoint.retention)?;

        env_parse("PROCESSOR_BUFFER_SIZE", &mut config.buffer_size)?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.kafka.validate()?;
        self.window.validate()?;
        self.checkpoint.validate()?;

        if self.detector.z_multiplier <= 0.0 {
            return Err(ProcessorError::Configuration {
                source: "ANOMALY_Z must be greater than 0".into(),
            });
        }

        if self.buffer_size == 0 {
            return Err(ProcessorError::Configuration {
                source: "PROCESSOR_BUFFER_SIZE must be greater than 0".into(),
            });
        }

        Ok(())
    }
}

/// Kafka topics and connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    /// Topic carrying raw metric events
    pub source_topic: String,
    /// Topic receiving processed pass-through events
    pub sink_topic: String,
    /// Topic receiving anomaly alerts
    pub alerts_topic: String,
    /// Topic receiving window aggregates, consumed by the document index
    pub aggregates_topic: String,
    pub consumer_group: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "kafka:9092".to_string(),
            source_topic: "metrics-data".to_string(),
            sink_topic: "processed-metrics".to_string(),
            alerts_topic: "alerts".to_string(),
            aggregates_topic: "aggregated-metrics".to_string(),
            consumer_group: "metrics-processor".to_string(),
        }
    }
}

impl KafkaConfig {
    fn validate(&self) -> Result<()> {
        if self.bootstrap_servers.is_empty() {
            return Err(ProcessorError::Configuration {
                source: "KAFKA_BOOTSTRAP_SERVERS must not be empty".into(),
            });
        }
        for (name, topic) in [
            ("KAFKA_SOURCE_TOPIC", &self.source_topic),
            ("KAFKA_SINK_TOPIC", &self.sink_topic),
            ("KAFKA_ALERTS_TOPIC", &self.alerts_topic),
            ("KAFKA_AGGREGATES_TOPIC", &self.aggregates_topic),
        ] {
            if topic.is_empty() {
                return Err(ProcessorError::Configuration {
                    source: format!("{name} must not be empty").into(),
                });
            }
        }
        Ok(())
    }
}

/// Tumbling window and lateness settings
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Window length in milliseconds
    pub length_ms: i64,
    /// Allowed lateness in milliseconds
    pub allowed_lateness_ms: i64,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            length_ms: 60_000,
            allowed_lateness_ms: 5_000,
        }
    }
}

impl WindowConfig {
    fn validate(&self) -> Result<()> {
        if self.length_ms <= 0 {
            return Err(ProcessorError::Configuration {
                source: "WINDOW_LENGTH_MS must be greater than 0".into(),
            });
        }
        if self.allowed_lateness_ms < 0 {
            return Err(ProcessorError::Configuration {
                source: "ALLOWED_LATENESS_MS must not be negative".into(),
            });
        }
        Ok(())
    }

    pub fn allowed_lateness(&self) -> Duration {
        Duration::from_millis(self.allowed_lateness_ms as u64)
    }
}

/// Checkpointing settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    /// Directory where checkpoint files live
    pub dir: PathBuf,
    /// Interval between checkpoints in milliseconds
    pub interval_ms: u64,
    /// Number of checkpoints kept on disk
    pub retention: usize,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/var/lib/metrics-processor/checkpoints"),
            interval_ms: 60_000,
            retention: 3,
        }
    }
}

impl CheckpointConfig {
    fn validate(&self) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(ProcessorError::Configuration {
                source: "CHECKPOINT_INTERVAL_MS must be greater than 0".into(),
            });
        }
        if self.retention == 0 {
            return Err(ProcessorError::Configuration {
                source: "CHECKPOINT_RETENTION must be greater than 0".into(),
            });
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn default_buffer_size() -> usize {
    10_000
}

fn env_string(name: &str, target: &mut String) {
    if let Ok(value) = std::env::var(name) {
        if !value.is_empty() {
            *target = value;
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str, target: &mut T) -> Result<()>
where
    T::Err: std::fmt::Display,
{
    if let Ok(value) = std::env::var(name) {
        *target = value.parse().map_err(|e| ProcessorError::Configuration {
            source: format!("invalid {name} value '{value}': {e}").into(),
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ProcessorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.kafka.source_topic, "metrics-data");
        assert_eq!(config.window.length_ms, 60_000);
        assert_eq!(config.checkpoint.retention, 3);
        assert_eq!(config.detector.min_samples, 10);
    }

    #[test]
    fn test_zero_window_length_rejected() {
        let mut config = ProcessorConfig::default();
        config.window.length_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_negative_lateness_rejected() {
        let mut config = ProcessorConfig::default();
        config.window.allowed_lateness_ms = -1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_topic_rejected() {
        let mut config = ProcessorConfig::default();
        config.kafka.alerts_topic.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_retention_rejected() {
        let mut config = ProcessorConfig::default();
        config.checkpoint.retention = 0;
        assert!(config.validate().is_err());
    }
}
