//! Kafka input and output boundaries

pub mod sink;
pub mod source;

pub use sink::{KafkaRecordSink, KafkaSinkConfig};
pub use source::{KafkaSourceConfig, MetricSource, SourcedEvent};
