//! Output boundary abstraction
//!
//! Every downstream destination (processed events, alerts, aggregates) is a
//! [`RecordSink`]: a keyed record out, at-least-once. The Kafka
//! implementation lives in `kafka::sink`; the in-memory implementation here
//! backs the integration tests.

use async_trait::async_trait;
use std::sync::Mutex;

use crate::error::Result;

/// A downstream destination for keyed records
#[async_trait]
pub trait RecordSink: Send + Sync {
    /// Deliver one record. Implementations retry internally; an error means
    /// delivery was abandoned after retries were exhausted.
    async fn send(&self, key: &str, payload: &str) -> Result<()>;

    /// Destination name for logging
    fn name(&self) -> &str;
}

/// Collecting sink for tests
#[derive(Debug, Default)]
pub struct MemorySink {
    name: String,
    records: Mutex<Vec<(String, String)>>,
}

impl MemorySink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            records: Mutex::new(Vec::new()),
        }
    }

    pub fn records(&self) -> Vec<(String, String)> {
        self.records
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl RecordSink for MemorySink {
    async fn send(&self, key: &str, payload: &str) -> Result<()> {
        if let Ok(mut guard) = self.records.lock() {
            guard.push((key.to_string(), payload.to_string()));
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}
