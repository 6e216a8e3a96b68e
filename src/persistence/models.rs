//! Database models for durable-log records.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

/// One record read back from a durable-log topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    /// Monotonic position within the topic.
    pub offset: i64,
    /// Topic name (e.g. `"relation.events"`).
    pub topic: String,
    /// Partitioning / deduplication key supplied by the producer.
    pub key: String,
    /// Opaque record body.
    pub value: Vec<u8>,
    /// Append time.
    pub created_at: DateTime<Utc>,
}

impl LogRecord {
    /// Decodes the record body as JSON.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the body is not valid JSON for `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.value)
    }
}
