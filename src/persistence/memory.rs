//! In-process durable log for tests and single-node runs.
//!
//! A [`MemoryLog`] holds one topic. It implements both [`LogProducer`] and
//! [`LogConsumer`], so the same instance can be published to by a test and
//! followed by the event bridge. Records survive only as long as the value.
//! A log built [`with_retention`](MemoryLog::with_retention) keeps only the
//! newest records, which bounds memory when nothing consumes it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use super::{LogConsumer, LogProducer, LogRecord};
use crate::error::GatewayError;

/// Single-topic append log held in memory.
#[derive(Debug)]
pub struct MemoryLog {
    topic: String,
    records: Mutex<VecDeque<LogRecord>>,
    retention: Option<usize>,
    next_offset: AtomicI64,
    position: AtomicI64,
    committed: AtomicI64,
    failing: AtomicBool,
    closed: AtomicBool,
}

impl MemoryLog {
    /// Creates an empty log for `topic`. Consumers start at the beginning.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            records: Mutex::new(VecDeque::new()),
            retention: None,
            next_offset: AtomicI64::new(1),
            position: AtomicI64::new(0),
            committed: AtomicI64::new(0),
            failing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Keeps at most `max` records, evicting the oldest on append.
    ///
    /// Offsets keep increasing across evictions. A `max` of zero stores
    /// nothing.
    #[must_use]
    pub const fn with_retention(mut self, max: usize) -> Self {
        self.retention = Some(max);
        self
    }

    /// Topic name.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Snapshot of every retained record, oldest first.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().iter().cloned().collect()
    }

    /// Number of retained records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    /// Returns `true` if no record is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Highest committed offset.
    #[must_use]
    pub fn committed_offset(&self) -> i64 {
        self.committed.load(Ordering::Acquire)
    }

    /// Makes every publish fail (or succeed again), simulating an outage.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Returns `true` once [`LogProducer::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[async_trait]
impl LogProducer for MemoryLog {
    async fn publish(&self, key: &str, value: &[u8]) -> Result<(), GatewayError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(GatewayError::PersistenceError(format!(
                "log {} is closed",
                self.topic
            )));
        }
        if self.failing.load(Ordering::Relaxed) {
            return Err(GatewayError::PersistenceError(format!(
                "log {} is unavailable",
                self.topic
            )));
        }
        let mut records = self.records.lock();
        let offset = self.next_offset.fetch_add(1, Ordering::AcqRel);
        if self.retention == Some(0) {
            tracing::debug!(topic = %self.topic, key, offset, "record discarded");
            return Ok(());
        }
        records.push_back(LogRecord {
            offset,
            topic: self.topic.clone(),
            key: key.to_string(),
            value: value.to_vec(),
            created_at: Utc::now(),
        });
        if let Some(max) = self.retention {
            while records.len() > max {
                records.pop_front();
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), GatewayError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[async_trait]
impl LogConsumer for MemoryLog {
    async fn poll(&self, max: usize) -> Result<Vec<LogRecord>, GatewayError> {
        let from = self.position.load(Ordering::Acquire);
        let batch: Vec<LogRecord> = self
            .records
            .lock()
            .iter()
            .filter(|r| r.offset > from)
            .take(max)
            .cloned()
            .collect();
        if let Some(last) = batch.last() {
            self.position.store(last.offset, Ordering::Release);
        }
        Ok(batch)
    }

    async fn commit(&self, offset: i64) -> Result<(), GatewayError> {
        self.committed.fetch_max(offset, Ordering::AcqRel);
        Ok(())
    }
}
