//! Persistence layer: the durable log and the relation store.
//!
//! The gateway writes every accepted chat message to a durable, append-only
//! log and follows a second topic of relationship changes. Both sides are
//! reached through the [`LogProducer`] and [`LogConsumer`] traits so the
//! core never depends on a particular backend. [`postgres`] stores topics in
//! a `log_records` table with per-group offsets; [`memory`] keeps them in
//! process for tests and single-node runs.

pub mod memory;
pub mod models;
pub mod postgres;

use std::fmt;

use async_trait::async_trait;

pub use memory::MemoryLog;
pub use models::LogRecord;
pub use postgres::{PostgresLog, PostgresRelations};

use crate::error::GatewayError;

/// Append side of one durable-log topic. Safe for concurrent use.
#[async_trait]
pub trait LogProducer: Send + Sync + fmt::Debug {
    /// Appends one record.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] if the record could not be
    /// stored.
    async fn publish(&self, key: &str, value: &[u8]) -> Result<(), GatewayError>;

    /// Releases the producer. Later publishes fail.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] if the backend reports a
    /// failure while closing.
    async fn close(&self) -> Result<(), GatewayError>;
}

/// Consuming side of one durable-log topic for one consumer group.
///
/// Delivery is at-least-once: records handed out by [`LogConsumer::poll`]
/// are delivered again after a restart unless [`LogConsumer::commit`] has
/// recorded an offset at or past them.
#[async_trait]
pub trait LogConsumer: Send + Sync + fmt::Debug {
    /// Returns up to `max` records after the current position.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on backend failure.
    async fn poll(&self, max: usize) -> Result<Vec<LogRecord>, GatewayError>;

    /// Durably records that every record up to `offset` has been handled.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::PersistenceError`] on backend failure.
    async fn commit(&self, offset: i64) -> Result<(), GatewayError>;
}
