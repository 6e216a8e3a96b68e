//! Relation-change propagation to live sessions.
//!
//! The relation service publishes block and friend changes to a durable-log
//! topic. [`EventBridge::run`] follows that topic and turns each record into
//! a `relation_changed` envelope for the affected users that are online.
//! Offline users are skipped; the relation state itself lives in the relation
//! store, so the only cost of a miss is a missed live notification.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::domain::{Registry, RelationEvent};
use crate::error::GatewayError;
use crate::persistence::{LogConsumer, LogRecord};
use crate::ws::messages::{MessageType, OutboundEnvelope, RelationChangedPayload};

/// Default number of records fetched per poll.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default pause between polls of an idle topic.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Forwards relation events to the sessions of the users they concern.
#[derive(Debug, Clone)]
pub struct EventBridge {
    registry: Registry,
    batch_size: usize,
    poll_interval: Duration,
}

impl EventBridge {
    /// Creates a bridge delivering through `registry`.
    #[must_use]
    pub const fn new(registry: Registry) -> Self {
        Self {
            registry,
            batch_size: DEFAULT_BATCH_SIZE,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Sets the poll batch size and idle interval used by [`Self::run`].
    #[must_use]
    pub fn with_polling(mut self, batch_size: usize, poll_interval: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.poll_interval = poll_interval;
        self
    }

    /// Notifies the recipients of one relation event.
    ///
    /// A block reaches only the blocked peer; a friend change reaches both
    /// users. Recipients with no live session are skipped silently.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RegistryClosed`] once the registry has shut
    /// down, or [`GatewayError::Internal`] if the envelope fails to encode.
    pub async fn handle(&self, event: &RelationEvent) -> Result<(), GatewayError> {
        let recipients = event.recipients();
        if recipients.is_empty() {
            tracing::debug!(kind = ?event.kind, user_id = %event.user_id, "relation event ignored");
            return Ok(());
        }

        let payload = RelationChangedPayload::from(event);
        let frame = OutboundEnvelope::new(MessageType::RelationChanged, &payload, event.trace_id.as_deref())
            .to_frame()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        for user_id in recipients {
            match self.registry.dispatch_to_user(user_id, Arc::clone(&frame)).await {
                Ok(devices) => tracing::info!(
                    %user_id,
                    kind = event.kind.as_str(),
                    action = ?event.action,
                    devices,
                    trace_id = event.trace_id.as_deref(),
                    "relation change notified"
                ),
                Err(GatewayError::UserNotOnline(_)) => {
                    tracing::debug!(%user_id, "relation change recipient offline");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Decodes one durable-log record and handles it.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::MalformedEnvelope`] if the record body is not
    /// a relation event, otherwise whatever [`Self::handle`] returns.
    pub async fn handle_record(&self, record: &LogRecord) -> Result<(), GatewayError> {
        let event: RelationEvent = record.decode()?;
        self.handle(&event).await
    }

    /// Follows `consumer` until `cancel` fires.
    ///
    /// Each polled batch is handled in order and its last offset committed,
    /// so delivery is at-least-once across restarts. Records that fail to
    /// decode are logged and skipped.
    pub async fn run(self, consumer: Arc<dyn LogConsumer>, cancel: CancellationToken) {
        tracing::info!(batch_size = self.batch_size, "relation event bridge started");

        loop {
            let polled = tokio::select! {
                () = cancel.cancelled() => break,
                polled = consumer.poll(self.batch_size) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(error = %e, "relation feed poll failed");
                    Vec::new()
                }
            };

            if records.is_empty() {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    () = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            let mut last = None;
            for record in &records {
                if let Err(e) = self.handle_record(record).await {
                    tracing::warn!(offset = record.offset, key = %record.key, error = %e, "relation record skipped");
                }
                last = Some(record.offset);
            }

            if let Some(offset) = last
                && let Err(e) = consumer.commit(offset).await
            {
                tracing::warn!(offset, error = %e, "relation offset commit failed");
            }
        }

        tracing::info!("relation event bridge stopped");
    }
}
