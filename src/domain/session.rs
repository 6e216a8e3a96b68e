//! Per-connection session state shared between the socket loops and the
//! registry.
//!
//! A [`Session`] is the registry-facing half of one physical connection. It
//! owns the producer side of the bounded outbound queue and the close
//! signal; the socket loops in [`crate::ws::connection`] own the transport
//! and the consumer side of the queue.
//!
//! # Queue ownership
//!
//! The only [`mpsc::Sender`] for the queue lives inside the session behind a
//! short-lived lock. Closing the queue drops that sender, which makes the
//! outbound loop observe `None` on its next receive once the backlog is
//! drained. Every producer goes through [`Session::enqueue`], which never
//! waits: a full queue drops the payload.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::{ConnectionId, UserId};

/// A serialized outbound frame, shared between every recipient of a fan-out.
pub type Outbound = Arc<str>;

/// Default outbound queue capacity per session.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Platform tag used when the client does not send one.
pub const DEFAULT_PLATFORM: &str = "web";

/// Why a payload was not accepted by a session's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    /// The queue is at capacity; the payload was discarded.
    #[error("outbound queue full, message dropped")]
    Dropped,
    /// The queue was closed by the registry or the outbound loop is gone.
    #[error("outbound queue closed")]
    Closed,
}

/// Authenticated identity attached to a session at handshake time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// Authenticated user.
    pub user_id: UserId,
    /// Client-supplied or generated device id.
    pub device_id: String,
    /// Platform tag (`web`, `ios`, `android`, ...).
    pub platform: String,
}

impl SessionIdentity {
    /// Builds an identity, filling in a generated device id and the default
    /// platform when the client left them empty.
    #[must_use]
    pub fn new(user_id: UserId, device_id: Option<String>, platform: Option<String>) -> Self {
        let device_id = device_id
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let platform = platform
            .filter(|p| !p.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PLATFORM.to_string());
        Self {
            user_id,
            device_id,
            platform,
        }
    }
}

/// One live client connection as seen by the registry and router.
#[derive(Debug)]
pub struct Session {
    id: ConnectionId,
    identity: SessionIdentity,
    connected_at: DateTime<Utc>,
    outbound: Mutex<Option<mpsc::Sender<Outbound>>>,
    closed: AtomicBool,
    close_signal: CancellationToken,
    dropped: AtomicU64,
}

impl Session {
    /// Creates a session and its outbound queue.
    ///
    /// The returned receiver must be handed to exactly one outbound loop.
    #[must_use]
    pub fn new(identity: SessionIdentity, capacity: usize) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let session = Self {
            id: ConnectionId::new(),
            identity,
            connected_at: Utc::now(),
            outbound: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            close_signal: CancellationToken::new(),
            dropped: AtomicU64::new(0),
        };
        (Arc::new(session), rx)
    }

    /// Connection id.
    #[must_use]
    pub const fn id(&self) -> ConnectionId {
        self.id
    }

    /// Authenticated user id.
    #[must_use]
    pub const fn user_id(&self) -> UserId {
        self.identity.user_id
    }

    /// Device id.
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.identity.device_id
    }

    /// Platform tag.
    #[must_use]
    pub fn platform(&self) -> &str {
        &self.identity.platform
    }

    /// When the handshake completed.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// Queues a payload for the outbound loop without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`EnqueueError::Dropped`] if the queue is full and
    /// [`EnqueueError::Closed`] if the queue has been closed.
    pub fn enqueue(&self, payload: Outbound) -> Result<(), EnqueueError> {
        let guard = self.outbound.lock();
        let Some(tx) = guard.as_ref() else {
            return Err(EnqueueError::Closed);
        };
        match tx.try_send(payload) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Err(EnqueueError::Dropped)
            }
            Err(TrySendError::Closed(_)) => Err(EnqueueError::Closed),
        }
    }

    /// Closes the outbound queue. Already-queued payloads are still drained
    /// by the outbound loop, after which it writes a close frame and exits.
    ///
    /// Returns `true` only for the call that actually closed the queue.
    pub fn close_queue(&self) -> bool {
        self.outbound.lock().take().is_some()
    }

    /// Returns `true` once the outbound queue has been closed.
    #[must_use]
    pub fn is_queue_closed(&self) -> bool {
        self.outbound.lock().is_none()
    }

    /// Signals both socket loops to stop and release the transport.
    ///
    /// Safe to call any number of times from any task; returns `true` only
    /// for the call that performed the close.
    pub fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.close_signal.cancel();
        tracing::debug!(conn_id = %self.id, user_id = %self.user_id(), "session closed");
        true
    }

    /// Returns `true` once [`Session::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Resolves when the session has been closed.
    pub async fn closed(&self) {
        self.close_signal.cancelled().await;
    }

    /// Number of payloads dropped because the queue was full.
    #[must_use]
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
