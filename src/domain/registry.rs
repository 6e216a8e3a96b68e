//! Connection registry: a single-writer actor owning the session indices.
//!
//! [`Registry`] is a cheap, cloneable handle. Every structural change
//! (register, unregister, shutdown) and every dispatch is sent as a
//! command to one control loop that owns mutation of the two indices:
//!
//! - `connections`: connection id → session, one entry per socket.
//! - `by_user`: user id → that user's sessions (multi-device).
//!
//! Because a single task applies commands in FIFO order, their effects are
//! totally ordered and the indices need no external lock. The indices are
//! `DashMap`s only so that read-only presence and statistics queries can be
//! answered from any task without a round trip; such reads may lag the
//! control loop by one command.
//!
//! # Invariants
//!
//! - A session id is in `connections` iff it is in `by_user[owner]`.
//! - `by_user` never holds an empty set.
//! - Unregistering an absent id is a no-op, so a session's queue is closed
//!   at most once by the registry.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::session::{EnqueueError, Outbound, Session};
use super::{ConnectionId, UserId};
use crate::error::GatewayError;

/// Default capacity of the control channel.
pub const DEFAULT_REGISTRY_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Index {
    connections: DashMap<ConnectionId, Arc<Session>>,
    by_user: DashMap<UserId, HashMap<ConnectionId, Arc<Session>>>,
}

/// Messages processed by the control loop.
#[derive(Debug)]
enum Command {
    Register(Arc<Session>),
    Unregister(ConnectionId),
    DispatchToUser {
        user_id: UserId,
        payload: Outbound,
        reply: oneshot::Sender<Result<usize, GatewayError>>,
    },
    DispatchToUsers {
        user_ids: Vec<UserId>,
        payload: Outbound,
    },
    Broadcast {
        payload: Outbound,
    },
    Shutdown {
        done: oneshot::Sender<usize>,
    },
}

/// Handle to the connection registry actor.
#[derive(Debug, Clone)]
pub struct Registry {
    commands: mpsc::Sender<Command>,
    index: Arc<Index>,
}

impl Registry {
    /// Starts the control loop and returns a handle plus the loop's join
    /// handle. The loop runs until [`Registry::shutdown`] is processed or
    /// every handle is dropped.
    #[must_use]
    pub fn spawn(capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let index = Arc::new(Index::default());
        let control = ControlLoop {
            commands: rx,
            index: Arc::clone(&index),
        };
        let handle = tokio::spawn(control.run());
        (
            Self {
                commands: tx,
                index,
            },
            handle,
        )
    }

    /// Adds a session to both indices.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RegistryClosed`] if the registry has shut
    /// down; the caller owns the session and must close it.
    pub async fn register(&self, session: Arc<Session>) -> Result<(), GatewayError> {
        self.submit(Command::Register(session)).await
    }

    /// Removes a session from both indices and closes its outbound queue.
    ///
    /// Unknown ids are ignored, as is a registry that has already shut
    /// down (shutdown closed every queue already).
    pub async fn unregister(&self, id: ConnectionId) {
        if self.submit(Command::Unregister(id)).await.is_err() {
            tracing::debug!(conn_id = %id, "unregister after registry shutdown ignored");
        }
    }

    /// Enqueues `payload` on every session of `user_id`.
    ///
    /// Each enqueue is drop-on-full, so a slow device never delays the
    /// others. Returns the number of sessions that accepted the payload.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::UserNotOnline`] if the user has no session,
    /// or [`GatewayError::RegistryClosed`] after shutdown.
    pub async fn dispatch_to_user(
        &self,
        user_id: UserId,
        payload: Outbound,
    ) -> Result<usize, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::DispatchToUser {
            user_id,
            payload,
            reply,
        })
        .await?;
        rx.await.map_err(|_| GatewayError::RegistryClosed)?
    }

    /// Enqueues `payload` for each listed user that is online. Offline
    /// users are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RegistryClosed`] after shutdown.
    pub async fn dispatch_to_users(
        &self,
        user_ids: Vec<UserId>,
        payload: Outbound,
    ) -> Result<(), GatewayError> {
        self.submit(Command::DispatchToUsers { user_ids, payload })
            .await
    }

    /// Enqueues `payload` on every registered session.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RegistryClosed`] after shutdown.
    pub async fn broadcast(&self, payload: Outbound) -> Result<(), GatewayError> {
        self.submit(Command::Broadcast { payload }).await
    }

    /// Closes every session and stops the control loop.
    ///
    /// Returns the number of sessions that were closed. Calling it again
    /// after the loop has exited returns `0`.
    pub async fn shutdown(&self) -> usize {
        let (done, rx) = oneshot::channel();
        if self.submit(Command::Shutdown { done }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Returns `true` if the user has at least one registered session.
    #[must_use]
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.index.by_user.contains_key(&user_id)
    }

    /// Number of distinct users online.
    #[must_use]
    pub fn online_user_count(&self) -> usize {
        self.index.by_user.len()
    }

    /// Number of registered connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.index.connections.len()
    }

    /// Looks up a registered session by connection id.
    #[must_use]
    pub fn session(&self, id: ConnectionId) -> Option<Arc<Session>> {
        self.index.connections.get(&id).map(|s| Arc::clone(s.value()))
    }

    async fn submit(&self, command: Command) -> Result<(), GatewayError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| GatewayError::RegistryClosed)
    }
}

/// The single consumer of registry commands.
struct ControlLoop {
    commands: mpsc::Receiver<Command>,
    index: Arc<Index>,
}

impl ControlLoop {
    async fn run(mut self) {
        let mut shut_down = false;
        while let Some(command) = self.commands.recv().await {
            match command {
                Command::Register(session) => self.register(session),
                Command::Unregister(id) => self.unregister(id),
                Command::DispatchToUser {
                    user_id,
                    payload,
                    reply,
                } => {
                    let _ = reply.send(self.dispatch_to_user(user_id, &payload));
                }
                Command::DispatchToUsers { user_ids, payload } => {
                    for user_id in user_ids {
                        if let Err(err) = self.dispatch_to_user(user_id, &payload) {
                            tracing::debug!(%user_id, error = %err, "skipping offline user");
                        }
                    }
                }
                Command::Broadcast { payload } => self.broadcast(&payload),
                Command::Shutdown { done } => {
                    let closed = self.close_all();
                    let _ = done.send(closed);
                    shut_down = true;
                    break;
                }
            }
        }

        if !shut_down {
            self.close_all();
        }

        // Anything still queued behind the shutdown is refused; sessions that
        // never made it into the index are closed here so no loop is left
        // running against an unregistered session.
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Register(session) = command {
                session.close_queue();
                session.close();
            }
        }
        tracing::info!("registry control loop stopped");
    }

    fn register(&self, session: Arc<Session>) {
        let id = session.id();
        let user_id = session.user_id();
        self.index.connections.insert(id, Arc::clone(&session));
        self.index
            .by_user
            .entry(user_id)
            .or_default()
            .insert(id, Arc::clone(&session));
        tracing::info!(
            conn_id = %id,
            %user_id,
            device_id = session.device_id(),
            platform = session.platform(),
            "connection registered"
        );
    }

    fn unregister(&self, id: ConnectionId) {
        let Some((_, session)) = self.index.connections.remove(&id) else {
            tracing::debug!(conn_id = %id, "unregister of unknown connection ignored");
            return;
        };
        let user_id = session.user_id();
        if let Some(mut set) = self.index.by_user.get_mut(&user_id) {
            set.remove(&id);
        }
        self.index.by_user.remove_if(&user_id, |_, set| set.is_empty());
        session.close_queue();
        tracing::info!(conn_id = %id, %user_id, "connection unregistered");
    }

    fn dispatch_to_user(&self, user_id: UserId, payload: &Outbound) -> Result<usize, GatewayError> {
        let Some(set) = self.index.by_user.get(&user_id) else {
            return Err(GatewayError::UserNotOnline(user_id));
        };
        Ok(set
            .values()
            .filter(|session| deliver(session, payload))
            .count())
    }

    fn broadcast(&self, payload: &Outbound) {
        let mut delivered = 0usize;
        for entry in &self.index.connections {
            if deliver(entry.value(), payload) {
                delivered += 1;
            }
        }
        tracing::debug!(delivered, "broadcast dispatched");
    }

    fn close_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .index
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for session in &sessions {
            session.close_queue();
            session.close();
        }
        self.index.connections.clear();
        self.index.by_user.clear();
        tracing::info!(closed = sessions.len(), "registry shut down");
        sessions.len()
    }
}

/// Non-blocking enqueue with drop-on-full. Returns `true` if accepted.
fn deliver(session: &Session, payload: &Outbound) -> bool {
    match session.enqueue(Arc::clone(payload)) {
        Ok(()) => true,
        Err(EnqueueError::Dropped) => {
            tracing::warn!(
                conn_id = %session.id(),
                user_id = %session.user_id(),
                "outbound queue full, message dropped"
            );
            false
        }
        Err(EnqueueError::Closed) => {
            tracing::debug!(conn_id = %session.id(), "outbound queue closed, message skipped");
            false
        }
    }
}
