//! Per-connection read and write loops.
//!
//! A session runs two tasks. The read loop feeds inbound frames to the
//! [`MessageRouter`] under a read deadline that every frame (pongs included)
//! resets. The write loop drains the session's outbound queue, coalescing
//! whatever is pending into one text frame, and probes the peer with a ping
//! whenever the link has been quiet for a full probe period.
//!
//! Both loops are generic over the transport so tests can drive them with
//! in-memory sinks and streams; production wires them to the halves of an
//! Axum [`WebSocket`].

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SessionSettings;
use crate::domain::{Outbound, Registry, Session};
use crate::service::MessageRouter;

/// Why a single transport write failed.
#[derive(Debug, thiserror::Error)]
enum WriteFailure {
    #[error("write deadline of {0:?} exceeded")]
    Deadline(Duration),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Runs both loops of one upgraded socket until the session ends.
///
/// The write loop is spawned; the read loop runs on the calling task. Returns
/// once both have finished and the socket halves have been dropped.
pub async fn run_session(
    socket: WebSocket,
    session: Arc<Session>,
    outbound: mpsc::Receiver<Outbound>,
    registry: Registry,
    router: Arc<MessageRouter>,
    settings: SessionSettings,
) {
    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, Arc::clone(&session), outbound, settings));
    read_pump(stream, Arc::clone(&session), registry, router, settings.pong_wait).await;
    if let Err(e) = writer.await {
        tracing::warn!(conn_id = %session.id(), error = %e, "write loop aborted");
    }
    let age = chrono::Utc::now() - session.connected_at();
    tracing::info!(
        conn_id = %session.id(),
        user_id = %session.user_id(),
        dropped = session.dropped_count(),
        age_secs = age.num_seconds(),
        "session ended"
    );
}

/// Reads frames until the peer goes away, the deadline passes, or the
/// session is closed from elsewhere.
///
/// On exit the session unregisters itself and closes. This is the only path
/// by which a session removes itself from the [`Registry`].
pub async fn read_pump<R, E>(
    mut stream: R,
    session: Arc<Session>,
    registry: Registry,
    router: Arc<MessageRouter>,
    pong_wait: Duration,
) where
    R: Stream<Item = Result<Message, E>> + Unpin,
    E: fmt::Display,
{
    loop {
        let next = tokio::select! {
            () = session.closed() => break,
            next = tokio::time::timeout(pong_wait, stream.next()) => next,
        };

        let frame = match next {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => {
                tracing::debug!(conn_id = %session.id(), error = %e, "read failed");
                break;
            }
            Ok(None) => {
                tracing::debug!(conn_id = %session.id(), "peer closed stream");
                break;
            }
            Err(_) => {
                tracing::debug!(conn_id = %session.id(), ?pong_wait, "read deadline expired");
                break;
            }
        };

        let raw: &[u8] = match &frame {
            Message::Text(text) => text.as_str().as_bytes(),
            Message::Binary(bytes) => bytes.as_ref(),
            Message::Ping(_) | Message::Pong(_) => continue,
            Message::Close(_) => {
                tracing::debug!(conn_id = %session.id(), "close frame received");
                break;
            }
        };

        if let Err(e) = router.handle(&session, raw).await {
            tracing::debug!(
                conn_id = %session.id(),
                user_id = %session.user_id(),
                error = %e,
                "inbound message rejected"
            );
        }
    }

    registry.unregister(session.id()).await;
    session.close();
}

/// Drains the outbound queue onto the transport and keeps the link alive.
///
/// Terminates when the queue is closed (after sending a `Close` frame), when
/// the session is closed, or on the first failed write.
pub async fn write_pump<W>(
    mut sink: W,
    session: Arc<Session>,
    mut outbound: mpsc::Receiver<Outbound>,
    settings: SessionSettings,
) where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    let period = settings.ping_period();
    let mut probe = tokio::time::interval_at(Instant::now() + period, period);
    probe.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            next = outbound.recv() => {
                let Some(first) = next else {
                    if let Err(e) = send_within(&mut sink, Message::Close(None), settings.write_wait).await {
                        tracing::debug!(conn_id = %session.id(), error = %e, "close frame not sent");
                    }
                    break;
                };
                let frame = coalesce(first, &mut outbound);
                if let Err(e) = send_within(&mut sink, Message::text(frame), settings.write_wait).await {
                    tracing::debug!(conn_id = %session.id(), error = %e, "write failed");
                    break;
                }
                probe.reset();
            }
            () = session.closed() => break,
            _ = probe.tick() => {
                if let Err(e) = send_within(&mut sink, Message::Ping(Bytes::new()), settings.write_wait).await {
                    tracing::debug!(conn_id = %session.id(), error = %e, "ping failed");
                    break;
                }
            }
        }
    }

    session.close();
}

/// Joins `first` and every message already queued behind it with `\n`.
fn coalesce(first: Outbound, outbound: &mut mpsc::Receiver<Outbound>) -> String {
    let pending = outbound.len();
    if pending == 0 {
        return first.to_string();
    }
    let mut frame = String::from(&*first);
    for _ in 0..pending {
        match outbound.try_recv() {
            Ok(next) => {
                frame.push('\n');
                frame.push_str(&next);
            }
            Err(_) => break,
        }
    }
    frame
}

async fn send_within<W>(sink: &mut W, message: Message, wait: Duration) -> Result<(), WriteFailure>
where
    W: Sink<Message> + Unpin,
    W::Error: fmt::Display,
{
    match tokio::time::timeout(wait, sink.send(message)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(WriteFailure::Transport(e.to_string())),
        Err(_) => Err(WriteFailure::Deadline(wait)),
    }
}
