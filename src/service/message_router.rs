//! Inbound message routing.
//!
//! [`MessageRouter::handle`] decodes one client frame and acts on it. Chat
//! messages pass the relation gate, are written to the durable log, fanned
//! out to every device of the receiver, and acknowledged to the sender.
//! Protocol errors are answered on the sender's own queue and never end the
//! session.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::{Registry, Session, UserId};
use crate::error::GatewayError;
use crate::persistence::LogProducer;
use crate::relation::{BlockStatus, RelationChecker, RelationFallback};
use crate::ws::messages::{
    AckPayload, AckStatus, ChatPayload, ErrorPayload, InboundEnvelope, MessageType,
    OutboundEnvelope, PongPayload, ReadPayload, TypingPayload,
};

/// Default bound on a single durable-log publish.
pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(2);

/// Outcome of the relation gate for one direct message.
#[derive(Debug)]
enum Gate {
    Open,
    NotFriends,
    Blocked(BlockStatus),
    Unavailable(String),
}

/// Decodes client frames and routes them to their recipients.
#[derive(Debug)]
pub struct MessageRouter {
    registry: Registry,
    relations: Arc<dyn RelationChecker>,
    log: Arc<dyn LogProducer>,
    fallback: RelationFallback,
    publish_timeout: Duration,
}

impl MessageRouter {
    /// Creates a router that fails closed when the relation store is down.
    #[must_use]
    pub fn new(
        registry: Registry,
        relations: Arc<dyn RelationChecker>,
        log: Arc<dyn LogProducer>,
    ) -> Self {
        Self {
            registry,
            relations,
            log,
            fallback: RelationFallback::default(),
            publish_timeout: DEFAULT_PUBLISH_TIMEOUT,
        }
    }

    /// Sets the policy applied when relation lookups fail.
    #[must_use]
    pub const fn with_fallback(mut self, fallback: RelationFallback) -> Self {
        self.fallback = fallback;
        self
    }

    /// Sets the bound on a single durable-log publish.
    #[must_use]
    pub const fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Handles one raw frame received on `session`.
    ///
    /// Every rejection is also answered to the sender with an `error`
    /// envelope. An unknown message type is answered but is not an error.
    ///
    /// # Errors
    ///
    /// - [`GatewayError::MalformedEnvelope`] if the frame or its payload is
    ///   not valid JSON for its type.
    /// - [`GatewayError::InvalidRequest`] if a payload fails validation.
    /// - [`GatewayError::RelationUnavailable`] if the relation store is down
    ///   and the fallback policy denies delivery.
    /// - [`GatewayError::Internal`] if an outbound envelope fails to encode.
    pub async fn handle(&self, session: &Session, raw: &[u8]) -> Result<(), GatewayError> {
        let envelope: InboundEnvelope = match serde_json::from_slice(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                reply_error(session, 400, "invalid message format", None);
                return Err(e.into());
            }
        };
        let trace_id = envelope.trace_id.as_deref();
        tracing::debug!(
            conn_id = %session.id(),
            user_id = %session.user_id(),
            msg_type = ?envelope.msg_type,
            trace_id,
            "message received"
        );

        match envelope.msg_type {
            MessageType::Chat => self.handle_chat(session, envelope.data, trace_id).await,
            MessageType::Heartbeat => {
                reply(session, MessageType::Heartbeat, &PongPayload::default(), trace_id);
                Ok(())
            }
            MessageType::Ack => {
                let ack: AckPayload = decode(session, envelope.data, "invalid ack message", trace_id)?;
                validated(session, ack.validate(), trace_id)?;
                tracing::debug!(user_id = %session.user_id(), msg_id = %ack.msg_id, status = ?ack.status, "ack received");
                Ok(())
            }
            MessageType::Read => {
                let read: ReadPayload = decode(session, envelope.data, "invalid read message", trace_id)?;
                validated(session, read.validate(), trace_id)?;
                tracing::debug!(
                    user_id = %session.user_id(),
                    conversation_id = %read.conversation_id,
                    count = read.msg_ids.len(),
                    "read receipt received"
                );
                Ok(())
            }
            MessageType::Typing => {
                let typing: TypingPayload =
                    decode(session, envelope.data, "invalid typing message", trace_id)?;
                validated(session, typing.validate(), trace_id)?;
                tracing::debug!(
                    user_id = %session.user_id(),
                    conversation_id = %typing.conversation_id,
                    is_typing = typing.is_typing,
                    "typing indicator received"
                );
                Ok(())
            }
            MessageType::Error | MessageType::RelationChanged | MessageType::Unknown => {
                reply_error(session, 400, "unknown message type", trace_id);
                Ok(())
            }
        }
    }

    async fn handle_chat(
        &self,
        session: &Session,
        data: serde_json::Value,
        trace_id: Option<&str>,
    ) -> Result<(), GatewayError> {
        let mut chat: ChatPayload = decode(session, data, "invalid chat message", trace_id)?;
        chat.sender_id = session.user_id();
        chat.timestamp = chrono::Utc::now().timestamp_millis();
        if chat.msg_id.trim().is_empty() {
            chat.msg_id = uuid::Uuid::new_v4().to_string();
        }

        if !chat.receiver_id.is_set() {
            let reason = if chat.group_id != 0 {
                "group chat is not supported"
            } else {
                "receiver_id required"
            };
            reply_error(session, 400, reason, trace_id);
            return Err(GatewayError::InvalidRequest(reason.to_string()));
        }

        match self.gate(chat.sender_id, chat.receiver_id).await {
            Gate::Open => {}
            Gate::NotFriends => {
                tracing::debug!(sender_id = %chat.sender_id, receiver_id = %chat.receiver_id, "chat denied: not friends");
                reply_error(session, 403, "not friends with this user", trace_id);
                return Ok(());
            }
            Gate::Blocked(status) => {
                // Acknowledged as sent so the blocked party cannot tell.
                tracing::info!(
                    sender_id = %chat.sender_id,
                    receiver_id = %chat.receiver_id,
                    sender_blocked = status.sender_blocked,
                    receiver_blocked = status.receiver_blocked,
                    msg_id = %chat.msg_id,
                    "chat suppressed by block"
                );
                ack_sent(session, &chat.msg_id, trace_id);
                return Ok(());
            }
            Gate::Unavailable(reason) => {
                reply_error(session, 503, "relation service unavailable", trace_id);
                return Err(GatewayError::RelationUnavailable(reason));
            }
        }

        let frame = OutboundEnvelope::new(MessageType::Chat, &chat, trace_id)
            .to_frame()
            .map_err(|e| GatewayError::Internal(e.to_string()))?;

        self.publish(&chat.msg_id, frame.as_bytes(), trace_id).await;

        match self
            .registry
            .dispatch_to_user(chat.receiver_id, Arc::clone(&frame))
            .await
        {
            Ok(devices) => tracing::info!(
                sender_id = %chat.sender_id,
                receiver_id = %chat.receiver_id,
                msg_id = %chat.msg_id,
                devices,
                "chat forwarded"
            ),
            Err(GatewayError::UserNotOnline(_)) => tracing::debug!(
                receiver_id = %chat.receiver_id,
                msg_id = %chat.msg_id,
                "receiver offline; left to the durable log"
            ),
            Err(e) => tracing::warn!(
                receiver_id = %chat.receiver_id,
                msg_id = %chat.msg_id,
                error = %e,
                "chat not forwarded"
            ),
        }

        ack_sent(session, &chat.msg_id, trace_id);
        Ok(())
    }

    async fn gate(&self, sender: UserId, receiver: UserId) -> Gate {
        match self.lookup(sender, receiver).await {
            Ok(gate) => gate,
            Err(e) => match self.fallback {
                RelationFallback::Deny => {
                    tracing::warn!(%sender, %receiver, error = %e, "relation lookup failed; denying");
                    Gate::Unavailable(e.to_string())
                }
                RelationFallback::Allow => {
                    tracing::warn!(%sender, %receiver, error = %e, "relation lookup failed; allowing");
                    Gate::Open
                }
            },
        }
    }

    async fn lookup(&self, sender: UserId, receiver: UserId) -> Result<Gate, GatewayError> {
        if !self.relations.is_friend(sender, receiver).await? {
            return Ok(Gate::NotFriends);
        }
        let status = self.relations.block_status(sender, receiver).await?;
        if status.any() {
            return Ok(Gate::Blocked(status));
        }
        Ok(Gate::Open)
    }

    /// Best-effort append to the durable log. Failures are logged only.
    async fn publish(&self, key: &str, value: &[u8], trace_id: Option<&str>) {
        match tokio::time::timeout(self.publish_timeout, self.log.publish(key, value)).await {
            Ok(Ok(())) => tracing::debug!(msg_id = key, trace_id, "chat written to durable log"),
            Ok(Err(e)) => tracing::error!(msg_id = key, trace_id, error = %e, "durable log publish failed"),
            Err(_) => tracing::error!(
                msg_id = key,
                trace_id,
                timeout = ?self.publish_timeout,
                "durable log publish timed out"
            ),
        }
    }
}

fn decode<T: DeserializeOwned>(
    session: &Session,
    data: serde_json::Value,
    invalid: &'static str,
    trace_id: Option<&str>,
) -> Result<T, GatewayError> {
    serde_json::from_value(data).map_err(|e| {
        reply_error(session, 400, invalid, trace_id);
        GatewayError::from(e)
    })
}

fn validated(
    session: &Session,
    check: Result<(), &'static str>,
    trace_id: Option<&str>,
) -> Result<(), GatewayError> {
    check.map_err(|reason| {
        reply_error(session, 400, reason, trace_id);
        GatewayError::InvalidRequest(reason.to_string())
    })
}

fn ack_sent(session: &Session, msg_id: &str, trace_id: Option<&str>) {
    let ack = AckPayload {
        msg_id: msg_id.to_string(),
        status: AckStatus::Sent,
    };
    reply(session, MessageType::Ack, &ack, trace_id);
}

fn reply_error(session: &Session, code: u16, message: &str, trace_id: Option<&str>) {
    let payload = ErrorPayload {
        code,
        message: message.to_string(),
    };
    reply(session, MessageType::Error, &payload, trace_id);
}

/// Queues a reply on the sender's own session.
fn reply<T: Serialize>(session: &Session, msg_type: MessageType, data: &T, trace_id: Option<&str>) {
    let frame = match OutboundEnvelope::new(msg_type, data, trace_id).to_frame() {
        Ok(frame) => frame,
        Err(e) => {
            tracing::error!(conn_id = %session.id(), error = %e, "reply encoding failed");
            return;
        }
    };
    if let Err(e) = session.enqueue(frame) {
        tracing::warn!(conn_id = %session.id(), user_id = %session.user_id(), error = %e, "reply not queued");
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use serde_json::{Value, json};
    use tokio::sync::mpsc;

    use super::*;
    use crate::domain::{Outbound, SessionIdentity};
    use crate::persistence::MemoryLog;
    use crate::relation::MemoryRelations;

    const ALICE: UserId = UserId::new(1);
    const BOB: UserId = UserId::new(2);

    struct Fixture {
        registry: Registry,
        relations: Arc<MemoryRelations>,
        log: Arc<MemoryLog>,
        router: MessageRouter,
    }

    fn fixture() -> Fixture {
        let (registry, _control) = Registry::spawn(64);
        let relations = Arc::new(MemoryRelations::new());
        let log = Arc::new(MemoryLog::new("chat.messages"));
        let router = MessageRouter::new(
            registry.clone(),
            Arc::clone(&relations) as Arc<dyn RelationChecker>,
            Arc::clone(&log) as Arc<dyn LogProducer>,
        );
        Fixture {
            registry,
            relations,
            log,
            router,
        }
    }

    async fn connect(registry: &Registry, user: UserId) -> (Arc<Session>, mpsc::Receiver<Outbound>) {
        let (session, rx) = Session::new(SessionIdentity::new(user, None, None), 16);
        let Ok(()) = registry.register(Arc::clone(&session)).await else {
            panic!("register failed");
        };
        (session, rx)
    }

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = rx.try_recv() {
            let Ok(value) = serde_json::from_str::<Value>(&frame) else {
                panic!("frame is not JSON: {frame}");
            };
            out.push(value);
        }
        out
    }

    fn chat_to(receiver: UserId) -> Vec<u8> {
        json!({
            "type": "chat",
            "trace_id": "tr-1",
            "data": {
                "msg_id": "m-1",
                "conversation_id": "c-1",
                "sender_id": 999,
                "receiver_id": receiver.get(),
                "msg_type": 1,
                "content": "hello",
                "timestamp": 5
            }
        })
        .to_string()
        .into_bytes()
    }

    #[tokio::test]
    async fn strangers_get_403_and_nothing_is_sent() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;
        let (_bob, mut bob_rx) = connect(&f.registry, BOB).await;

        tokio_test::assert_ok!(f.router.handle(&alice, &chat_to(BOB)).await);

        let replies = drain(&mut alice_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies.first().map(|r| &r["type"]), Some(&json!("error")));
        assert_eq!(replies.first().map(|r| &r["data"]["code"]), Some(&json!(403)));
        assert!(drain(&mut bob_rx).is_empty());
        assert!(f.log.is_empty());
    }

    #[tokio::test]
    async fn blocked_chat_is_acked_but_suppressed() {
        let f = fixture();
        f.relations.befriend(ALICE, BOB);
        f.relations.block(BOB, ALICE);
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;
        let (_bob, mut bob_rx) = connect(&f.registry, BOB).await;

        tokio_test::assert_ok!(f.router.handle(&alice, &chat_to(BOB)).await);

        let replies = drain(&mut alice_rx);
        assert_eq!(replies.len(), 1);
        let Some(ack) = replies.first() else {
            panic!("expected an ack");
        };
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["data"]["status"], 1);
        assert_eq!(ack["data"]["msg_id"], "m-1");
        assert!(drain(&mut bob_rx).is_empty());
        assert!(f.log.is_empty());
    }

    #[tokio::test]
    async fn friends_chat_fans_out_to_every_device() {
        let f = fixture();
        f.relations.befriend(ALICE, BOB);
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;
        let (_phone, mut phone_rx) = connect(&f.registry, BOB).await;
        let (_laptop, mut laptop_rx) = connect(&f.registry, BOB).await;

        tokio_test::assert_ok!(f.router.handle(&alice, &chat_to(BOB)).await);

        let records = f.log.records();
        assert_eq!(records.len(), 1);
        let Some(record) = records.first() else {
            panic!("expected one log record");
        };
        assert_eq!(record.key, "m-1");
        let Ok(logged) = record.decode::<Value>() else {
            panic!("log record is not JSON");
        };
        assert_eq!(logged["type"], "chat");
        assert_eq!(logged["trace_id"], "tr-1");

        for rx in [&mut phone_rx, &mut laptop_rx] {
            let frames = drain(rx);
            assert_eq!(frames.len(), 1);
            let Some(chat) = frames.first() else {
                panic!("device got no chat");
            };
            assert_eq!(chat["type"], "chat");
            assert_eq!(chat["data"]["sender_id"], ALICE.get());
            assert_ne!(chat["data"]["timestamp"], 5);
        }

        let replies = drain(&mut alice_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies.first().map(|r| &r["data"]["status"]), Some(&json!(1)));
    }

    /// Producer whose publish never completes.
    #[derive(Debug)]
    struct StalledLog;

    #[async_trait::async_trait]
    impl LogProducer for StalledLog {
        async fn publish(&self, _key: &str, _value: &[u8]) -> Result<(), GatewayError> {
            std::future::pending().await
        }

        async fn close(&self) -> Result<(), GatewayError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn hung_log_still_delivers_after_publish_timeout() {
        let (registry, _control) = Registry::spawn(64);
        let relations = Arc::new(MemoryRelations::new());
        relations.befriend(ALICE, BOB);
        let router = MessageRouter::new(registry.clone(), relations, Arc::new(StalledLog))
            .with_publish_timeout(Duration::from_millis(250));
        let (alice, mut alice_rx) = connect(&registry, ALICE).await;
        let (_bob, mut bob_rx) = connect(&registry, BOB).await;

        let started = tokio::time::Instant::now();
        tokio_test::assert_ok!(router.handle(&alice, &chat_to(BOB)).await);
        assert!(started.elapsed() >= Duration::from_millis(250));

        let delivered = drain(&mut bob_rx);
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered.first().map(|c| &c["type"]), Some(&json!("chat")));
        let replies = drain(&mut alice_rx);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies.first().map(|r| &r["type"]), Some(&json!("ack")));
    }

    #[tokio::test]
    async fn offline_receiver_is_still_logged_and_acked() {
        let f = fixture();
        f.relations.befriend(ALICE, BOB);
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;

        tokio_test::assert_ok!(f.router.handle(&alice, &chat_to(BOB)).await);

        assert_eq!(f.log.len(), 1);
        let replies = drain(&mut alice_rx);
        assert_eq!(replies.first().map(|r| &r["type"]), Some(&json!("ack")));
    }

    #[tokio::test]
    async fn log_outage_does_not_block_delivery() {
        let f = fixture();
        f.relations.befriend(ALICE, BOB);
        f.log.set_failing(true);
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;
        let (_bob, mut bob_rx) = connect(&f.registry, BOB).await;

        tokio_test::assert_ok!(f.router.handle(&alice, &chat_to(BOB)).await);

        assert!(f.log.is_empty());
        assert_eq!(drain(&mut bob_rx).len(), 1);
        assert_eq!(drain(&mut alice_rx).len(), 1);
    }

    #[tokio::test]
    async fn relation_outage_fails_closed_by_default() {
        let f = fixture();
        f.relations.befriend(ALICE, BOB);
        f.relations.set_unavailable(true);
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;
        let (_bob, mut bob_rx) = connect(&f.registry, BOB).await;

        let res = f.router.handle(&alice, &chat_to(BOB)).await;
        assert!(matches!(res, Err(GatewayError::RelationUnavailable(_))));

        let replies = drain(&mut alice_rx);
        assert_eq!(replies.first().map(|r| &r["data"]["code"]), Some(&json!(503)));
        assert!(drain(&mut bob_rx).is_empty());
        assert!(f.log.is_empty());
    }

    #[tokio::test]
    async fn relation_outage_with_allow_fallback_delivers() {
        let f = fixture();
        f.relations.set_unavailable(true);
        let router = MessageRouter::new(
            f.registry.clone(),
            Arc::clone(&f.relations) as Arc<dyn RelationChecker>,
            Arc::clone(&f.log) as Arc<dyn LogProducer>,
        )
        .with_fallback(RelationFallback::Allow);
        let (alice, _alice_rx) = connect(&f.registry, ALICE).await;
        let (_bob, mut bob_rx) = connect(&f.registry, BOB).await;

        tokio_test::assert_ok!(router.handle(&alice, &chat_to(BOB)).await);

        assert_eq!(drain(&mut bob_rx).len(), 1);
        assert_eq!(f.log.len(), 1);
    }

    #[tokio::test]
    async fn malformed_frame_is_answered_and_reported() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;

        let res = f.router.handle(&alice, b"{nope").await;
        assert!(matches!(res, Err(GatewayError::MalformedEnvelope(_))));

        let replies = drain(&mut alice_rx);
        assert_eq!(replies.first().map(|r| &r["data"]["message"]), Some(&json!("invalid message format")));
    }

    #[tokio::test]
    async fn unknown_type_is_answered_without_error() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;

        tokio_test::assert_ok!(f.router.handle(&alice, br#"{"type":"presence","data":{}}"#).await);

        let replies = drain(&mut alice_rx);
        assert_eq!(replies.first().map(|r| &r["data"]["message"]), Some(&json!("unknown message type")));
    }

    #[tokio::test]
    async fn heartbeat_echoes_trace_id() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;

        tokio_test::assert_ok!(f.router.handle(&alice, br#"{"type":"heartbeat","trace_id":"hb"}"#).await);

        let replies = drain(&mut alice_rx);
        assert_eq!(
            replies.first(),
            Some(&json!({"type": "heartbeat", "data": {"status": "pong"}, "trace_id": "hb"}))
        );
    }

    #[tokio::test]
    async fn chat_without_receiver_is_rejected() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;

        let group = json!({"type": "chat", "data": {"group_id": 42, "content": "hi"}}).to_string();
        let res = f.router.handle(&alice, group.as_bytes()).await;
        assert!(matches!(res, Err(GatewayError::InvalidRequest(_))));

        let nobody = json!({"type": "chat", "data": {"content": "hi"}}).to_string();
        assert!(f.router.handle(&alice, nobody.as_bytes()).await.is_err());

        let messages: Vec<Value> = drain(&mut alice_rx)
            .into_iter()
            .map(|r| r["data"]["message"].clone())
            .collect();
        assert_eq!(messages, vec![json!("group chat is not supported"), json!("receiver_id required")]);
        assert!(f.log.is_empty());
    }

    #[tokio::test]
    async fn missing_msg_id_is_generated() {
        let f = fixture();
        f.relations.befriend(ALICE, BOB);
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;

        let raw = json!({"type": "chat", "data": {"receiver_id": BOB.get(), "content": "hi"}}).to_string();
        tokio_test::assert_ok!(f.router.handle(&alice, raw.as_bytes()).await);

        let replies = drain(&mut alice_rx);
        let Some(msg_id) = replies.first().and_then(|r| r["data"]["msg_id"].as_str()) else {
            panic!("ack should carry a msg_id");
        };
        assert!(uuid::Uuid::parse_str(msg_id).is_ok());
        assert_eq!(f.log.records().first().map(|r| r.key.clone()), Some(msg_id.to_string()));
    }

    #[tokio::test]
    async fn receipts_are_validated() {
        let f = fixture();
        let (alice, mut alice_rx) = connect(&f.registry, ALICE).await;

        let ok = json!({"type": "read", "data": {"conversation_id": "c", "msg_ids": ["m"]}}).to_string();
        tokio_test::assert_ok!(f.router.handle(&alice, ok.as_bytes()).await);
        assert!(drain(&mut alice_rx).is_empty());

        let empty = json!({"type": "read", "data": {"conversation_id": "c", "msg_ids": []}}).to_string();
        let res = f.router.handle(&alice, empty.as_bytes()).await;
        assert!(matches!(res, Err(GatewayError::InvalidRequest(_))));

        let bad_ack = json!({"type": "ack", "data": {"msg_id": "m", "status": 9}}).to_string();
        let res = f.router.handle(&alice, bad_ack.as_bytes()).await;
        assert!(matches!(res, Err(GatewayError::MalformedEnvelope(_))));

        let typing = json!({"type": "typing", "data": {"conversation_id": "c", "is_typing": true}}).to_string();
        tokio_test::assert_ok!(f.router.handle(&alice, typing.as_bytes()).await);

        assert_eq!(drain(&mut alice_rx).len(), 2);
    }
}
