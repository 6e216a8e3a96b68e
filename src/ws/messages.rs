//! WebSocket message types: envelopes and per-type payloads.
//!
//! Every frame is a JSON envelope `{"type", "data", "trace_id"?}`. Inbound
//! envelopes keep `data` as an untyped [`serde_json::Value`] until the router
//! knows which payload to decode; outbound envelopes borrow an already typed
//! payload and are serialized once into a shared [`Outbound`] frame.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::domain::{Outbound, RelationAction, RelationEvent, RelationKind, UserId};

/// Discriminator for envelope types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Chat message (both directions).
    Chat,
    /// Delivery acknowledgement (both directions).
    Ack,
    /// Read receipt (client → server).
    Read,
    /// Typing indicator (client → server).
    Typing,
    /// Application-level keepalive and its pong reply.
    Heartbeat,
    /// Server → client error.
    Error,
    /// Server → client relationship change notification.
    RelationChanged,
    /// Any type this gateway does not understand.
    #[serde(other)]
    Unknown,
}

/// Envelope as received from a client.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundEnvelope {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Type-specific payload, decoded by the router.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Optional client correlation id, echoed on replies.
    #[serde(default)]
    pub trace_id: Option<String>,
}

/// Envelope as sent to a client or written to the durable log.
#[derive(Debug, Serialize)]
pub struct OutboundEnvelope<'a, T: Serialize> {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub msg_type: MessageType,
    /// Type-specific payload.
    pub data: &'a T,
    /// Correlation id copied from the triggering request or event.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<&'a str>,
}

impl<'a, T: Serialize> OutboundEnvelope<'a, T> {
    /// Creates an envelope around a borrowed payload.
    #[must_use]
    pub const fn new(msg_type: MessageType, data: &'a T, trace_id: Option<&'a str>) -> Self {
        Self {
            msg_type,
            data,
            trace_id,
        }
    }

    /// Serializes the envelope into a frame ready for any number of queues.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if the payload fails to serialize.
    pub fn to_frame(&self) -> Result<Outbound, serde_json::Error> {
        serde_json::to_string(self).map(Arc::from)
    }
}

/// `chat` payload.
///
/// `sender_id` and `timestamp` are always overwritten by the gateway; the
/// client's values are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatPayload {
    /// Client- or server-assigned message id.
    #[serde(default)]
    pub msg_id: String,
    /// Conversation the message belongs to.
    #[serde(default)]
    pub conversation_id: String,
    /// Authenticated sender.
    #[serde(default)]
    pub sender_id: UserId,
    /// Direct-message recipient; `0` when absent.
    #[serde(default, skip_serializing_if = "is_unset_user")]
    pub receiver_id: UserId,
    /// Group id; `0` when absent.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub group_id: i64,
    /// Content type (text, image, ...), opaque to the gateway.
    #[serde(default)]
    pub msg_type: i32,
    /// Message body.
    #[serde(default)]
    pub content: String,
    /// Server receipt time in Unix milliseconds.
    #[serde(default)]
    pub timestamp: i64,
}

/// Delivery state carried in an `ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum AckStatus {
    /// Accepted by the gateway.
    Sent = 1,
    /// Delivered to a recipient device.
    Delivered = 2,
    /// Read by the recipient.
    Read = 3,
}

impl TryFrom<u8> for AckStatus {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Sent),
            2 => Ok(Self::Delivered),
            3 => Ok(Self::Read),
            other => Err(format!("invalid ack status {other}")),
        }
    }
}

impl From<AckStatus> for u8 {
    fn from(status: AckStatus) -> Self {
        status as Self
    }
}

/// `ack` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Acknowledged message id.
    pub msg_id: String,
    /// Delivery state.
    pub status: AckStatus,
}

/// `read` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadPayload {
    /// Conversation being read.
    pub conversation_id: String,
    /// Messages marked read.
    pub msg_ids: Vec<String>,
}

/// `typing` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingPayload {
    /// Conversation the indicator applies to.
    pub conversation_id: String,
    /// Whether the user is currently typing.
    pub is_typing: bool,
}

/// `error` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Numeric code: 400 malformed/invalid, 403 relation denial, 503
    /// relation store unavailable.
    pub code: u16,
    /// Human-readable reason.
    pub message: String,
}

/// `heartbeat` reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongPayload {
    /// Always `"pong"`.
    pub status: String,
}

impl Default for PongPayload {
    fn default() -> Self {
        Self {
            status: "pong".to_string(),
        }
    }
}

/// `relation_changed` payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationChangedPayload {
    /// Relationship kind.
    #[serde(rename = "type")]
    pub kind: RelationKind,
    /// Initiating user.
    pub user_id: UserId,
    /// Other party.
    pub peer_id: UserId,
    /// What happened.
    pub action: RelationAction,
}

impl From<&RelationEvent> for RelationChangedPayload {
    fn from(event: &RelationEvent) -> Self {
        Self {
            kind: event.kind,
            user_id: event.user_id,
            peer_id: event.peer_id,
            action: event.action.clone(),
        }
    }
}

impl AckPayload {
    /// Structural validation beyond what decoding enforces.
    ///
    /// # Errors
    ///
    /// Returns the reason the payload is invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.msg_id.trim().is_empty() {
            return Err("ack requires msg_id");
        }
        Ok(())
    }
}

impl ReadPayload {
    /// Structural validation beyond what decoding enforces.
    ///
    /// # Errors
    ///
    /// Returns the reason the payload is invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.conversation_id.trim().is_empty() {
            return Err("read receipt requires conversation_id");
        }
        if self.msg_ids.is_empty() {
            return Err("read receipt requires msg_ids");
        }
        Ok(())
    }
}

impl TypingPayload {
    /// Structural validation beyond what decoding enforces.
    ///
    /// # Errors
    ///
    /// Returns the reason the payload is invalid.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.conversation_id.trim().is_empty() {
            return Err("typing requires conversation_id");
        }
        Ok(())
    }
}

fn is_unset_user(id: &UserId) -> bool {
    !id.is_set()
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn unknown_type_decodes_as_unknown() {
        let Ok(env) = serde_json::from_str::<InboundEnvelope>(r#"{"type":"presence","data":{}}"#)
        else {
            panic!("envelope should decode");
        };
        assert_eq!(env.msg_type, MessageType::Unknown);
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(serde_json::from_str::<InboundEnvelope>(r#"{"data":{}}"#).is_err());
        assert!(serde_json::from_str::<InboundEnvelope>("not json").is_err());
    }

    #[test]
    fn data_and_trace_are_optional() {
        let Ok(env) = serde_json::from_str::<InboundEnvelope>(r#"{"type":"heartbeat"}"#) else {
            panic!("heartbeat should decode");
        };
        assert_eq!(env.msg_type, MessageType::Heartbeat);
        assert!(env.data.is_null());
        assert!(env.trace_id.is_none());
    }

    #[test]
    fn chat_omits_absent_targets() {
        let chat = ChatPayload {
            msg_id: "m1".into(),
            sender_id: UserId::new(1),
            content: "hi".into(),
            ..ChatPayload::default()
        };
        let Ok(frame) = OutboundEnvelope::new(MessageType::Chat, &chat, None).to_frame() else {
            panic!("encode failed");
        };
        assert!(!frame.contains("receiver_id"));
        assert!(!frame.contains("group_id"));
        assert!(!frame.contains("trace_id"));
        assert!(frame.starts_with(r#"{"type":"chat""#));
    }

    #[test]
    fn ack_status_is_numeric() {
        let ack = AckPayload {
            msg_id: "m1".into(),
            status: AckStatus::Sent,
        };
        let Ok(frame) = OutboundEnvelope::new(MessageType::Ack, &ack, Some("t")).to_frame() else {
            panic!("encode failed");
        };
        assert_eq!(
            &*frame,
            r#"{"type":"ack","data":{"msg_id":"m1","status":1},"trace_id":"t"}"#
        );
        assert!(serde_json::from_str::<AckPayload>(r#"{"msg_id":"m","status":4}"#).is_err());
    }

    #[test]
    fn relation_changed_type_name() {
        let Ok(json) = serde_json::to_string(&MessageType::RelationChanged) else {
            panic!("encode failed");
        };
        assert_eq!(json, r#""relation_changed""#);
    }

    #[test]
    fn payload_validation() {
        let read = ReadPayload {
            conversation_id: "c".into(),
            msg_ids: Vec::new(),
        };
        assert!(read.validate().is_err());
        let typing = TypingPayload {
            conversation_id: " ".into(),
            is_typing: true,
        };
        assert!(typing.validate().is_err());
        let ack = AckPayload {
            msg_id: "m".into(),
            status: AckStatus::Read,
        };
        assert!(ack.validate().is_ok());
    }
}
