//! Relationship-change events published by the relation service.
//!
//! The relation service appends a [`RelationEvent`] to the durable log each
//! time a friendship or block changes. The gateway never produces these; it
//! only consumes them through the [`crate::service::EventBridge`] and turns
//! them into `relation_changed` notifications for the affected users.

use serde::{Deserialize, Serialize};

use super::UserId;

/// Which relationship the event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationKind {
    /// A block was placed or lifted.
    Block,
    /// A friendship was accepted or deleted.
    Friend,
    /// Any kind this gateway does not know about. Ignored by the bridge.
    #[serde(other)]
    Other,
}

impl RelationKind {
    /// Returns the kind as it appears on the wire.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Block => "block",
            Self::Friend => "friend",
            Self::Other => "other",
        }
    }
}

/// What happened to the relationship.
///
/// Actions this gateway does not know are kept verbatim and forwarded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationAction {
    /// `user_id` blocked `peer_id`.
    Blocked,
    /// `user_id` lifted a block on `peer_id`.
    Unblocked,
    /// The friendship was removed.
    Deleted,
    /// A friend request was accepted.
    Accepted,
    /// Any other action, as sent by the relation service.
    #[serde(untagged)]
    Other(String),
}

/// One relationship change as read from the durable log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationEvent {
    /// Relationship kind.
    #[serde(rename = "type")]
    pub kind: RelationKind,
    /// The user who initiated the change.
    pub user_id: UserId,
    /// The other party.
    pub peer_id: UserId,
    /// The change itself.
    pub action: RelationAction,
    /// Correlation id carried through to the notification envelope.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl RelationEvent {
    /// Users whose live sessions must be told about this event.
    ///
    /// A block only concerns the peer: the blocker already knows. A friend
    /// change concerns both sides.
    #[must_use]
    pub fn recipients(&self) -> Vec<UserId> {
        match self.kind {
            RelationKind::Block => vec![self.peer_id],
            RelationKind::Friend => vec![self.user_id, self.peer_id],
            RelationKind::Other => Vec::new(),
        }
    }
}
