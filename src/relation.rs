//! Friend/block policy consulted before direct-message delivery.
//!
//! [`RelationChecker`] is the seam to the relation service's store. The
//! router asks two questions per direct message: are the parties friends,
//! and has either blocked the other. Both answers may fail when the store is
//! unreachable; what happens then is decided by [`RelationFallback`], never
//! by the checker itself.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::domain::UserId;
use crate::error::GatewayError;

/// Block state between a sender and a receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockStatus {
    /// The sender has blocked the receiver.
    pub sender_blocked: bool,
    /// The receiver has blocked the sender.
    pub receiver_blocked: bool,
}

impl BlockStatus {
    /// Returns `true` if either side has blocked the other.
    #[must_use]
    pub const fn any(self) -> bool {
        self.sender_blocked || self.receiver_blocked
    }
}

/// Read access to friendships and blocks.
#[async_trait]
pub trait RelationChecker: Send + Sync + fmt::Debug {
    /// Returns `true` if `user` has `friend` in their friend list.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RelationUnavailable`] if the store cannot be
    /// queried.
    async fn is_friend(&self, user: UserId, friend: UserId) -> Result<bool, GatewayError>;

    /// Returns the block state between `sender` and `receiver`.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::RelationUnavailable`] if the store cannot be
    /// queried.
    async fn block_status(
        &self,
        sender: UserId,
        receiver: UserId,
    ) -> Result<BlockStatus, GatewayError>;
}

/// What the router does when the relation store cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RelationFallback {
    /// Refuse the message with a 503 error (fail-closed).
    #[default]
    Deny,
    /// Treat the parties as unblocked friends (fail-open).
    Allow,
}

impl FromStr for RelationFallback {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "deny" | "closed" => Ok(Self::Deny),
            "allow" | "open" => Ok(Self::Allow),
            other => Err(format!("unknown relation fallback: {other}")),
        }
    }
}

/// Relation store held in memory.
///
/// Used by tests and by single-node deployments without a database. It can
/// be switched unavailable to exercise the fallback policy.
#[derive(Debug, Default)]
pub struct MemoryRelations {
    friends: RwLock<HashSet<(UserId, UserId)>>,
    blocks: RwLock<HashSet<(UserId, UserId)>>,
    unavailable: AtomicBool,
}

impl MemoryRelations {
    /// Creates an empty store: nobody is friends with anybody.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a mutual friendship.
    pub fn befriend(&self, a: UserId, b: UserId) {
        let mut friends = self.friends.write();
        friends.insert((a, b));
        friends.insert((b, a));
    }

    /// Removes a mutual friendship.
    pub fn unfriend(&self, a: UserId, b: UserId) {
        let mut friends = self.friends.write();
        friends.remove(&(a, b));
        friends.remove(&(b, a));
    }

    /// Records that `blocker` blocked `blocked`.
    pub fn block(&self, blocker: UserId, blocked: UserId) {
        self.blocks.write().insert((blocker, blocked));
    }

    /// Lifts a block.
    pub fn unblock(&self, blocker: UserId, blocked: UserId) {
        self.blocks.write().remove(&(blocker, blocked));
    }

    /// Makes every query fail (or succeed again).
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    fn check_available(&self) -> Result<(), GatewayError> {
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(GatewayError::RelationUnavailable(
                "in-memory relation store switched off".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl RelationChecker for MemoryRelations {
    async fn is_friend(&self, user: UserId, friend: UserId) -> Result<bool, GatewayError> {
        self.check_available()?;
        Ok(self.friends.read().contains(&(user, friend)))
    }

    async fn block_status(
        &self,
        sender: UserId,
        receiver: UserId,
    ) -> Result<BlockStatus, GatewayError> {
        self.check_available()?;
        let blocks = self.blocks.read();
        Ok(BlockStatus {
            sender_blocked: blocks.contains(&(sender, receiver)),
            receiver_blocked: blocks.contains(&(receiver, sender)),
        })
    }
}

/// Checker that treats everyone as unblocked friends.
///
/// Only used when persistence is disabled and there is no relation store to
/// consult; startup logs a warning when it is selected.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenRelations;

#[async_trait]
impl RelationChecker for OpenRelations {
    async fn is_friend(&self, _user: UserId, _friend: UserId) -> Result<bool, GatewayError> {
        Ok(true)
    }

    async fn block_status(
        &self,
        _sender: UserId,
        _receiver: UserId,
    ) -> Result<BlockStatus, GatewayError> {
        Ok(BlockStatus::default())
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    const A: UserId = UserId::new(1);
    const B: UserId = UserId::new(2);

    #[tokio::test]
    async fn friendship_is_mutual() {
        let store = MemoryRelations::new();
        assert_eq!(store.is_friend(A, B).await.ok(), Some(false));
        store.befriend(A, B);
        assert_eq!(store.is_friend(A, B).await.ok(), Some(true));
        assert_eq!(store.is_friend(B, A).await.ok(), Some(true));
        store.unfriend(B, A);
        assert_eq!(store.is_friend(A, B).await.ok(), Some(false));
    }

    #[tokio::test]
    async fn block_status_is_directional() {
        let store = MemoryRelations::new();
        store.block(B, A);
        let Ok(status) = store.block_status(A, B).await else {
            panic!("store should be available");
        };
        assert!(!status.sender_blocked);
        assert!(status.receiver_blocked);
        assert!(status.any());

        store.unblock(B, A);
        assert_eq!(store.block_status(A, B).await.ok(), Some(BlockStatus::default()));
    }

    #[tokio::test]
    async fn unavailable_store_errors() {
        let store = MemoryRelations::new();
        store.set_unavailable(true);
        assert!(matches!(
            store.is_friend(A, B).await,
            Err(GatewayError::RelationUnavailable(_))
        ));
        assert!(store.block_status(A, B).await.is_err());
    }

    #[tokio::test]
    async fn open_relations_allow_everything() {
        assert_eq!(OpenRelations.is_friend(A, B).await.ok(), Some(true));
        assert_eq!(OpenRelations.block_status(A, B).await.ok(), Some(BlockStatus::default()));
    }

    #[test]
    fn fallback_parses() {
        assert_eq!("deny".parse::<RelationFallback>().ok(), Some(RelationFallback::Deny));
        assert_eq!("OPEN".parse::<RelationFallback>().ok(), Some(RelationFallback::Allow));
        assert!("maybe".parse::<RelationFallback>().is_err());
        assert_eq!(RelationFallback::default(), RelationFallback::Deny);
    }
}
