//! Domain layer: identifiers, sessions, the connection registry, and
//! relationship events.
//!
//! This module holds the state that the socket loops, the router and the
//! event bridge coordinate on. Nothing here touches the network directly.

pub mod ids;
pub mod registry;
pub mod relation_event;
pub mod session;

pub use ids::{ConnectionId, UserId};
pub use registry::Registry;
pub use relation_event::{RelationAction, RelationEvent, RelationKind};
pub use session::{EnqueueError, Outbound, Session, SessionIdentity};
