//! Service layer: message routing and relation-event propagation.
//!
//! [`MessageRouter`] handles frames read from client sessions;
//! [`EventBridge`] handles relation events read from the durable log. Both
//! deliver through the [`crate::domain::Registry`].

pub mod event_bridge;
pub mod message_router;

pub use event_bridge::EventBridge;
pub use message_router::MessageRouter;
