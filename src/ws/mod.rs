//! WebSocket layer: upgrade handling, session loops, wire messages.
//!
//! The endpoint at `/ws` upgrades an authenticated request into a session
//! whose read and write loops live in [`connection`].

pub mod connection;
pub mod handler;
pub mod messages;
