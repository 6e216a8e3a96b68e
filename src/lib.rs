//! # chat-gateway
//!
//! Real-time messaging gateway. Terminates authenticated WebSocket sessions,
//! routes chat between online users across all of their devices, gates
//! direct messages on friend/block relations, writes accepted messages to a
//! durable log, and pushes relation changes back to live sessions.
//!
//! ## Architecture
//!
//! ```text
//! Clients (WebSocket, HTTP)
//!     │
//!     ├── Upgrade handler (ws/) ── Authenticator
//!     ├── REST handlers (api/)
//!     │
//!     ├── Session read/write loops (ws/connection)
//!     │       │
//!     │       └── MessageRouter (service/) ── RelationChecker, LogProducer
//!     │
//!     ├── Registry actor (domain/)
//!     │
//!     └── EventBridge (service/) ── LogConsumer (relation events)
//! ```
//!
//! [`server::GatewayServer`] wires these together and owns shutdown.

pub mod api;
pub mod app_state;
pub mod auth;
pub mod config;
pub mod domain;
pub mod error;
pub mod persistence;
pub mod relation;
pub mod server;
pub mod service;
pub mod telemetry;
pub mod ws;
