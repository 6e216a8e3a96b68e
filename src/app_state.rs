//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, JwtAuthenticator};
use crate::config::SessionSettings;
use crate::domain::Registry;
use crate::service::MessageRouter;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Connection registry; also backs the stats endpoint.
    pub registry: Registry,
    /// Verifies handshake tokens.
    pub authenticator: Arc<dyn Authenticator>,
    /// Handles frames read from every session.
    pub router: Arc<MessageRouter>,
    /// Per-session limits and keepalive windows.
    pub session: SessionSettings,
    /// Cancelled once shutdown begins; upgrades are refused afterwards.
    pub draining: CancellationToken,
    /// Token issuer for the development endpoint, when enabled.
    pub token_issuer: Option<Arc<JwtAuthenticator>>,
}

impl AppState {
    /// Returns `true` while new sessions are being accepted.
    #[must_use]
    pub fn is_accepting(&self) -> bool {
        !self.draining.is_cancelled()
    }
}
