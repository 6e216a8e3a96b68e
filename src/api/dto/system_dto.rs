//! Operational endpoint payloads.

use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

/// Liveness probe response.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// `"ok"` while accepting sessions, `"draining"` during shutdown.
    pub status: String,
    /// RFC 3339 server time.
    pub timestamp: String,
    /// Crate version.
    pub version: String,
}

/// Connection statistics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, ToSchema)]
pub struct StatsResponse {
    /// Users with at least one live session.
    pub online_users: usize,
    /// Live sessions across all users.
    pub total_connections: usize,
}

/// Query for the development token endpoint.
#[derive(Debug, Clone, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct TokenQuery {
    /// User the token is issued for.
    pub user_id: i64,
    /// Display name embedded in the claims.
    #[serde(default)]
    pub username: Option<String>,
}

/// Issued development token.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    /// Signed bearer token.
    pub token: String,
    /// User the token is valid for.
    pub user_id: i64,
}
