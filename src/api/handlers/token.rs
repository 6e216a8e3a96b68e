//! Development token endpoint.
//!
//! Mounted only when `DEV_TOKEN_ENDPOINT` is set. Lets a local client obtain
//! a bearer token without running the user service.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};

use crate::api::dto::{TokenQuery, TokenResponse};
use crate::app_state::AppState;
use crate::domain::UserId;
use crate::error::GatewayError;

/// `GET /api/v1/test/token` — Issue a bearer token for any user.
///
/// # Errors
///
/// Returns [`GatewayError::InvalidRequest`] for a non-positive `user_id` and
/// [`GatewayError::Internal`] if the endpoint is disabled or signing fails.
#[utoipa::path(
    get,
    path = "/api/v1/test/token",
    tag = "Development",
    summary = "Issue a test token",
    params(TokenQuery),
    responses(
        (status = 200, description = "Token issued", body = TokenResponse),
        (status = 400, description = "Invalid user id", body = crate::error::ErrorResponse),
    )
)]
pub async fn issue_token_handler(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<TokenResponse>, GatewayError> {
    let Some(issuer) = state.token_issuer.as_ref() else {
        return Err(GatewayError::Internal("token endpoint disabled".to_string()));
    };
    let user_id = UserId::new(query.user_id);
    if !user_id.is_set() {
        return Err(GatewayError::InvalidRequest("user_id must be positive".to_string()));
    }
    let username = query.username.unwrap_or_else(|| format!("user{user_id}"));
    let token = issuer.issue(user_id, &username)?;
    tracing::info!(%user_id, "development token issued");
    Ok(Json(TokenResponse {
        token,
        user_id: user_id.get(),
    }))
}

/// Development routes, nested under `/api/v1`.
pub fn routes() -> Router<AppState> {
    Router::new().route("/test/token", get(issue_token_handler))
}
