//! Axum WebSocket upgrade handler.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use utoipa::IntoParams;

use super::connection::run_session;
use crate::app_state::AppState;
use crate::domain::{Session, SessionIdentity};
use crate::error::GatewayError;

/// Query parameters accepted on the upgrade request.
#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct ConnectParams {
    /// Bearer token issued by the user service.
    #[serde(default)]
    pub token: String,
    /// Client device id; generated when absent.
    pub device_id: Option<String>,
    /// Client platform tag; `"web"` when absent.
    pub platform: Option<String>,
}

/// `GET /ws` — Upgrade an authenticated HTTP request to a chat session.
///
/// The token is verified before the upgrade, so a rejected client never
/// gets a session.
#[utoipa::path(
    get,
    path = "/ws",
    tag = "Gateway",
    summary = "Open a chat session",
    params(ConnectParams),
    responses(
        (status = 101, description = "Switching protocols"),
        (status = 401, description = "Missing or invalid token", body = crate::error::ErrorResponse),
        (status = 503, description = "Gateway is shutting down", body = crate::error::ErrorResponse),
    )
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    if !state.is_accepting() {
        return GatewayError::ShuttingDown.into_response();
    }
    let user_id = match state.authenticator.verify(&params.token) {
        Ok(user_id) => user_id,
        Err(e) => {
            tracing::debug!(error = %e, "upgrade rejected");
            return e.into_response();
        }
    };

    let identity = SessionIdentity::new(user_id, params.device_id, params.platform);
    let settings = state.session;
    ws.max_message_size(settings.max_message_size)
        .max_frame_size(settings.max_message_size)
        .on_upgrade(move |socket| async move {
            let (session, outbound) = Session::new(identity, settings.queue_capacity);
            if let Err(e) = state.registry.register(Arc::clone(&session)).await {
                tracing::warn!(user_id = %session.user_id(), error = %e, "session not registered");
                session.close();
                return;
            }
            tracing::info!(
                conn_id = %session.id(),
                user_id = %session.user_id(),
                device_id = session.device_id(),
                platform = session.platform(),
                "session opened"
            );
            run_session(
                socket,
                session,
                outbound,
                state.registry.clone(),
                Arc::clone(&state.router),
                settings,
            )
            .await;
        })
}
