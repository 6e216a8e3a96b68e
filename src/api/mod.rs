//! REST API layer: route handlers, DTOs, and router composition.
//!
//! Resource endpoints are mounted under `/api/v1`; `/health` sits at the
//! root for load balancers.

pub mod docs;
pub mod dto;
pub mod handlers;

use std::time::Duration;

use axum::Router;
use tower_http::timeout::TimeoutLayer;

use crate::app_state::AppState;

/// Upper bound on a single REST request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Builds the complete API router with all REST endpoints.
///
/// The development token route is included only when `dev_tokens` is set.
pub fn build_router(dev_tokens: bool) -> Router<AppState> {
    Router::new()
        .nest("/api/v1", handlers::routes(dev_tokens))
        .merge(handlers::system::routes())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use std::sync::Arc;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    use super::dto::{HealthResponse, StatsResponse, TokenResponse};
    use crate::auth::{Authenticator, JwtAuthenticator};
    use crate::config::GatewayConfig;
    use crate::domain::{Session, SessionIdentity, UserId};
    use crate::persistence::{LogProducer, MemoryLog};
    use crate::relation::MemoryRelations;
    use crate::server::{Collaborators, GatewayServer};

    fn server(dev_tokens: bool) -> GatewayServer {
        let jwt = Arc::new(JwtAuthenticator::new("secret", "chat-gateway", chrono::TimeDelta::hours(1)));
        GatewayServer::start(
            &GatewayConfig::default(),
            Collaborators {
                authenticator: Arc::clone(&jwt) as Arc<dyn Authenticator>,
                relations: Arc::new(MemoryRelations::new()),
                producer: Arc::new(MemoryLog::new("chat.messages")) as Arc<dyn LogProducer>,
                relation_feed: None,
                token_issuer: dev_tokens.then_some(jwt),
            },
        )
    }

    async fn get(app: axum::Router, uri: &str) -> (StatusCode, Vec<u8>) {
        let Ok(request) = Request::builder().uri(uri).body(Body::empty()) else {
            panic!("request should build");
        };
        let Ok(response) = app.oneshot(request).await else {
            panic!("router is infallible");
        };
        let status = response.status();
        let Ok(body) = to_bytes(response.into_body(), usize::MAX).await else {
            panic!("body should be readable");
        };
        (status, body.to_vec())
    }

    #[tokio::test]
    async fn health_reports_ok_then_draining() {
        let server = server(false);

        let (status, body) = get(server.router(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        let Ok(health) = serde_json::from_slice::<HealthResponse>(&body) else {
            panic!("health body should decode");
        };
        assert_eq!(health.status, "ok");

        server.shutdown().await;
        let (status, body) = get(server.router(), "/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(String::from_utf8_lossy(&body).contains("draining"));
    }

    #[tokio::test]
    async fn stats_reflect_registry() {
        let server = server(false);
        for user in [1, 1, 2] {
            let (session, _rx) = Session::new(SessionIdentity::new(UserId::new(user), None, None), 8);
            tokio_test::assert_ok!(server.registry().register(session).await);
        }
        // Any request/reply command is ordered after the registrations.
        let _ = server.registry().dispatch_to_user(UserId::new(i64::MAX), Arc::from("")).await;

        let (status, body) = get(server.router(), "/api/v1/stats").await;
        assert_eq!(status, StatusCode::OK);
        let Ok(stats) = serde_json::from_slice::<StatsResponse>(&body) else {
            panic!("stats body should decode");
        };
        assert_eq!(stats.online_users, 2);
        assert_eq!(stats.total_connections, 3);
    }

    #[tokio::test]
    async fn dev_token_route_is_opt_in() {
        let (status, _) = get(server(false).router(), "/api/v1/test/token?user_id=7").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let dev = server(true);
        let (status, body) = get(dev.router(), "/api/v1/test/token?user_id=7&username=bob").await;
        assert_eq!(status, StatusCode::OK);
        let Ok(issued) = serde_json::from_slice::<TokenResponse>(&body) else {
            panic!("token body should decode");
        };
        assert_eq!(issued.user_id, 7);
        let verified = dev.state().authenticator.verify(&issued.token);
        assert!(matches!(verified, Ok(id) if id == UserId::new(7)));

        let (status, _) = get(dev.router(), "/api/v1/test/token?user_id=0").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn openapi_document_is_served() {
        let (status, body) = get(server(false).router(), "/api-docs/openapi.json").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("/api/v1/stats"));
    }
}
