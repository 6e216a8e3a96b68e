//! OpenAPI document and its routes.

use axum::Router;
use utoipa::OpenApi;

use crate::api::dto::{HealthResponse, StatsResponse, TokenResponse};
use crate::api::handlers::{system, token};
use crate::error::{ErrorBody, ErrorResponse};

/// OpenAPI description of the operational surface and the upgrade endpoint.
#[derive(Debug, OpenApi)]
#[openapi(
    info(
        title = "chat-gateway",
        description = "Real-time messaging gateway: WebSocket sessions, relation-gated delivery, durable-log bridging."
    ),
    paths(
        system::health_handler,
        system::stats_handler,
        token::issue_token_handler,
        crate::ws::handler::ws_handler,
    ),
    components(schemas(HealthResponse, StatsResponse, TokenResponse, ErrorResponse, ErrorBody)),
    tags(
        (name = "System", description = "Liveness and statistics"),
        (name = "Gateway", description = "WebSocket session upgrade"),
        (name = "Development", description = "Local testing helpers"),
    )
)]
pub struct ApiDoc;

/// Serves the document at `/api-docs/openapi.json` and Swagger UI at
/// `/swagger-ui`.
#[cfg(feature = "swagger-ui")]
pub fn mount(app: Router) -> Router {
    app.merge(
        utoipa_swagger_ui::SwaggerUi::new("/swagger-ui")
            .url("/api-docs/openapi.json", ApiDoc::openapi()),
    )
}

/// Serves the document at `/api-docs/openapi.json`.
#[cfg(not(feature = "swagger-ui"))]
pub fn mount(app: Router) -> Router {
    use axum::Json;
    use axum::routing::get;

    app.route(
        "/api-docs/openapi.json",
        get(|| async { Json(ApiDoc::openapi()) }),
    )
}
