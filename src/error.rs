//! Gateway error types with HTTP status code mapping.
//!
//! [`GatewayError`] is the central error type for the gateway. Each variant
//! maps to a numeric code and an HTTP status. The same codes are reused in
//! `error` envelopes sent over the WebSocket, so a client sees `400` for a
//! malformed frame whether it arrived over HTTP or the socket.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use utoipa::ToSchema;

use crate::domain::UserId;

/// Structured JSON error response body.
///
/// All error responses follow this shape:
/// ```json
/// {
///   "error": {
///     "code": 401,
///     "message": "unauthorized: token required",
///     "details": null
///   }
/// }
/// ```
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    /// Structured error payload.
    pub error: ErrorBody,
}

/// Inner error body with numeric code and human-readable message.
#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    /// Numeric error code.
    pub code: u16,
    /// Human-readable error message.
    pub message: String,
    /// Optional additional details.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Server-side error enum with HTTP status code mapping.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing, malformed, or expired bearer credential.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Request or payload failed validation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// An inbound frame could not be decoded as an envelope.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    /// The target user has no registered session on this gateway.
    #[error("user {0} is not online")]
    UserNotOnline(UserId),

    /// The relation store could not answer a friend/block query.
    #[error("relation service unavailable: {0}")]
    RelationUnavailable(String),

    /// Durable log or database failure.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// The registry control loop has exited.
    #[error("connection registry is closed")]
    RegistryClosed,

    /// The gateway is draining and refuses new work.
    #[error("gateway is shutting down")]
    ShuttingDown,

    /// Internal server error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Returns the numeric error code for this variant.
    #[must_use]
    pub const fn error_code(&self) -> u16 {
        match self {
            Self::InvalidRequest(_) | Self::MalformedEnvelope(_) => 400,
            Self::Unauthorized(_) => 401,
            Self::UserNotOnline(_) => 404,
            Self::RelationUnavailable(_) | Self::ShuttingDown | Self::RegistryClosed => 503,
            Self::PersistenceError(_) | Self::Internal(_) => 500,
        }
    }

    /// Returns the HTTP status code for this variant.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) | Self::MalformedEnvelope(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::UserNotOnline(_) => StatusCode::NOT_FOUND,
            Self::RelationUnavailable(_) | Self::ShuttingDown | Self::RegistryClosed => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::PersistenceError(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        Self::PersistenceError(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: ErrorBody {
                code: self.error_code(),
                message: self.to_string(),
                details: None,
            },
        };
        let mut response = axum::Json(body).into_response();
        *response.status_mut() = status;
        response
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_statuses() {
        let cases = [
            GatewayError::Unauthorized("x".into()),
            GatewayError::InvalidRequest("x".into()),
            GatewayError::UserNotOnline(UserId::new(3)),
            GatewayError::RelationUnavailable("down".into()),
            GatewayError::ShuttingDown,
            GatewayError::Internal("x".into()),
        ];
        for err in cases {
            assert_eq!(err.error_code(), err.status_code().as_u16());
        }
    }

    #[test]
    fn malformed_json_converts() {
        let Err(json_err) = serde_json::from_str::<serde_json::Value>("{nope") else {
            panic!("expected a parse error");
        };
        let err = GatewayError::from(json_err);
        assert_eq!(err.error_code(), 400);
    }

    #[test]
    fn response_carries_status() {
        let resp = GatewayError::Unauthorized("token required".into()).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
