//! REST endpoint handlers organized by resource.

pub mod system;
pub mod token;

use axum::Router;
use axum::routing::get;

use crate::app_state::AppState;

/// Composes all resource routes under `/api/v1`.
pub fn routes(dev_tokens: bool) -> Router<AppState> {
    let router = Router::new().route("/stats", get(system::stats_handler));
    if dev_tokens {
        router.merge(token::routes())
    } else {
        router
    }
}
