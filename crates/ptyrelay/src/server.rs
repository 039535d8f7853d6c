//! Router and shared state.

use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use tower_http::timeout::TimeoutLayer;

use crate::handlers;
use crate::invoke::{self, INVOKE_PATH, Invocations};
use crate::terminal::{self, Terminals};

// ============================================================================
// AppState
// ============================================================================

#[derive(Clone)]
pub struct AppState {
    pub terminals: Terminals,
    pub invocations: Invocations,
    /// Prefix in front of every terminal socket path. Empty or `/something`.
    pub base_path: String,
}

// ============================================================================
// Server Setup
// ============================================================================

pub fn build_app(state: AppState, request_timeout_seconds: u64) -> Router {
    // Plain HTTP routes - with request timeout
    let http_routes = Router::new()
        .route("/livez", get(handlers::livez))
        .route("/readyz", get(handlers::readyz))
        .route("/version", get(handlers::version))
        .route(INVOKE_PATH, post(invoke::invoke).put(invoke::cancel))
        .with_state(state.clone())
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(request_timeout_seconds),
        ));

    // Terminal sockets live under arbitrary context paths, so they are
    // matched in the fallback. Long-lived, no timeout.
    Router::new()
        .merge(http_routes)
        .fallback(terminal::socket_handler)
        .with_state(state)
}
