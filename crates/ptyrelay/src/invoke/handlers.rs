//! Invoke endpoint handlers.

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{info, warn};

use super::{CancelRequest, InvokeRequest, InvokeResponse};
use crate::handlers::problem_details;
use crate::server::AppState;

/// POST /servlet/http-invoker
pub async fn invoke(
    State(state): State<AppState>,
    payload: Result<Json<InvokeRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => {
            return problem_details::bad_request(rejection.body_text()).into_response();
        }
    };

    match state.invocations.start(request) {
        Ok(session_id) => (StatusCode::OK, Json(InvokeResponse { session_id })).into_response(),
        Err(e) if e.is_client_error() => problem_details::bad_request(e.to_string()).into_response(),
        Err(e) => {
            warn!(error = %e, "Invocation failed to start");
            problem_details::internal_error(e.to_string()).into_response()
        }
    }
}

/// PUT /servlet/http-invoker
pub async fn cancel(
    State(state): State<AppState>,
    payload: Result<Json<CancelRequest>, JsonRejection>,
) -> Response {
    let Json(request) = match payload {
        Ok(request) => request,
        Err(rejection) => {
            return problem_details::bad_request(rejection.body_text()).into_response();
        }
    };

    if state.invocations.cancel(&request.session_id) {
        info!(session_id = %request.session_id, "Cancel requested");
        StatusCode::OK.into_response()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}
