//! RFC 7807 problem responses.

use axum::Json;
use axum::http::StatusCode;
use axum::http::header::CONTENT_TYPE;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            [(CONTENT_TYPE, "application/problem+json")],
            Json(self),
        )
            .into_response()
    }
}

fn problem(status: StatusCode, detail: impl Into<String>) -> ProblemDetails {
    ProblemDetails {
        problem_type: "about:blank".to_string(),
        title: status.canonical_reason().unwrap_or("Error").to_string(),
        status: status.as_u16(),
        detail: Some(detail.into()),
    }
}

pub fn bad_request(detail: impl Into<String>) -> ProblemDetails {
    problem(StatusCode::BAD_REQUEST, detail)
}

pub fn internal_error(detail: impl Into<String>) -> ProblemDetails {
    problem(StatusCode::INTERNAL_SERVER_ERROR, detail)
}
