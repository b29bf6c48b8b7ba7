//! Maps core errors onto HTTP responses. Two shapes: JSON for `/api/*` and
//! other machine routes, contextual HTML for browser-facing routes.

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
    Json,
};
use serde::Serialize;
use serde_json::Value;
use trakt_export_lib::errors::TraktExportError;

fn status_for(error: &TraktExportError) -> StatusCode {
    match error {
        TraktExportError::Unauthenticated | TraktExportError::RefreshRequired => {
            StatusCode::UNAUTHORIZED
        }
        TraktExportError::StateMismatch => StatusCode::FORBIDDEN,
        TraktExportError::Forbidden(_) => StatusCode::FORBIDDEN,
        TraktExportError::BadRequest(_) => StatusCode::BAD_REQUEST,
        TraktExportError::NotFound(_) => StatusCode::NOT_FOUND,
        TraktExportError::Conflict(_) => StatusCode::CONFLICT,
        TraktExportError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        TraktExportError::RefreshFailed(_)
        | TraktExportError::FetchFailed { .. }
        | TraktExportError::PartialSuccess { .. }
        | TraktExportError::ParseFailure(_)
        | TraktExportError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn kind_for(error: &TraktExportError) -> &'static str {
    match error {
        TraktExportError::Unauthenticated => "unauthenticated",
        TraktExportError::RefreshRequired => "refresh_required",
        TraktExportError::RefreshFailed(_) => "refresh_failed",
        TraktExportError::StateMismatch => "state_mismatch",
        TraktExportError::BadRequest(_) => "bad_request",
        TraktExportError::FetchFailed { .. } => "fetch_failed",
        TraktExportError::PartialSuccess { .. } => "partial_success",
        TraktExportError::ParseFailure(_) => "parse_failure",
        TraktExportError::PermissionDenied(_) => "permission_denied",
        TraktExportError::NotFound(_) => "not_found",
        TraktExportError::Conflict(_) => "conflict",
        TraktExportError::Forbidden(_) => "forbidden",
        TraktExportError::Internal(_) => "internal",
    }
}

fn details_for(error: &TraktExportError) -> Value {
    match error {
        TraktExportError::FetchFailed { endpoint, .. } => serde_json::json!({"endpoint": endpoint}),
        TraktExportError::PartialSuccess {
            success_count,
            failure_count,
            total,
        } => serde_json::json!({
            "success_count": success_count,
            "failure_count": failure_count,
            "total": total,
        }),
        _ => Value::Null,
    }
}

#[derive(Serialize)]
struct JsonErrorBody {
    error: &'static str,
    message: String,
    details: Value,
}

/// JSON-shaped error response for `/api/*` and other machine routes.
pub struct ApiError(pub TraktExportError);

impl From<TraktExportError> for ApiError {
    fn from(e: TraktExportError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            log::error!("internal error: {}", self.0);
        }
        let body = JsonErrorBody {
            error: kind_for(&self.0),
            message: self.0.to_string(),
            details: details_for(&self.0),
        };
        (status, Json(body)).into_response()
    }
}

/// HTML-shaped error response for browser-facing routes: a redirect to
/// `/auth-url` for authentication errors, a rendered alert otherwise.
pub struct HtmlError(pub TraktExportError);

impl From<TraktExportError> for HtmlError {
    fn from(e: TraktExportError) -> Self {
        Self(e)
    }
}

impl IntoResponse for HtmlError {
    fn into_response(self) -> Response {
        match &self.0 {
            TraktExportError::Unauthenticated | TraktExportError::RefreshRequired => {
                Redirect::to("/auth-url").into_response()
            }
            other => {
                let status = status_for(other);
                if status.is_server_error() {
                    log::error!("internal error: {other}");
                }
                let body = format!(
                    "<html><body><div class=\"alert alert-{}\">{}</div></body></html>",
                    kind_for(other),
                    html_escape(&other.to_string())
                );
                (status, Html(body)).into_response()
            }
        }
    }
}

fn html_escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}
