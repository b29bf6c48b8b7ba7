//! The 8 HTTP routes: health, the auth UI, the OAuth callback, status,
//! export triggering, paginated listing (JSON + HTML), and downloads.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Path as AxumPath, Query, State},
    http::header,
    response::{Html, IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use trakt_export_lib::{
    export_registry::ExportStatus,
    orchestrator::{Mode, RunOutcome},
    transformer,
};

use crate::{
    errors::{ApiError, HtmlError},
    middleware::issue_csrf_token,
    state::AppState,
    templates,
};

pub async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

pub async fn auth_url(State(state): State<Arc<AppState>>) -> Result<Html<String>, HtmlError> {
    let url = state.oauth.build_authorization_url();
    let rendered = state
        .templates
        .render(templates::AUTH_URL_TEMPLATE, &json!({"authorization_url": url}))
        .map_err(|e| trakt_export_lib::errors::TraktExportError::Internal(e.to_string()))?;
    Ok(Html(rendered))
}

#[derive(Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallbackParams>,
) -> Html<String> {
    let render = |success: bool, error: String| {
        state
            .templates
            .render(
                templates::CALLBACK_TEMPLATE,
                &json!({"success": success, "error": error}),
            )
            .unwrap_or_else(|_| "<html><body>callback error</body></html>".to_string())
    };

    if let Some(error) = params.error {
        let description = params.error_description.unwrap_or(error);
        return Html(render(false, description));
    }

    let (Some(code), Some(csrf_state)) = (params.code, params.state) else {
        return Html(render(false, "missing code or state".to_string()));
    };

    if let Err(e) = state.oauth.validate_state(&csrf_state) {
        return Html(render(false, e.to_string()));
    }

    match state.oauth.exchange_code(&code).await {
        Ok(token) => match state.token_manager.store(token).await {
            Ok(()) => Html(render(true, String::new())),
            Err(e) => Html(render(false, e.to_string())),
        },
        Err(e) => Html(render(false, e.to_string())),
    }
}

pub async fn status(State(state): State<Arc<AppState>>) -> Result<Response, HtmlError> {
    let token_status = state.token_manager.status().await;
    let run_status = state.export_run.status.lock().await.clone();
    let (csrf_token, csrf_cookie) = issue_csrf_token(&state).await;

    let rendered = state
        .templates
        .render(
            templates::STATUS_TEMPLATE,
            &json!({
                "authenticated": token_status.is_valid,
                "running": run_status.phase == crate::state::ExportRunPhase::Running,
                "mode": run_status.mode,
                "message": run_status.message,
                "uptime_seconds": state.started_at.elapsed().as_secs(),
                "csrf_token": csrf_token,
            }),
        )
        .map_err(|e| trakt_export_lib::errors::TraktExportError::Internal(e.to_string()))?;

    let mut response = Html(rendered).into_response();
    response.headers_mut().insert(header::SET_COOKIE, csrf_cookie);
    Ok(response)
}

#[derive(Deserialize)]
pub struct ExportParams {
    #[serde(rename = "type", default = "default_mode")]
    mode: String,
    #[serde(default)]
    history_mode: Option<String>,
}

fn default_mode() -> String {
    "normal".to_string()
}

#[derive(Serialize)]
struct ExportAccepted {
    mode: String,
}

pub async fn trigger_export(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ExportParams>,
) -> Result<Json<ExportAccepted>, ApiError> {
    let mode: Mode = params.mode.parse()?;
    let history_mode = match params.history_mode {
        Some(raw) => raw.parse()?,
        None => state.history_mode,
    };

    if !state.export_run.try_start(&params.mode) {
        return Err(trakt_export_lib::errors::TraktExportError::Conflict(
            "an export is already running".to_string(),
        )
        .into());
    }

    // Fail fast with a synchronous error if we can't even get a token before
    // spawning; the orchestrator re-derives (and force-refreshes) its own
    // access secret internally once the run is underway.
    if let Err(e) = state.token_manager.valid_access_secret().await {
        state.export_run.finish(false, Some(e.to_string())).await;
        return Err(e.into());
    }

    let state_for_task = state.clone();
    tokio::spawn(async move {
        run_export_in_background(state_for_task, mode, history_mode).await;
    });

    Ok(Json(ExportAccepted { mode: params.mode }))
}

async fn run_export_in_background(
    state: Arc<AppState>,
    mode: Mode,
    history_mode: trakt_export_lib::config::HistoryMode,
) {
    let started_at = std::time::Instant::now();
    let orchestrator = state.build_orchestrator();
    let outcome = orchestrator.run(mode, None).await;

    let backup_dir = match &outcome {
        Ok(RunOutcome::Succeeded(summary))
        | Ok(RunOutcome::PartialSuccess(summary))
        | Ok(RunOutcome::Failed(summary)) => Some(summary.backup_dir.clone()),
        Err(_) => None,
    };

    let result = match outcome {
        Ok(RunOutcome::Succeeded(summary)) | Ok(RunOutcome::PartialSuccess(summary)) => {
            finalize_export(&state, &summary.backup_dir, history_mode).await
        }
        Ok(RunOutcome::Failed(summary)) => Err(trakt_export_lib::errors::TraktExportError::FetchFailed {
            endpoint: "all".to_string(),
            source: format!("{}/{} endpoints failed", summary.failure_count, summary.total),
        }),
        Err(e) => Err(e),
    };

    if let Some(backup_dir) = backup_dir {
        let export_id = backup_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "export".to_string());
        let error_message = result.as_ref().err().map(|e| e.to_string());
        state
            .export_registry
            .record_outcome(&export_id, started_at.elapsed(), error_message)
            .await;
    }

    state.export_registry.invalidate().await;
    match result {
        Ok(()) => state.export_run.finish(true, None).await,
        Err(e) => {
            log::error!("background export failed: {e}");
            state.export_run.finish(false, Some(e.to_string())).await;
        }
    }
}

async fn finalize_export(
    state: &AppState,
    backup_dir: &std::path::Path,
    history_mode: trakt_export_lib::config::HistoryMode,
) -> trakt_export_lib::errors::Result<()> {
    let result = transformer::transform(backup_dir, &state.user, history_mode).await?;
    let export_id = backup_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "export".to_string());
    let output_path = state.export_dir.join(&export_id).join("letterboxd.csv");
    transformer::write_csv(&result.rows, &output_path).await?;
    if result.used_watched_only_fallback {
        log::warn!("export {export_id} fell back to watched-only rows (no history artifact)");
    }
    Ok(())
}

#[derive(Deserialize)]
pub struct ListParams {
    #[serde(default)]
    page: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(rename = "type", default)]
    export_type: Option<String>,
    #[serde(default)]
    status: Option<String>,
}

fn parse_status(raw: &str) -> Option<ExportStatus> {
    match raw.to_ascii_lowercase().as_str() {
        "completed" => Some(ExportStatus::Completed),
        "failed" => Some(ExportStatus::Failed),
        "in_progress" | "inprogress" => Some(ExportStatus::InProgress),
        _ => None,
    }
}

#[derive(Serialize)]
struct JsonExportItem {
    id: String,
    export_type: String,
    date: String,
    status: &'static str,
    files: Vec<String>,
    record_count: u64,
    file_size_bytes: u64,
    duration_seconds: Option<u64>,
    error: Option<String>,
}

fn status_label(status: ExportStatus) -> &'static str {
    match status {
        ExportStatus::Completed => "completed",
        ExportStatus::Failed => "failed",
        ExportStatus::InProgress => "in_progress",
    }
}

#[derive(Serialize)]
struct JsonPage {
    items: Vec<JsonExportItem>,
    page: usize,
    size: usize,
    total: usize,
    total_pages: usize,
    has_prev: bool,
    has_next: bool,
}

pub async fn list_exports_json(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Json<JsonPage>, ApiError> {
    let status = params.status.as_deref().and_then(parse_status);
    let page = state
        .export_registry
        .list_page(
            params.page.unwrap_or(1),
            params.limit.unwrap_or(trakt_export_lib::export_registry::MAX_PAGE_SIZE),
            params.export_type.as_deref(),
            status,
        )
        .await?;

    Ok(Json(JsonPage {
        items: page
            .items
            .into_iter()
            .map(|item| JsonExportItem {
                id: item.id,
                export_type: item.export_type,
                date: item.date.to_rfc3339(),
                status: status_label(item.status),
                files: item.files,
                record_count: item.record_count,
                file_size_bytes: item.file_size_bytes,
                duration_seconds: item.duration.map(|d| d.as_secs()),
                error: item.error,
            })
            .collect(),
        page: page.page,
        size: page.size,
        total: page.total,
        total_pages: page.total_pages,
        has_prev: page.has_prev,
        has_next: page.has_next,
    }))
}

pub async fn list_exports_html(
    State(state): State<Arc<AppState>>,
    Query(params): Query<ListParams>,
) -> Result<Html<String>, HtmlError> {
    let status = params.status.as_deref().and_then(parse_status);
    let page = state
        .export_registry
        .list_page(
            params.page.unwrap_or(1),
            params.limit.unwrap_or(20),
            params.export_type.as_deref(),
            status,
        )
        .await?;

    let items: Vec<serde_json::Value> = page
        .items
        .iter()
        .map(|item| {
            json!({
                "id": item.id,
                "export_type": item.export_type,
                "date": item.date.to_rfc3339(),
                "status": status_label(item.status),
                "record_count": item.record_count,
                "files": item.files,
                "duration_seconds": item.duration.map(|d| d.as_secs()),
                "error": item.error,
            })
        })
        .collect();

    let rendered = state
        .templates
        .render(
            templates::EXPORTS_TEMPLATE,
            &json!({
                "items": items,
                "page": page.page,
                "total_pages": page.total_pages,
                "has_prev": page.has_prev,
                "has_next": page.has_next,
                "prev_page": page.page.saturating_sub(1).max(1),
                "next_page": page.page + 1,
            }),
        )
        .map_err(|e| trakt_export_lib::errors::TraktExportError::Internal(e.to_string()))?;
    Ok(Html(rendered))
}

pub async fn download(
    State(state): State<Arc<AppState>>,
    AxumPath((id, file)): AxumPath<(String, String)>,
) -> Result<Response, ApiError> {
    let path = state.export_registry.resolve_download(&id, &file)?;
    let opened = File::open(&path)
        .await
        .map_err(trakt_export_lib::errors::TraktExportError::from)?;
    let stream = ReaderStream::new(opened);
    let body = Body::from_stream(stream);

    let response = Response::builder()
        .header(header::CONTENT_TYPE, "text/csv")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{file}\""),
        )
        .body(body)
        .map_err(|e| trakt_export_lib::errors::TraktExportError::Internal(e.to_string()))?;
    Ok(response)
}
