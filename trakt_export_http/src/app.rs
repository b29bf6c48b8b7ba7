//! Router construction: route table, CORS/security-header/access-log
//! layering, the CSRF guard scoped to the one unsafe route, and the
//! `serve()` entry point with graceful shutdown.

use std::sync::Arc;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::{
    middleware::{access_log, request_timeout, require_csrf_token, security_headers},
    routes,
    state::AppState,
};

pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let export_route = Router::new()
        .route("/api/export", post(routes::trigger_export))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_csrf_token,
        ));

    Router::new()
        .route("/health", get(routes::health))
        .route("/auth-url", get(routes::auth_url))
        .route("/callback", get(routes::callback))
        .route("/status", get(routes::status))
        .route("/api/exports", get(routes::list_exports_json))
        .route("/exports", get(routes::list_exports_html))
        .route("/download/{id}/{file}", get(routes::download))
        .merge(export_route)
        .layer(axum_middleware::from_fn(security_headers))
        .layer(axum_middleware::from_fn(access_log))
        .layer(axum_middleware::from_fn(request_timeout))
        .layer(cors)
        .with_state(state)
}

/// Binds `127.0.0.1:<http_port>` and serves until a `SIGINT`/`SIGTERM`
/// (or, on non-unix targets, just `ctrl_c`) arrives.
pub async fn serve(state: Arc<AppState>) -> anyhow::Result<()> {
    let port = state.config.http_port;
    let router = build_router(state);
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port)).await?;
    log::info!("listening on http://127.0.0.1:{port}");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let mut signal = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        signal.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    log::info!("shutdown signal received, draining connections");
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;
    use trakt_export_lib::config::Config;

    #[tokio::test]
    async fn health_route_returns_ok_without_auth() {
        let state = AppState::new(Config::for_test());
        let router = build_router(state);

        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[tokio::test]
    async fn export_trigger_without_csrf_token_is_forbidden() {
        let state = AppState::new(Config::for_test());
        let router = build_router(state);

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/export")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::FORBIDDEN);
    }

    async fn issued_csrf_token(router: Router) -> String {
        let response = router
            .oneshot(Request::builder().uri("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let cookie = response
            .headers()
            .get(axum::http::header::SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap();
        cookie
            .split(';')
            .next()
            .and_then(|kv| kv.split_once('='))
            .map(|(_, v)| v.to_string())
            .unwrap()
    }

    #[tokio::test]
    async fn export_trigger_with_mismatched_cookie_and_form_token_is_forbidden() {
        let state = AppState::new(Config::for_test());
        let router = build_router(state);
        let token = issued_csrf_token(router.clone()).await;

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/export?type=normal")
                    .header(axum::http::header::COOKIE, format!("csrf_token={token}"))
                    .header(
                        axum::http::header::CONTENT_TYPE,
                        "application/x-www-form-urlencoded",
                    )
                    .body(Body::from("csrf_token=not-the-same-token"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn export_trigger_with_matching_cookie_and_form_token_passes_the_guard() {
        let state = AppState::new(Config::for_test());
        let router = build_router(state);
        let token = issued_csrf_token(router.clone()).await;

        let response = router
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/export?type=normal")
                    .header(axum::http::header::COOKIE, format!("csrf_token={token}"))
                    .header(
                        axum::http::header::CONTENT_TYPE,
                        "application/x-www-form-urlencoded",
                    )
                    .body(Body::from(format!("csrf_token={token}")))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_ne!(response.status(), axum::http::StatusCode::FORBIDDEN);
    }
}
