//! Access logging, security headers, and the CSRF double-submit guard for
//! the one unsafe route (`POST /api/export`).

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use axum::{
    body::{to_bytes, Body},
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use rand::RngCore;

use crate::state::{AppState, CsrfEntry};

const CSRF_TOKEN_TTL_SECS: u64 = 86_400;
const CSRF_HEADER: &str = "x-csrf-token";
const CSRF_COOKIE: &str = "csrf_token";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_FORM_BODY_BYTES: usize = 16 * 1024;

/// Caps every request at the server's read/write timeout. Streamed
/// downloads are exempt in practice since `routes::download` finishes
/// building its response (and handing off the body stream) well inside
/// this window; only a stalled handler trips it.
pub async fn request_timeout(request: Request<Body>, next: Next) -> Response {
    match tokio::time::timeout(REQUEST_TIMEOUT, next.run(request)).await {
        Ok(response) => response,
        Err(_) => (StatusCode::REQUEST_TIMEOUT, "request timed out").into_response(),
    }
}

pub async fn access_log(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let started = Instant::now();
    let response = next.run(request).await;
    log::info!(
        "{method} {path} -> {} in {:?}",
        response.status(),
        started.elapsed()
    );
    response
}

pub async fn security_headers(request: Request<Body>, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        header::X_FRAME_OPTIONS,
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static("default-src 'self'"),
    );
    response
}

/// Mints a CSRF token, records it in `AppState::csrf_tokens`, and returns
/// both the token (for the page to embed as a hidden form field) and the
/// `Set-Cookie` value that must be attached to the response carrying that
/// page. The cookie is deliberately non-`HttpOnly`: the whole point of the
/// double-submit pattern is that the page can read it back.
pub async fn issue_csrf_token(state: &AppState) -> (String, HeaderValue) {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let token = URL_SAFE_NO_PAD.encode(bytes);

    let mut tokens = state.csrf_tokens.lock().await;
    tokens.retain(|_, entry: &mut CsrfEntry| {
        entry.issued_at.elapsed().as_secs() < CSRF_TOKEN_TTL_SECS
    });
    tokens.insert(
        token.clone(),
        CsrfEntry {
            issued_at: Instant::now(),
        },
    );
    drop(tokens);

    let cookie = HeaderValue::from_str(&format!("{CSRF_COOKIE}={token}; Path=/; SameSite=Strict"))
        .unwrap_or_else(|_| HeaderValue::from_static(""));
    (token, cookie)
}

fn cookie_value(raw: &str, name: &str) -> Option<String> {
    raw.split(';').find_map(|pair| {
        let (k, v) = pair.trim().split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

fn form_field(raw: &[u8], name: &str) -> Option<String> {
    std::str::from_utf8(raw).ok().and_then(|body| {
        body.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v.to_string())
    })
}

/// Double-submit guard: the request must carry a `csrf_token` cookie, and
/// that same value must also arrive independently as the `X-Csrf-Token`
/// header or (for the plain HTML form, which sends neither headers nor
/// query parameters) a `csrf_token` field in an
/// `application/x-www-form-urlencoded` body. A page can only have read the
/// cookie value and echoed it back if it actually loaded the cookie from
/// this origin, which is what defeats a cross-site form post. Only
/// `POST /api/export` is wrapped with this layer.
pub async fn require_csrf_token(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let cookie_token = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| cookie_value(raw, CSRF_COOKIE));

    let Some(cookie_token) = cookie_token else {
        return (StatusCode::FORBIDDEN, "missing csrf cookie").into_response();
    };

    let header_token = request
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let is_form = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));

    let (parts, body) = request.into_parts();
    let (submitted, body) = if let Some(token) = header_token {
        (Some(token), body)
    } else if is_form {
        match to_bytes(body, MAX_FORM_BODY_BYTES).await {
            Ok(bytes) => {
                let submitted = form_field(&bytes, CSRF_COOKIE);
                (submitted, Body::from(bytes))
            }
            Err(_) => (None, Body::empty()),
        }
    } else {
        (None, body)
    };

    let Some(submitted) = submitted else {
        return (StatusCode::FORBIDDEN, "missing csrf token").into_response();
    };
    if submitted != cookie_token {
        return (StatusCode::FORBIDDEN, "csrf token does not match cookie").into_response();
    }

    let mut tokens = state.csrf_tokens.lock().await;
    tokens.retain(|_, entry: &mut CsrfEntry| {
        entry.issued_at.elapsed().as_secs() < CSRF_TOKEN_TTL_SECS
    });
    let Some(_) = tokens.remove(&submitted) else {
        return (StatusCode::FORBIDDEN, "invalid or expired csrf token").into_response();
    };
    drop(tokens);

    let request = Request::from_parts(parts, body);
    next.run(request).await
}
