//! C3: authorization-URL construction, CSRF state, code<->token exchange,
//! refresh call, and the transient localhost callback receiver.

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::Utc;
use log::{info, warn};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use rand::RngCore;
use reqwest::Client;
use serde::Serialize;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpListener,
    sync::oneshot,
};

use crate::{
    errors::{Result, TraktExportError},
    rate_limiter::RateLimiter,
    token::{AccessTokenResponse, Token},
    token_manager::TokenRefresher,
};

const RATE_LIMIT_KEY: &str = "auth";

/// How long a generated state is accepted for, independent of the
/// callback receiver's own 2s self-shutdown (the full HTTP server can hold
/// a pending state much longer than a CLI-driven transient listener does).
const STATE_TTL_SECONDS: u64 = 900;

const CALLBACK_RECEIVER_LIFETIME: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct OAuthCoordinator {
    client_id: String,
    client_secret: String,
    redirect_uri: String,
    api_base_url: String,
    http: Client,
    pending_states: Mutex<HashMap<String, Instant>>,
    rate_limiter: Arc<RateLimiter>,
}

impl OAuthCoordinator {
    pub fn new(
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        api_base_url: String,
    ) -> Self {
        Self::with_rate_limiter(
            client_id,
            client_secret,
            redirect_uri,
            api_base_url,
            Arc::new(RateLimiter::new()),
        )
    }

    /// Lets callers share a single `RateLimiter` (and its buckets) across an
    /// `OAuthCoordinator` and an `ApiClient`, since both draw against Trakt's
    /// published limits.
    pub fn with_rate_limiter(
        client_id: String,
        client_secret: String,
        redirect_uri: String,
        api_base_url: String,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builder should not fail with static config");
        Self {
            client_id,
            client_secret,
            redirect_uri,
            api_base_url,
            http,
            pending_states: Mutex::new(HashMap::new()),
            rate_limiter,
        }
    }

    fn generate_state() -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        URL_SAFE_NO_PAD.encode(bytes)
    }

    fn prune_expired(map: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        map.retain(|_, created| now.duration_since(*created).as_secs() < STATE_TTL_SECONDS);
    }

    /// Builds a fresh authorization URL, registering its CSRF state so a
    /// later `validate_state` call can recognize it.
    pub fn build_authorization_url(&self) -> String {
        let state = Self::generate_state();
        {
            let mut pending = self.pending_states.lock().expect("pending states poisoned");
            Self::prune_expired(&mut pending);
            pending.insert(state.clone(), Instant::now());
        }
        format!(
            "{}/oauth/authorize?response_type=code&client_id={}&redirect_uri={}&state={}",
            self.api_base_url,
            utf8_percent_encode(&self.client_id, NON_ALPHANUMERIC),
            utf8_percent_encode(&self.redirect_uri, NON_ALPHANUMERIC),
            state,
        )
    }

    /// Validates an incoming callback's `state` against the set of states
    /// this coordinator has issued. Constant-time compare against each
    /// candidate so timing does not leak how many characters matched.
    pub fn validate_state(&self, state: &str) -> Result<()> {
        let mut pending = self.pending_states.lock().expect("pending states poisoned");
        Self::prune_expired(&mut pending);
        let matched = pending.keys().find(|k| ct_eq(k, state)).cloned();
        match matched {
            Some(key) => {
                pending.remove(&key);
                Ok(())
            }
            None => Err(TraktExportError::StateMismatch),
        }
    }

    pub async fn exchange_code(&self, code: &str) -> Result<Token> {
        #[derive(Serialize)]
        struct ExchangeRequest<'a> {
            code: &'a str,
            client_id: &'a str,
            client_secret: &'a str,
            redirect_uri: &'a str,
            grant_type: &'static str,
        }

        self.rate_limiter.acquire(RATE_LIMIT_KEY).await;
        let issued_at = Utc::now();
        let response = self
            .http
            .post(format!("{}/oauth/token", self.api_base_url))
            .json(&ExchangeRequest {
                code,
                client_id: &self.client_id,
                client_secret: &self.client_secret,
                redirect_uri: &self.redirect_uri,
                grant_type: "authorization_code",
            })
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TraktExportError::RefreshFailed(format!(
                "authorization code exchange rejected with status {}",
                response.status()
            )));
        }

        let parsed: AccessTokenResponse = response.json().await?;
        Ok(parsed.into_token(issued_at))
    }

    /// Starts a transient HTTP listener on `port` with a single `/callback`
    /// route. Delivers the authorization code or a parsed error over the
    /// returned channels, serves a minimal HTML page, then shuts itself
    /// down roughly `CALLBACK_RECEIVER_LIFETIME` after it first responds.
    pub async fn start_local_callback_receiver(
        port: u16,
    ) -> Result<(String, oneshot::Receiver<String>, oneshot::Receiver<String>)> {
        let listener = TcpListener::bind(("127.0.0.1", port)).await?;
        let bound_port = listener.local_addr()?.port();
        let callback_url = format!("http://localhost:{bound_port}/callback");

        let (code_tx, code_rx) = oneshot::channel::<String>();
        let (error_tx, error_rx) = oneshot::channel::<String>();

        tokio::spawn(async move {
            let accept_result =
                tokio::time::timeout(Duration::from_secs(120), listener.accept()).await;
            let Ok(Ok((mut stream, _))) = accept_result else {
                let _ = error_tx.send("no callback connection received".to_string());
                return;
            };

            let mut buf = vec![0u8; 8192];
            let n = match stream.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    let _ = error_tx.send(format!("failed reading callback request: {e}"));
                    return;
                }
            };
            let request = String::from_utf8_lossy(&buf[..n]);
            let request_line = request.lines().next().unwrap_or_default();
            let path_and_query = request_line
                .split_whitespace()
                .nth(1)
                .unwrap_or("/callback");

            let params = parse_query(path_and_query);
            let (body, success) = if let Some(error) = params.get("error") {
                let description = params
                    .get("error_description")
                    .cloned()
                    .unwrap_or_else(|| error.clone());
                let _ = error_tx.send(description);
                ("<html><body><h1>Authorization failed</h1></body></html>", false)
            } else if let Some(code) = params.get("code") {
                let _ = code_tx.send(code.clone());
                ("<html><body><h1>Authorization complete, you may close this tab.</h1></body></html>", true)
            } else {
                let _ = error_tx.send("callback request carried neither code nor error".to_string());
                ("<html><body><h1>Malformed callback</h1></body></html>", false)
            };

            let status_line = if success { "HTTP/1.1 200 OK" } else { "HTTP/1.1 400 Bad Request" };
            let response = format!(
                "{status_line}\r\nContent-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = stream.shutdown().await;

            tokio::time::sleep(CALLBACK_RECEIVER_LIFETIME).await;
            info!("local oauth callback receiver shutting down");
        });

        Ok((callback_url, code_rx, error_rx))
    }
}

#[async_trait]
impl TokenRefresher for OAuthCoordinator {
    async fn refresh_token(&self, refresh_secret: &str) -> Result<Token> {
        #[derive(Serialize)]
        struct RefreshRequest<'a> {
            refresh_token: &'a str,
            client_id: &'a str,
            client_secret: &'a str,
            redirect_uri: &'a str,
            grant_type: &'static str,
        }

        self.rate_limiter.acquire(RATE_LIMIT_KEY).await;
        let issued_at = Utc::now();
        let response = self
            .http
            .post(format!("{}/oauth/token", self.api_base_url))
            .json(&RefreshRequest {
                refresh_token: refresh_secret,
                client_id: &self.client_id,
                client_secret: &self.client_secret,
                redirect_uri: &self.redirect_uri,
                grant_type: "refresh_token",
            })
            .send()
            .await?;

        if !response.status().is_success() {
            warn!("refresh token exchange rejected with status {}", response.status());
            return Err(TraktExportError::RefreshFailed(format!(
                "refresh rejected with status {}",
                response.status()
            )));
        }

        let parsed: AccessTokenResponse = response.json().await?;
        Ok(parsed.into_token(issued_at))
    }
}

/// Lets `TokenManager` hold a shared `OAuthCoordinator` while HTTP routes
/// keep their own handle to the same instance for authorization-URL and
/// callback handling.
#[async_trait]
impl TokenRefresher for std::sync::Arc<OAuthCoordinator> {
    async fn refresh_token(&self, refresh_secret: &str) -> Result<Token> {
        self.as_ref().refresh_token(refresh_secret).await
    }
}

fn ct_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn percent_decode(raw: &str) -> String {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .unwrap_or_else(|_| raw.to_string())
}

fn parse_query(path_and_query: &str) -> HashMap<String, String> {
    let query = path_and_query.split_once('?').map(|(_, q)| q).unwrap_or("");
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (percent_decode(k), percent_decode(v)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> OAuthCoordinator {
        OAuthCoordinator::new(
            "cid".to_string(),
            "csecret".to_string(),
            "http://localhost:8080/callback".to_string(),
            "https://api.trakt.tv".to_string(),
        )
    }

    #[test]
    fn authorization_url_contains_expected_query_params() {
        let coordinator = coordinator();
        let url = coordinator.build_authorization_url();
        assert!(url.contains("response_type=code"));
        assert!(url.contains("client_id=cid"));
        assert!(url.contains("redirect_uri=http%3A%2F%2Flocalhost%3A8080%2Fcallback"));
        let state = url.split("state=").nth(1).unwrap();
        assert!(state.len() >= 43);
    }

    #[test]
    fn validate_state_accepts_issued_state_once() {
        let coordinator = coordinator();
        let url = coordinator.build_authorization_url();
        let state = url.split("state=").nth(1).unwrap().to_string();
        coordinator.validate_state(&state).unwrap();
        let err = coordinator.validate_state(&state).unwrap_err();
        assert!(matches!(err, TraktExportError::StateMismatch));
    }

    #[test]
    fn validate_state_rejects_unknown_state() {
        let coordinator = coordinator();
        let err = coordinator.validate_state("not-a-real-state").unwrap_err();
        assert!(matches!(err, TraktExportError::StateMismatch));
    }

    #[test]
    fn parse_query_extracts_code() {
        let params = parse_query("/callback?code=abc123&state=xyz");
        assert_eq!(params.get("code").unwrap(), "abc123");
        assert_eq!(params.get("state").unwrap(), "xyz");
    }

    #[test]
    fn ct_eq_matches_and_rejects() {
        assert!(ct_eq("same", "same"));
        assert!(!ct_eq("same", "diff"));
        assert!(!ct_eq("short", "longer-string"));
    }

    #[tokio::test]
    async fn local_callback_receiver_delivers_code() {
        let (callback_url, code_rx, _error_rx) =
            OAuthCoordinator::start_local_callback_receiver(0).await.unwrap();
        let port = callback_url
            .rsplit(':')
            .next()
            .unwrap()
            .parse::<u16>()
            .unwrap();

        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
            .await
            .unwrap();
        stream
            .write_all(b"GET /callback?code=abc123&state=xyz HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let code = code_rx.await.unwrap();
        assert_eq!(code, "abc123");
    }
}
