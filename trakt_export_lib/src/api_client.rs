//! C4: signed, paginated GET against Trakt with per-page retry and
//! atomic merged-artifact writes.

use log::{info, warn};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use std::{path::Path, sync::Arc, time::Duration};
use tokio::{fs, io::AsyncWriteExt};

use crate::{
    errors::{Result, TraktExportError},
    rate_limiter::RateLimiter,
};

const RATE_LIMIT_KEY: &str = "trakt_api";

/// First page size attempted; Trakt's documented maximum.
pub const TRAKT_PAGE_LIMIT: u32 = 1000;
/// Bumped whenever `TRAKT_PAGE_LIMIT` changes, so a downgrade on explicit
/// 4xx rejection can be told apart from a first attempt in logs.
pub const PAGE_LIMIT_VERSION: u32 = 1;

const MAX_RETRIES: u32 = 3;
const RETRY_SLEEP: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const HEADER_PAGE_COUNT: &str = "x-pagination-page-count";
const HEADER_ITEM_COUNT: &str = "x-pagination-item-count";

pub struct ApiClient {
    http: Client,
    api_base_url: String,
    client_id: String,
    rate_limiter: Arc<RateLimiter>,
}

/// Outcome of fetching one endpoint. `item_count` reflects only the pages
/// that made it to disk, even on `PartialSuccess`.
pub struct FetchOutcome {
    pub item_count: usize,
    pub partial: bool,
}

impl ApiClient {
    pub fn new(api_base_url: String, client_id: String) -> Self {
        Self::with_rate_limiter(api_base_url, client_id, Arc::new(RateLimiter::new()))
    }

    /// Lets callers share a single `RateLimiter` (and its buckets) across an
    /// `ApiClient` and an `OAuthCoordinator`, since both draw against Trakt's
    /// published limits.
    pub fn with_rate_limiter(
        api_base_url: String,
        client_id: String,
        rate_limiter: Arc<RateLimiter>,
    ) -> Self {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("reqwest client builder should not fail with static config");
        Self {
            http,
            api_base_url,
            client_id,
            rate_limiter,
        }
    }

    /// Fetches every page of `endpoint`, merging them into `output_path` as
    /// one JSON array. Pages are appended in ascending order; element order
    /// within a page is preserved.
    pub async fn fetch(
        &self,
        endpoint: &str,
        access_secret: &str,
        output_path: &Path,
    ) -> Result<FetchOutcome> {
        let tmp_path = output_path.with_extension("json.tmp");
        if let Some(parent) = output_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut merged: Vec<Value> = Vec::new();
        let mut page_count: Option<u32> = None;
        let mut page: u32 = 1;

        loop {
            if let Some(limit) = page_count {
                if page > limit {
                    break;
                }
            }

            match self.fetch_page(endpoint, access_secret, page).await {
                Ok((items, headers_page_count)) => {
                    if page_count.is_none() {
                        page_count = headers_page_count;
                    }
                    let len = items.len();
                    merged.extend(items);
                    if (len as u32) < TRAKT_PAGE_LIMIT {
                        break;
                    }
                    page += 1;
                }
                Err(TraktExportError::BadRequest(msg)) if msg.contains("invalid_grant") => {
                    return Err(TraktExportError::Unauthenticated);
                }
                Err(e) => {
                    warn!("endpoint {endpoint} page {page} failed after retries: {e}");
                    if merged.is_empty() {
                        return Err(TraktExportError::FetchFailed {
                            endpoint: endpoint.to_string(),
                            source: e.to_string(),
                        });
                    }
                    self.write_merged(&tmp_path, output_path, &merged).await?;
                    return Ok(FetchOutcome {
                        item_count: merged.len(),
                        partial: true,
                    });
                }
            }
        }

        self.write_merged(&tmp_path, output_path, &merged).await?;
        info!("endpoint {endpoint}: wrote {} items", merged.len());
        Ok(FetchOutcome {
            item_count: merged.len(),
            partial: false,
        })
    }

    async fn write_merged(&self, tmp_path: &Path, output_path: &Path, items: &[Value]) -> Result<()> {
        let body = serde_json::to_vec(items)?;
        let mut file = fs::File::create(tmp_path).await?;
        file.write_all(&body).await?;
        file.sync_all().await?;
        fs::rename(tmp_path, output_path).await?;
        Ok(())
    }

    /// Fetches one page, retrying transient failures up to `MAX_RETRIES`
    /// times with a fixed sleep between attempts.
    async fn fetch_page(
        &self,
        endpoint: &str,
        access_secret: &str,
        page: u32,
    ) -> Result<(Vec<Value>, Option<u32>)> {
        let mut last_err: Option<TraktExportError> = None;
        for attempt in 1..=MAX_RETRIES {
            match self.fetch_page_once(endpoint, access_secret, page).await {
                Ok(ok) => return Ok(ok),
                Err(e) => {
                    warn!("endpoint {endpoint} page {page} attempt {attempt}/{MAX_RETRIES} failed: {e}");
                    last_err = Some(e);
                    if attempt < MAX_RETRIES {
                        tokio::time::sleep(RETRY_SLEEP).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(TraktExportError::Internal("retry loop exited without error".into())))
    }

    async fn fetch_page_once(
        &self,
        endpoint: &str,
        access_secret: &str,
        page: u32,
    ) -> Result<(Vec<Value>, Option<u32>)> {
        self.rate_limiter.acquire(RATE_LIMIT_KEY).await;
        let url = format!("{}/users/me/{endpoint}", self.api_base_url);
        let response = self
            .http
            .get(&url)
            .query(&[("page", page.to_string()), ("limit", TRAKT_PAGE_LIMIT.to_string())])
            .header("trakt-api-version", "2")
            .header("trakt-api-key", &self.client_id)
            .header("Authorization", format!("Bearer {access_secret}"))
            .header("Content-Type", "application/json")
            .send()
            .await?;

        let page_count = response
            .headers()
            .get(HEADER_PAGE_COUNT)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        let _item_count_header = response
            .headers()
            .get(HEADER_ITEM_COUNT)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());

        let status = response.status();
        let body_text = response.text().await?;

        if status == StatusCode::UNAUTHORIZED || body_text.contains("invalid_grant") {
            return Err(TraktExportError::BadRequest("invalid_grant".to_string()));
        }
        if !status.is_success() {
            return Err(TraktExportError::FetchFailed {
                endpoint: endpoint.to_string(),
                source: format!("http status {status}"),
            });
        }

        let value: Value = serde_json::from_str(&body_text)
            .map_err(|e| TraktExportError::ParseFailure(e.to_string()))?;
        let items = value
            .as_array()
            .cloned()
            .ok_or_else(|| TraktExportError::ParseFailure("expected a JSON array".to_string()))?;

        Ok((items, page_count))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        matchers::{header, method, path, query_param},
        Mock, MockServer, ResponseTemplate,
    };

    #[tokio::test]
    async fn single_short_page_terminates_without_second_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/me/history/movies"))
            .and(query_param("page", "1"))
            .and(header("trakt-api-key", "cid"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([{"id": 1}])))
            .expect(1)
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri(), "cid".to_string());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("history_movies.json");
        let outcome = client
            .fetch("history/movies", "access-secret", &out)
            .await
            .unwrap();
        assert_eq!(outcome.item_count, 1);
        assert!(!outcome.partial);

        let written: Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(written.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn empty_page_produces_valid_empty_json_array() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/me/ratings/movies"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri(), "cid".to_string());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("ratings_movies.json");
        let outcome = client.fetch("ratings/movies", "secret", &out).await.unwrap();
        assert_eq!(outcome.item_count, 0);

        let written: Value = serde_json::from_slice(&std::fs::read(&out).unwrap()).unwrap();
        assert_eq!(written, serde_json::json!([]));
    }

    #[tokio::test]
    async fn persistent_failure_with_no_prior_page_is_fetch_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/users/me/watched/movies"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let client = ApiClient::new(server.uri(), "cid".to_string());
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("watched_movies.json");
        let err = client.fetch("watched/movies", "secret", &out).await.unwrap_err();
        assert!(matches!(err, TraktExportError::FetchFailed { .. }));
    }
}
