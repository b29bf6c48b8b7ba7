//! C5: selects an endpoint set from a `Mode`, runs C4 across them in
//! order, and writes per-endpoint artifacts into a timestamped backup
//! directory.

use chrono::Utc;
use log::{error, info, warn};
use std::{path::PathBuf, str::FromStr, sync::Arc};
use tokio::sync::mpsc;

use crate::{
    api_client::ApiClient,
    errors::{Result, TraktExportError},
    token_manager::{TokenManager, TokenRefresher},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Initial,
    Normal,
    Complete,
}

impl FromStr for Mode {
    type Err = TraktExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "initial" => Ok(Self::Initial),
            "normal" => Ok(Self::Normal),
            "complete" => Ok(Self::Complete),
            other => Err(TraktExportError::BadRequest(format!("unknown mode {other}"))),
        }
    }
}

impl Mode {
    /// The exact, ordered endpoint set for this mode.
    pub fn endpoints(self) -> &'static [&'static str] {
        match self {
            Self::Initial => &["history/movies", "ratings/movies", "watched/movies"],
            Self::Normal => &[
                "history/movies",
                "ratings/movies",
                "watched/movies",
                "watchlist/movies",
            ],
            Self::Complete => &[
                "watchlist/movies",
                "watchlist/shows",
                "watchlist/episodes",
                "watchlist/seasons",
                "ratings/movies",
                "ratings/shows",
                "ratings/episodes",
                "ratings/seasons",
                "collection/movies",
                "collection/shows",
                "watched/movies",
                "watched/shows",
                "history/movies",
                "history/shows",
                "history/episodes",
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Fetching,
    Writing,
}

#[derive(Debug, Clone)]
pub struct Progress {
    pub endpoint_index: usize,
    pub endpoint_total: usize,
    pub current_endpoint: String,
    pub phase: Phase,
}

#[derive(Debug)]
pub struct RunSummary {
    pub backup_dir: PathBuf,
    pub total: usize,
    pub success_count: usize,
    pub failure_count: usize,
}

pub enum RunOutcome {
    Succeeded(RunSummary),
    PartialSuccess(RunSummary),
    Failed(RunSummary),
}

pub struct Orchestrator<R: TokenRefresher> {
    client: ApiClient,
    backup_root: PathBuf,
    user: String,
    token_manager: Arc<TokenManager<R>>,
}

impl<R: TokenRefresher> Orchestrator<R> {
    pub fn new(
        client: ApiClient,
        backup_root: PathBuf,
        user: String,
        token_manager: Arc<TokenManager<R>>,
    ) -> Self {
        Self {
            client,
            backup_root,
            user,
            token_manager,
        }
    }

    /// Runs every endpoint in `mode`'s set sequentially, pulling a valid
    /// access secret from the token manager itself. On a mid-run
    /// `Unauthenticated` (C4 surfacing an expired token), forces exactly one
    /// refresh and retries the endpoint that failed; a further
    /// `Unauthenticated` — whether from the refresh call itself or from the
    /// retried fetch — aborts the run rather than refreshing again.
    pub async fn run(
        &self,
        mode: Mode,
        progress: Option<mpsc::Sender<Progress>>,
    ) -> Result<RunOutcome> {
        let endpoints = mode.endpoints();
        let timestamp = Utc::now().format("%Y-%m-%d_%H-%M-%S");
        let backup_dir = self.backup_root.join(format!("{timestamp}_trakt-backup"));
        self.create_backup_dir(&backup_dir).await?;

        let mut access_secret = self.token_manager.valid_access_secret().await?;

        let total = endpoints.len();
        let mut success_count = 0usize;
        let mut failure_count = 0usize;
        let mut has_refreshed = false;

        for (index, endpoint) in endpoints.iter().enumerate() {
            if let Some(tx) = &progress {
                let _ = tx
                    .send(Progress {
                        endpoint_index: index,
                        endpoint_total: total,
                        current_endpoint: (*endpoint).to_string(),
                        phase: Phase::Fetching,
                    })
                    .await;
            }

            let output_path = backup_dir.join(format!(
                "{}-{}.json",
                self.user,
                endpoint.replace('/', "_")
            ));

            let mut outcome = self.client.fetch(endpoint, &access_secret, &output_path).await;

            if let Err(TraktExportError::Unauthenticated) = outcome {
                if has_refreshed {
                    error!("token expired again at {endpoint} after the run's one refresh attempt; aborting run");
                    return Err(TraktExportError::Unauthenticated);
                }
                warn!("token expired mid-run while fetching {endpoint}; forcing a refresh and retrying once");
                has_refreshed = true;
                if let Err(e) = self.token_manager.force_refresh().await {
                    error!("force refresh failed while retrying {endpoint}: {e}; aborting run");
                    return Err(TraktExportError::Unauthenticated);
                }
                access_secret = match self.token_manager.valid_access_secret().await {
                    Ok(secret) => secret,
                    Err(e) => {
                        error!("no valid access secret after refresh: {e}; aborting run");
                        return Err(TraktExportError::Unauthenticated);
                    }
                };
                outcome = self.client.fetch(endpoint, &access_secret, &output_path).await;
                if let Err(TraktExportError::Unauthenticated) = outcome {
                    error!("endpoint {endpoint} still unauthenticated after refresh; aborting run");
                    return Err(TraktExportError::Unauthenticated);
                }
            }

            match outcome {
                Ok(outcome) => {
                    success_count += 1;
                    if outcome.partial {
                        warn!("endpoint {endpoint} completed with a partial page set");
                    }
                    info!("endpoint {endpoint}: {} items", outcome.item_count);
                }
                Err(e) => {
                    error!("endpoint {endpoint} failed, continuing with remaining endpoints: {e}");
                    failure_count += 1;
                }
            }

            if let Some(tx) = &progress {
                let _ = tx
                    .send(Progress {
                        endpoint_index: index,
                        endpoint_total: total,
                        current_endpoint: (*endpoint).to_string(),
                        phase: Phase::Writing,
                    })
                    .await;
            }
        }

        let summary = RunSummary {
            backup_dir,
            total,
            success_count,
            failure_count,
        };

        Ok(if failure_count == 0 {
            RunOutcome::Succeeded(summary)
        } else if failure_count == total {
            RunOutcome::Failed(summary)
        } else {
            RunOutcome::PartialSuccess(summary)
        })
    }

    async fn create_backup_dir(&self, dir: &PathBuf) -> Result<()> {
        tokio::fs::create_dir_all(dir).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o750)).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{credential_store::MemoryBackend, token::Token};

    /// Always succeeds, handing back a token under a new access secret so
    /// tests can tell a pre-refresh request from a post-refresh one.
    struct AlwaysRefreshes;

    #[async_trait::async_trait]
    impl TokenRefresher for AlwaysRefreshes {
        async fn refresh_token(&self, _refresh_secret: &str) -> Result<Token> {
            Ok(Token {
                access_secret: "refreshed-secret".into(),
                refresh_secret: Some("refresh".into()),
                token_type: "Bearer".into(),
                lifetime_seconds: 3600,
                scope: "public".into(),
                issued_at: Utc::now().timestamp(),
            })
        }
    }

    async fn token_manager_with_valid_token() -> Arc<TokenManager<AlwaysRefreshes>> {
        let store = Arc::new(MemoryBackend::new());
        let manager = Arc::new(TokenManager::new(store, AlwaysRefreshes, None));
        manager
            .store(Token {
                access_secret: "secret".into(),
                refresh_secret: Some("refresh".into()),
                token_type: "Bearer".into(),
                lifetime_seconds: 3600,
                scope: "public".into(),
                issued_at: Utc::now().timestamp(),
            })
            .await
            .unwrap();
        manager
    }

    #[test]
    fn mode_parses_case_insensitively() {
        assert_eq!("Initial".parse::<Mode>().unwrap(), Mode::Initial);
        assert_eq!("COMPLETE".parse::<Mode>().unwrap(), Mode::Complete);
        assert!("bogus".parse::<Mode>().is_err());
    }

    #[test]
    fn endpoint_sets_have_expected_order() {
        assert_eq!(
            Mode::Initial.endpoints(),
            &["history/movies", "ratings/movies", "watched/movies"]
        );
        assert_eq!(Mode::Normal.endpoints().len(), 4);
        assert_eq!(Mode::Complete.endpoints().len(), 15);
    }

    #[tokio::test]
    async fn run_writes_one_artifact_per_endpoint() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(server.uri(), "cid".to_string());
        let token_manager = token_manager_with_valid_token().await;
        let orchestrator = Orchestrator::new(client, dir.path().to_path_buf(), "me".to_string(), token_manager);
        let outcome = orchestrator.run(Mode::Initial, None).await.unwrap();
        match outcome {
            RunOutcome::Succeeded(summary) => {
                assert_eq!(summary.success_count, 3);
                let entries: Vec<_> = std::fs::read_dir(&summary.backup_dir)
                    .unwrap()
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .unwrap();
                assert_eq!(entries.len(), 3);
            }
            _ => panic!("expected a fully successful run"),
        }
    }

    #[tokio::test]
    async fn run_force_refreshes_once_and_retries_endpoint_on_mid_run_expiry() {
        let server = wiremock::MockServer::start().await;

        // The first endpoint's pre-refresh requests all look unauthenticated...
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::header("authorization", "Bearer secret"))
            .respond_with(
                wiremock::ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;
        // ...but every request carrying the refreshed secret succeeds.
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::header("authorization", "Bearer refreshed-secret"))
            .respond_with(wiremock::ResponseTemplate::new(200).set_body_json(serde_json::json!([])))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(server.uri(), "cid".to_string());
        let token_manager = token_manager_with_valid_token().await;
        let orchestrator = Orchestrator::new(client, dir.path().to_path_buf(), "me".to_string(), token_manager);
        let outcome = orchestrator.run(Mode::Initial, None).await.unwrap();
        match outcome {
            RunOutcome::Succeeded(summary) => assert_eq!(summary.success_count, 3),
            _ => panic!("expected the run to recover after one forced refresh"),
        }
    }

    #[tokio::test]
    async fn run_aborts_when_still_unauthenticated_after_the_one_refresh() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .respond_with(
                wiremock::ResponseTemplate::new(401).set_body_json(serde_json::json!({"error": "invalid_grant"})),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let client = ApiClient::new(server.uri(), "cid".to_string());
        let token_manager = token_manager_with_valid_token().await;
        let orchestrator = Orchestrator::new(client, dir.path().to_path_buf(), "me".to_string(), token_manager);
        let err = orchestrator.run(Mode::Initial, None).await.unwrap_err();
        assert!(matches!(err, TraktExportError::Unauthenticated));
    }
}
