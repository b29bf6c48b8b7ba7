use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Instant,
};
use tokio::sync::Mutex;
use trakt_export_lib::{
    api_client::ApiClient,
    config::{Config, HistoryMode},
    export_registry::ExportRegistry,
    oauth::OAuthCoordinator,
    orchestrator::Orchestrator,
    rate_limiter::RateLimiter,
    token_manager::TokenManager,
};

use crate::templates::register_templates;

pub type SharedTokenManager = TokenManager<Arc<OAuthCoordinator>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportRunPhase {
    Idle,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ExportRunStatus {
    pub phase: ExportRunPhase,
    pub mode: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

impl Default for ExportRunStatus {
    fn default() -> Self {
        Self {
            phase: ExportRunPhase::Idle,
            mode: None,
            started_at: None,
            finished_at: None,
            message: None,
        }
    }
}

/// Background-export state machine: `idle -> running -> (succeeded|failed)
/// -> idle`. The atomic flag is the fast single-in-flight guard consulted
/// by `POST /api/export`; `status` carries the richer, human-readable view.
pub struct ExportRunState {
    pub in_flight: AtomicBool,
    pub status: Mutex<ExportRunStatus>,
}

impl Default for ExportRunState {
    fn default() -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            status: Mutex::new(ExportRunStatus::default()),
        }
    }
}

impl ExportRunState {
    /// Attempts to transition `idle -> running`. Returns `false` (leaving
    /// state untouched) if a run is already in flight.
    pub fn try_start(&self, mode: &str) -> bool {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if let Ok(mut status) = self.status.try_lock() {
            *status = ExportRunStatus {
                phase: ExportRunPhase::Running,
                mode: Some(mode.to_string()),
                started_at: Some(Utc::now()),
                finished_at: None,
                message: None,
            };
        }
        true
    }

    pub async fn finish(&self, succeeded: bool, message: Option<String>) {
        let mut status = self.status.lock().await;
        status.phase = if succeeded {
            ExportRunPhase::Succeeded
        } else {
            ExportRunPhase::Failed
        };
        status.finished_at = Some(Utc::now());
        status.message = message;
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

pub struct CsrfEntry {
    pub issued_at: Instant,
}

pub struct AppState {
    pub config: Config,
    pub token_manager: Arc<SharedTokenManager>,
    pub oauth: Arc<OAuthCoordinator>,
    pub export_registry: Arc<ExportRegistry>,
    pub export_run: Arc<ExportRunState>,
    pub csrf_tokens: Arc<Mutex<HashMap<String, CsrfEntry>>>,
    pub templates: Arc<Handlebars<'static>>,
    pub started_at: Instant,
    pub user: String,
    pub backup_root: PathBuf,
    pub export_dir: PathBuf,
    pub history_mode: HistoryMode,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: Config) -> Arc<Self> {
        let rate_limiter = Arc::new(RateLimiter::new());
        let oauth = Arc::new(OAuthCoordinator::with_rate_limiter(
            config.trakt_client_id.clone(),
            config.trakt_client_secret.clone(),
            config.redirect_uri.clone(),
            config.trakt_api_base_url.clone(),
            rate_limiter.clone(),
        ));
        let credential_store: Arc<dyn trakt_export_lib::credential_store::CredentialStore> =
            Arc::new(trakt_export_lib::credential_store::FileBackend::new(
                config.credential_store_path.clone(),
                trakt_export_lib::credential_store::NoopCipher,
            ));
        let token_manager = Arc::new(TokenManager::new(credential_store, oauth.clone(), None));
        let export_registry = Arc::new(ExportRegistry::new(config.export_dir.clone()));

        Arc::new(Self {
            token_manager,
            oauth,
            export_registry,
            export_run: Arc::new(ExportRunState::default()),
            csrf_tokens: Arc::new(Mutex::new(HashMap::new())),
            templates: Arc::new(register_templates()),
            started_at: Instant::now(),
            user: "me".to_string(),
            backup_root: config.backup_root.clone(),
            export_dir: config.export_dir.clone(),
            history_mode: config.history_mode,
            rate_limiter,
            config,
        })
    }

    pub fn build_api_client(&self) -> ApiClient {
        ApiClient::with_rate_limiter(
            self.config.trakt_api_base_url.clone(),
            self.config.trakt_client_id.clone(),
            self.rate_limiter.clone(),
        )
    }

    pub fn build_orchestrator(&self) -> Orchestrator<Arc<OAuthCoordinator>> {
        Orchestrator::new(
            self.build_api_client(),
            self.backup_root.clone(),
            self.user.clone(),
            self.token_manager.clone(),
        )
    }
}
