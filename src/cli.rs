//! One-shot CLI driver. Exit codes: 0 success, 1 general error,
//! 2 misconfiguration, 3 unauthenticated.

use std::{process::ExitCode, sync::Arc};

use clap::{Parser, Subcommand};
use trakt_export_lib::{
    config::{Config, HistoryMode},
    credential_store::{CredentialStore, FileBackend, NoopCipher},
    errors::TraktExportError,
    oauth::OAuthCoordinator,
    orchestrator::{Mode, Orchestrator, RunOutcome},
    rate_limiter::RateLimiter,
    token_manager::TokenManager,
    transformer,
};

#[derive(Parser)]
#[command(name = "trakt-export-cli", about = "One-shot Trakt -> Letterboxd export")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Opens the Trakt authorization flow via a transient localhost callback receiver.
    Login,
    /// Runs an ingestion + transformation pass and exits.
    Export {
        #[arg(long, default_value = "normal")]
        mode: String,
        #[arg(long)]
        history_mode: Option<String>,
    },
    /// Prints the current token status.
    Status,
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();

    let config = match Config::with_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    let rate_limiter = Arc::new(RateLimiter::new());
    let oauth = Arc::new(OAuthCoordinator::with_rate_limiter(
        config.trakt_client_id.clone(),
        config.trakt_client_secret.clone(),
        config.redirect_uri.clone(),
        config.trakt_api_base_url.clone(),
        rate_limiter.clone(),
    ));
    let store: Arc<dyn CredentialStore> = Arc::new(FileBackend::new(
        config.credential_store_path.clone(),
        NoopCipher,
    ));
    let token_manager = Arc::new(TokenManager::new(store, oauth.clone(), None));

    let result = match cli.command {
        Command::Login => run_login(&oauth, &token_manager).await,
        Command::Export { mode, history_mode } => {
            run_export(&config, &token_manager, &mode, history_mode.as_deref(), rate_limiter).await
        }
        Command::Status => run_status(&token_manager).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ (TraktExportError::Unauthenticated | TraktExportError::RefreshRequired)) => {
            log::error!("{e}");
            ExitCode::from(3)
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(1)
        }
    }
}

async fn run_login(
    oauth: &Arc<OAuthCoordinator>,
    token_manager: &TokenManager<Arc<OAuthCoordinator>>,
) -> trakt_export_lib::errors::Result<()> {
    let url = oauth.build_authorization_url();
    println!("Open this URL in a browser to authorize: {url}");

    let (callback_url, code_rx, error_rx) =
        OAuthCoordinator::start_local_callback_receiver(8080).await?;
    println!("Waiting for callback at {callback_url} ...");

    tokio::select! {
        code = code_rx => {
            let code = code.map_err(|_| TraktExportError::Internal("callback channel closed".into()))?;
            let token = oauth.exchange_code(&code).await?;
            token_manager.store(token).await?;
            println!("Authorization complete.");
            Ok(())
        }
        error = error_rx => {
            let message = error.unwrap_or_else(|_| "callback channel closed".to_string());
            Err(TraktExportError::BadRequest(message))
        }
    }
}

async fn run_export(
    config: &Config,
    token_manager: &Arc<TokenManager<Arc<OAuthCoordinator>>>,
    mode: &str,
    history_mode_arg: Option<&str>,
    rate_limiter: Arc<RateLimiter>,
) -> trakt_export_lib::errors::Result<()> {
    let mode: Mode = mode.parse()?;
    let history_mode: HistoryMode = match history_mode_arg {
        Some(raw) => raw.parse()?,
        None => config.history_mode,
    };

    let client = trakt_export_lib::api_client::ApiClient::with_rate_limiter(
        config.trakt_api_base_url.clone(),
        config.trakt_client_id.clone(),
        rate_limiter,
    );
    let orchestrator = Orchestrator::new(
        client,
        config.backup_root.clone(),
        "me".to_string(),
        token_manager.clone(),
    );
    let outcome = orchestrator.run(mode, None).await?;

    let summary = match outcome {
        RunOutcome::Succeeded(summary) | RunOutcome::PartialSuccess(summary) => summary,
        RunOutcome::Failed(summary) => {
            return Err(TraktExportError::FetchFailed {
                endpoint: "all".to_string(),
                source: format!("{}/{} endpoints failed", summary.failure_count, summary.total),
            });
        }
    };

    let result = transformer::transform(&summary.backup_dir, "me", history_mode).await?;
    let output_path = config.export_dir.join(
        summary
            .backup_dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "export".to_string()),
    ).join("letterboxd.csv");
    transformer::write_csv(&result.rows, &output_path).await?;

    println!(
        "Wrote {} rows to {} ({} skipped, watched-only fallback: {})",
        result.rows.len(),
        output_path.display(),
        result.skipped_count,
        result.used_watched_only_fallback
    );
    Ok(())
}

async fn run_status(
    token_manager: &TokenManager<Arc<OAuthCoordinator>>,
) -> trakt_export_lib::errors::Result<()> {
    let status = token_manager.status().await;
    println!(
        "authenticated={} valid={} expires_at={:?} message={}",
        status.has_token, status.is_valid, status.expires_at, status.message
    );
    Ok(())
}
