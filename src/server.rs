use trakt_export_lib::config::Config;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match Config::with_config() {
        Ok(config) => config,
        Err(e) => {
            log::error!("configuration error: {e}");
            std::process::exit(2);
        }
    };

    let state = trakt_export_http::AppState::new(config);
    if let Err(e) = trakt_export_http::serve(state).await {
        log::error!("server exited with error: {e}");
        std::process::exit(1);
    }
}
