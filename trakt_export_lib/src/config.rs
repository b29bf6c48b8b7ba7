use serde::Deserialize;
use std::{ops::Deref, path::PathBuf, sync::Arc};

use crate::errors::{Result, TraktExportError};

/// How repeated watches of the same title collapse into Letterboxd rows:
/// one row per title with the latest watch date (`Aggregated`), or one row
/// per watch event (`Individual`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    #[default]
    Aggregated,
    Individual,
}

impl std::str::FromStr for HistoryMode {
    type Err = TraktExportError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "aggregated" => Ok(Self::Aggregated),
            "individual" => Ok(Self::Individual),
            other => Err(TraktExportError::BadRequest(format!(
                "unknown history_mode {other}"
            ))),
        }
    }
}

/// The on-the-wire TOML shape, one struct per recognized config section.
/// Parsing the grammar itself is a collaborator concern; this type exists
/// because every other component reads the resolved values out of `Config`.
#[derive(Debug, Deserialize, Default)]
struct TomlConfig {
    #[serde(default)]
    trakt: TraktSection,
    #[serde(default)]
    auth: AuthSection,
    #[serde(default)]
    letterboxd: LetterboxdSection,
    #[serde(default)]
    export: ExportSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, Deserialize, Default)]
struct TraktSection {
    client_id: Option<String>,
    client_secret: Option<String>,
    api_base_url: Option<String>,
    #[serde(default)]
    extended_info: bool,
}

#[derive(Debug, Deserialize, Default)]
struct AuthSection {
    redirect_uri: Option<String>,
    callback_port: Option<u16>,
    #[serde(default = "default_true")]
    use_oauth: bool,
    #[serde(default = "default_true")]
    auto_refresh: bool,
}

#[derive(Debug, Deserialize, Default)]
struct LetterboxdSection {
    export_dir: Option<PathBuf>,
    watched_filename: Option<String>,
    collection_filename: Option<String>,
    shows_filename: Option<String>,
    ratings_filename: Option<String>,
    watchlist_filename: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ExportSection {
    format: Option<String>,
    date_format: Option<String>,
    timezone: Option<String>,
    history_mode: Option<HistoryMode>,
}

#[derive(Debug, Deserialize, Default)]
struct LoggingSection {
    level: Option<String>,
    file: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
pub struct ConfigInner {
    pub trakt_client_id: String,
    pub trakt_client_secret: String,
    pub trakt_api_base_url: String,
    pub trakt_extended_info: bool,

    pub redirect_uri: String,
    pub callback_port: u16,
    pub use_oauth: bool,
    pub auto_refresh: bool,

    pub backup_root: PathBuf,
    pub export_dir: PathBuf,
    pub watched_filename: String,
    pub collection_filename: String,
    pub shows_filename: String,
    pub ratings_filename: String,
    pub watchlist_filename: String,

    pub date_format: String,
    pub timezone: String,
    pub history_mode: HistoryMode,

    pub log_level: String,
    pub log_file: Option<PathBuf>,

    pub http_port: u16,
    pub credential_store_path: PathBuf,
}

impl Default for ConfigInner {
    fn default() -> Self {
        Self {
            trakt_client_id: String::new(),
            trakt_client_secret: String::new(),
            trakt_api_base_url: default_trakt_endpoint(),
            trakt_extended_info: false,
            redirect_uri: "http://localhost:8080/callback".to_string(),
            callback_port: 8080,
            use_oauth: true,
            auto_refresh: true,
            backup_root: default_backup_root(),
            export_dir: default_export_dir(),
            watched_filename: "watched.csv".to_string(),
            collection_filename: "collection.csv".to_string(),
            shows_filename: "shows.csv".to_string(),
            ratings_filename: "ratings.csv".to_string(),
            watchlist_filename: "watchlist.csv".to_string(),
            date_format: "%Y-%m-%d".to_string(),
            timezone: "UTC".to_string(),
            history_mode: HistoryMode::Aggregated,
            log_level: "info".to_string(),
            log_file: None,
            http_port: 8080,
            credential_store_path: default_credential_path(),
        }
    }
}

fn default_trakt_endpoint() -> String {
    "https://api.trakt.tv".to_string()
}

fn default_backup_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trakt-export")
        .join("backup")
}

fn default_export_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".trakt-export")
        .join("export")
}

fn default_credential_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("trakt-export")
        .join("credentials.json")
}

/// Cheaply-cloneable configuration handle over an `Arc<ConfigInner>`.
#[derive(Debug, Clone)]
pub struct Config(Arc<ConfigInner>);

impl Config {
    /// Reads `config.toml` (if present) then layers recognized environment
    /// variables on top, so environment variables override file values.
    pub fn with_config() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config_path = std::env::var("TRAKT_EXPORT_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.toml"));

        let toml_cfg: TomlConfig = if config_path.exists() {
            let text = std::fs::read_to_string(&config_path)?;
            toml::from_str(&text)?
        } else {
            TomlConfig::default()
        };

        let mut inner = ConfigInner::default();

        if let Some(v) = toml_cfg.trakt.client_id {
            inner.trakt_client_id = v;
        }
        if let Some(v) = toml_cfg.trakt.client_secret {
            inner.trakt_client_secret = v;
        }
        if let Some(v) = toml_cfg.trakt.api_base_url {
            inner.trakt_api_base_url = v;
        }
        inner.trakt_extended_info = toml_cfg.trakt.extended_info;

        if let Some(v) = toml_cfg.auth.redirect_uri {
            inner.redirect_uri = v;
        }
        if let Some(v) = toml_cfg.auth.callback_port {
            inner.callback_port = v;
        }
        inner.use_oauth = toml_cfg.auth.use_oauth;
        inner.auto_refresh = toml_cfg.auth.auto_refresh;

        if let Some(v) = toml_cfg.letterboxd.export_dir {
            inner.export_dir = v;
        }
        if let Some(v) = toml_cfg.letterboxd.watched_filename {
            inner.watched_filename = v;
        }
        if let Some(v) = toml_cfg.letterboxd.collection_filename {
            inner.collection_filename = v;
        }
        if let Some(v) = toml_cfg.letterboxd.shows_filename {
            inner.shows_filename = v;
        }
        if let Some(v) = toml_cfg.letterboxd.ratings_filename {
            inner.ratings_filename = v;
        }
        if let Some(v) = toml_cfg.letterboxd.watchlist_filename {
            inner.watchlist_filename = v;
        }

        // `format` is reserved for future CSV dialects; only the Letterboxd
        // shape is implemented, so the value is accepted but unused.
        let _ = toml_cfg.export.format;
        if let Some(v) = toml_cfg.export.date_format {
            inner.date_format = v;
        }
        if let Some(v) = toml_cfg.export.timezone {
            inner.timezone = v;
        }
        if let Some(v) = toml_cfg.export.history_mode {
            inner.history_mode = v;
        }

        if let Some(v) = toml_cfg.logging.level {
            inner.log_level = v;
        }
        if let Some(v) = toml_cfg.logging.file {
            inner.log_file = Some(v);
        }

        apply_env_overrides(&mut inner)?;

        Ok(Self(Arc::new(inner)))
    }

    pub fn for_test() -> Self {
        let mut inner = ConfigInner::default();
        inner.trakt_client_id = "test-client-id".to_string();
        inner.trakt_client_secret = "test-client-secret".to_string();
        Self(Arc::new(inner))
    }
}

/// Recognized environment variables, parsed in one pass via `envy` rather
/// than repeated `std::env::var` calls. Every field is optional: only the
/// variables actually set in the process environment end up overriding
/// whatever the TOML file (or its own defaults) already produced.
#[derive(Debug, Default, Deserialize)]
struct EnvOverrides {
    trakt_client_id: Option<String>,
    trakt_client_secret: Option<String>,
    export_dir: Option<PathBuf>,
    export_history_mode: Option<HistoryMode>,
    auth_callback_port: Option<u16>,
}

fn apply_env_overrides(inner: &mut ConfigInner) -> Result<()> {
    let overrides: EnvOverrides = envy::from_env()?;

    if let Some(v) = overrides.trakt_client_id {
        inner.trakt_client_id = v;
    }
    if let Some(v) = overrides.trakt_client_secret {
        inner.trakt_client_secret = v;
    }
    if let Some(v) = overrides.export_dir {
        inner.export_dir = v;
    }
    if let Some(v) = overrides.export_history_mode {
        inner.history_mode = v;
    }
    if let Some(v) = overrides.auth_callback_port {
        inner.callback_port = v;
    }
    Ok(())
}

impl Deref for Config {
    type Target = ConfigInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_mode_parses_case_insensitively() {
        assert_eq!(
            "Aggregated".parse::<HistoryMode>().unwrap(),
            HistoryMode::Aggregated
        );
        assert_eq!(
            "individual".parse::<HistoryMode>().unwrap(),
            HistoryMode::Individual
        );
        assert!("bogus".parse::<HistoryMode>().is_err());
    }

    #[test]
    fn default_config_has_sane_endpoint() {
        let config = Config::for_test();
        assert_eq!(config.trakt_api_base_url, "https://api.trakt.tv");
        assert_eq!(config.history_mode, HistoryMode::Aggregated);
    }
}
