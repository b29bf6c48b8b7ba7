use thiserror::Error;

/// Error kinds surfaced across component boundaries: one variant per kind,
/// no component-specific leakage.
#[derive(Error, Debug)]
pub enum TraktExportError {
    #[error("unauthenticated: no token on file")]
    Unauthenticated,

    #[error("token expired and no refresh secret is available")]
    RefreshRequired,

    #[error("refresh request was rejected: {0}")]
    RefreshFailed(String),

    #[error("oauth state mismatch")]
    StateMismatch,

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("fetch failed for endpoint {endpoint}: {source}")]
    FetchFailed { endpoint: String, source: String },

    #[error("partial success: {success_count}/{total} endpoints succeeded")]
    PartialSuccess {
        success_count: usize,
        failure_count: usize,
        total: usize,
    },

    #[error("failed to parse response: {0}")]
    ParseFailure(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for TraktExportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for TraktExportError {
    fn from(e: serde_json::Error) -> Self {
        Self::ParseFailure(e.to_string())
    }
}

impl From<reqwest::Error> for TraktExportError {
    fn from(e: reqwest::Error) -> Self {
        Self::Internal(e.to_string())
    }
}

impl From<toml::de::Error> for TraktExportError {
    fn from(e: toml::de::Error) -> Self {
        Self::Internal(format!("config parse error: {e}"))
    }
}

impl From<envy::Error> for TraktExportError {
    fn from(e: envy::Error) -> Self {
        Self::Internal(format!("config env error: {e}"))
    }
}

impl From<csv::Error> for TraktExportError {
    fn from(e: csv::Error) -> Self {
        Self::Internal(format!("csv write error: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, TraktExportError>;
