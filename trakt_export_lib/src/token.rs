use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 5-minute safety margin subtracted from `expires_at` before a token is
/// declared expired. Invariant, not configurable.
pub const SAFETY_MARGIN_SECONDS: i64 = 300;

/// The authenticated principal's OAuth credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub access_secret: String,
    pub refresh_secret: Option<String>,
    #[serde(rename = "type", default = "default_token_type")]
    pub token_type: String,
    pub lifetime_seconds: i64,
    pub scope: String,
    pub issued_at: i64,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Token {
    pub fn expires_at(&self) -> i64 {
        self.issued_at + self.lifetime_seconds
    }

    /// `lifetime_seconds == 0` means "never expires" (legacy tokens).
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        if self.lifetime_seconds <= 0 {
            return false;
        }
        let now_ts = now.timestamp();
        (now_ts + SAFETY_MARGIN_SECONDS) > self.expires_at()
    }

    pub fn has_refresh_secret(&self) -> bool {
        self.refresh_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Trakt's `/oauth/token` response shape, deserialized directly off the wire.
#[derive(Debug, Clone, Deserialize)]
pub struct AccessTokenResponse {
    pub access_token: String,
    pub token_type: String,
    pub expires_in: i64,
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub scope: String,
}

impl AccessTokenResponse {
    pub fn into_token(self, issued_at: DateTime<Utc>) -> Token {
        Token {
            access_secret: self.access_token,
            refresh_secret: self.refresh_token,
            token_type: self.token_type,
            lifetime_seconds: self.expires_in,
            scope: self.scope,
            issued_at: issued_at.timestamp(),
        }
    }
}

/// Whether the cached token came from the structured credential store or
/// was synthesized from a raw legacy config value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenOrigin {
    Structured,
    LegacyConfig,
}

#[derive(Debug, Clone)]
pub struct TokenStatus {
    pub has_token: bool,
    pub is_valid: bool,
    pub expires_at: Option<i64>,
    pub has_refresh_secret: bool,
    pub token_type: Option<String>,
    pub scope: Option<String>,
    pub message: String,
}

impl TokenStatus {
    pub fn none() -> Self {
        Self {
            has_token: false,
            is_valid: false,
            expires_at: None,
            has_refresh_secret: false,
            token_type: None,
            scope: None,
            message: "no token on file".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token_with_lifetime(lifetime: i64, issued_at: i64) -> Token {
        Token {
            access_secret: "abc".into(),
            refresh_secret: Some("def".into()),
            token_type: "Bearer".into(),
            lifetime_seconds: lifetime,
            scope: "public".into(),
            issued_at,
        }
    }

    #[test]
    fn never_expires_when_lifetime_zero() {
        let t = token_with_lifetime(0, 0);
        assert!(!t.is_expired(Utc::now()));
    }

    #[test]
    fn expires_with_five_minute_margin() {
        let now = Utc::now();
        let issued_at = now.timestamp() - 3600 + 290; // expires in 290s
        let t = token_with_lifetime(3600, issued_at);
        assert!(t.is_expired(now), "290s left should be inside the 5 min margin");

        let issued_at = now.timestamp() - 3600 + 310; // expires in 310s
        let t = token_with_lifetime(3600, issued_at);
        assert!(!t.is_expired(now), "310s left should be outside the 5 min margin");
    }

    #[test]
    fn expires_at_is_issued_at_plus_lifetime() {
        let t = token_with_lifetime(100, 5);
        assert_eq!(t.expires_at(), 105);
    }
}
