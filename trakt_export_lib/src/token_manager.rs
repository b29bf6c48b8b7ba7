//! C2: in-memory cached token plus persistence via C1, expiry math,
//! concurrent access, auto-refresh.

use async_trait::async_trait;
use chrono::Utc;
use log::warn;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{
    credential_store::CredentialStore,
    errors::{Result, TraktExportError},
    token::{Token, TokenOrigin, TokenStatus},
};

const KEY_ACCESS: &str = "access";
const KEY_REFRESH: &str = "refresh";
const KEY_COMPOUND: &str = "compound";
const KEY_LEGACY_ACCESS_TOKEN: &str = "legacy_access_token";

/// Collaborator the token manager calls into to perform a refresh exchange.
/// `OAuthCoordinator` (C3) implements this; kept as a trait here so C2 does
/// not depend on C3's module directly.
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh_token(&self, refresh_secret: &str) -> Result<Token>;
}

#[derive(Clone)]
struct CachedToken {
    token: Token,
    origin: TokenOrigin,
}

pub struct TokenManager<R: TokenRefresher> {
    cache: RwLock<Option<CachedToken>>,
    store: Arc<dyn CredentialStore>,
    refresher: R,
    legacy_access_token: Option<String>,
}

impl<R: TokenRefresher> TokenManager<R> {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        refresher: R,
        legacy_access_token: Option<String>,
    ) -> Self {
        Self {
            cache: RwLock::new(None),
            store,
            refresher,
            legacy_access_token,
        }
    }

    /// Loads whatever is in the credential store into the in-memory cache.
    /// Safe to call repeatedly; a no-op once a token is cached.
    async fn hydrate(&self) -> Result<()> {
        if self.cache.read().await.is_some() {
            return Ok(());
        }
        let mut guard = self.cache.write().await;
        if guard.is_some() {
            return Ok(());
        }
        if let Ok(compound) = self.store.get(KEY_COMPOUND).await {
            if let Ok(token) = serde_json::from_str::<Token>(&compound) {
                *guard = Some(CachedToken {
                    token,
                    origin: TokenOrigin::Structured,
                });
                return Ok(());
            }
        }
        Ok(())
    }

    /// Returns a non-expired access secret, refreshing transparently if
    /// needed. The write lock is held for the entire
    /// get -> check -> refresh -> store sequence, guaranteeing at most one
    /// concurrent refresh per process.
    pub async fn valid_access_secret(&self) -> Result<String> {
        self.hydrate().await?;
        let mut guard = self.cache.write().await;

        if let Some(cached) = guard.as_ref() {
            if !cached.token.is_expired(Utc::now()) {
                return Ok(cached.token.access_secret.clone());
            }
            if !cached.token.has_refresh_secret() {
                return Err(TraktExportError::RefreshRequired);
            }
            let refresh_secret = cached.token.refresh_secret.clone().unwrap();
            let refreshed = self
                .refresher
                .refresh_token(&refresh_secret)
                .await
                .map_err(|e| TraktExportError::RefreshFailed(e.to_string()))?;
            self.persist(&refreshed).await?;
            let access_secret = refreshed.access_secret.clone();
            *guard = Some(CachedToken {
                token: refreshed,
                origin: TokenOrigin::Structured,
            });
            return Ok(access_secret);
        }

        if let Some(legacy) = &self.legacy_access_token {
            warn!("using legacy non-expiring access token from configuration");
            return Ok(legacy.clone());
        }

        Err(TraktExportError::Unauthenticated)
    }

    /// Writes all three credential records and updates the cache while
    /// holding the write lock, so concurrent readers see either the fully
    /// old or fully new token, never a partial update.
    pub async fn store(&self, token: Token) -> Result<()> {
        let mut guard = self.cache.write().await;
        self.persist(&token).await?;
        *guard = Some(CachedToken {
            token,
            origin: TokenOrigin::Structured,
        });
        Ok(())
    }

    async fn persist(&self, token: &Token) -> Result<()> {
        self.store.put(KEY_ACCESS, &token.access_secret).await?;
        if let Some(refresh) = &token.refresh_secret {
            self.store.put(KEY_REFRESH, refresh).await?;
        }
        let compound = serde_json::to_string(token)?;
        self.store.put(KEY_COMPOUND, &compound).await?;
        Ok(())
    }

    pub async fn status(&self) -> TokenStatus {
        if self.hydrate().await.is_err() {
            return TokenStatus::none();
        }
        let guard = self.cache.read().await;
        match guard.as_ref() {
            Some(cached) => {
                let is_valid = !cached.token.is_expired(Utc::now());
                TokenStatus {
                    has_token: true,
                    is_valid,
                    expires_at: Some(cached.token.expires_at()),
                    has_refresh_secret: cached.token.has_refresh_secret(),
                    token_type: Some(cached.token.token_type.clone()),
                    scope: Some(cached.token.scope.clone()),
                    message: if is_valid {
                        "token is valid".to_string()
                    } else {
                        "token is expired".to_string()
                    },
                }
            }
            None => {
                if self.legacy_access_token.is_some() {
                    TokenStatus {
                        has_token: true,
                        is_valid: true,
                        expires_at: None,
                        has_refresh_secret: false,
                        token_type: Some("Bearer".to_string()),
                        scope: None,
                        message: "using legacy configuration token".to_string(),
                    }
                } else {
                    TokenStatus::none()
                }
            }
        }
    }

    pub async fn force_refresh(&self) -> Result<()> {
        self.hydrate().await?;
        let mut guard = self.cache.write().await;
        let cached = guard.as_ref().ok_or(TraktExportError::Unauthenticated)?;
        let refresh_secret = cached
            .token
            .refresh_secret
            .clone()
            .ok_or(TraktExportError::RefreshRequired)?;
        let refreshed = self
            .refresher
            .refresh_token(&refresh_secret)
            .await
            .map_err(|e| TraktExportError::RefreshFailed(e.to_string()))?;
        self.persist(&refreshed).await?;
        *guard = Some(CachedToken {
            token: refreshed,
            origin: TokenOrigin::Structured,
        });
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        let mut guard = self.cache.write().await;
        let _ = self.store.delete(KEY_ACCESS).await;
        let _ = self.store.delete(KEY_REFRESH).await;
        let _ = self.store.delete(KEY_COMPOUND).await;
        let _ = self.store.delete(KEY_LEGACY_ACCESS_TOKEN).await;
        *guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_store::MemoryBackend;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRefresher {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh_token(&self, _refresh_secret: &str) -> Result<Token> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            Ok(Token {
                access_secret: "new-access".into(),
                refresh_secret: Some("new-refresh".into()),
                token_type: "Bearer".into(),
                lifetime_seconds: 3600,
                scope: "public".into(),
                issued_at: Utc::now().timestamp(),
            })
        }
    }

    fn expired_token() -> Token {
        Token {
            access_secret: "old-access".into(),
            refresh_secret: Some("old-refresh".into()),
            token_type: "Bearer".into(),
            lifetime_seconds: 10,
            scope: "public".into(),
            issued_at: Utc::now().timestamp() - 1000,
        }
    }

    #[tokio::test]
    async fn store_then_status_roundtrips() {
        let store = Arc::new(MemoryBackend::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = TokenManager::new(store, CountingRefresher { calls }, None);

        let token = Token {
            access_secret: "abc".into(),
            refresh_secret: Some("def".into()),
            token_type: "Bearer".into(),
            lifetime_seconds: 3600,
            scope: "public".into(),
            issued_at: Utc::now().timestamp(),
        };
        manager.store(token.clone()).await.unwrap();
        let status = manager.status().await;
        assert!(status.has_token);
        assert!(status.is_valid);
        assert_eq!(status.expires_at, Some(token.expires_at()));
    }

    #[tokio::test]
    async fn concurrent_valid_access_secret_refreshes_exactly_once() {
        let store = Arc::new(MemoryBackend::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(TokenManager::new(
            store,
            CountingRefresher {
                calls: calls.clone(),
            },
            None,
        ));
        manager.store(expired_token()).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(
                async move { manager.valid_access_secret().await },
            ));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn refresh_required_when_no_refresh_secret() {
        let store = Arc::new(MemoryBackend::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = TokenManager::new(store, CountingRefresher { calls }, None);
        let mut token = expired_token();
        token.refresh_secret = None;
        manager.store(token).await.unwrap();
        let err = manager.valid_access_secret().await.unwrap_err();
        assert!(matches!(err, TraktExportError::RefreshRequired));
    }

    #[tokio::test]
    async fn legacy_fallback_used_when_no_structured_token() {
        let store = Arc::new(MemoryBackend::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = TokenManager::new(
            store,
            CountingRefresher { calls },
            Some("legacy-secret".to_string()),
        );
        let secret = manager.valid_access_secret().await.unwrap();
        assert_eq!(secret, "legacy-secret");
    }

    #[tokio::test]
    async fn unauthenticated_when_nothing_present() {
        let store = Arc::new(MemoryBackend::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let manager = TokenManager::new(store, CountingRefresher { calls }, None);
        let err = manager.valid_access_secret().await.unwrap_err();
        assert!(matches!(err, TraktExportError::Unauthenticated));
    }
}
