//! C1: key -> string credential storage with pluggable backends.
//!
//! The core only depends on the `CredentialStore` contract; encryption and
//! backend selection are collaborators. Four interchangeable backends:
//! `SecretServiceBackend` (OS-native secret storage, feature-gated),
//! `EnvBackend` (process environment, read-only), `FileBackend` (opaque
//! ciphertext on disk, via a pluggable `CredentialCipher`), and
//! `MemoryBackend` (tests and the no-persistence default).

use async_trait::async_trait;
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::{Arc, RwLock},
};
use tokio::fs;

use crate::errors::{Result, TraktExportError};

#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<String>;
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn delete(&self, key: &str) -> Result<()>;
}

fn not_found(key: &str) -> TraktExportError {
    TraktExportError::NotFound(format!("credential key {key} not found"))
}

/// In-memory backend, useful for tests and as the default when no
/// persistent backend is configured.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<String> {
        self.inner
            .read()
            .expect("credential store lock poisoned")
            .get(key)
            .cloned()
            .ok_or_else(|| not_found(key))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        // A single `write()` lock makes the insert atomic from a concurrent
        // reader's perspective: readers see either the old or the new value.
        self.inner
            .write()
            .expect("credential store lock poisoned")
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = self
            .inner
            .write()
            .expect("credential store lock poisoned")
            .remove(key);
        if removed.is_some() {
            Ok(())
        } else {
            Err(not_found(key))
        }
    }
}

/// Process-environment backend. Read-only: `put`/`delete` always fail, since
/// a process cannot durably rewrite its own parent environment.
#[derive(Clone, Default)]
pub struct EnvBackend {
    prefix: String,
}

impl EnvBackend {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    fn env_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key.to_ascii_uppercase())
    }
}

#[async_trait]
impl CredentialStore for EnvBackend {
    async fn get(&self, key: &str) -> Result<String> {
        std::env::var(self.env_key(key)).map_err(|_| not_found(key))
    }

    async fn put(&self, _key: &str, _value: &str) -> Result<()> {
        Err(TraktExportError::PermissionDenied(
            "environment-backed credential store is read-only".to_string(),
        ))
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        Err(TraktExportError::PermissionDenied(
            "environment-backed credential store is read-only".to_string(),
        ))
    }
}

/// Collaborator interface for the encrypted-file backend's cipher. The core
/// never implements a real cipher; callers supply one (e.g. an AEAD wrapper)
/// that satisfies this contract.
pub trait CredentialCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>>;
}

/// A cipher that performs no transformation. This is the default
/// `CredentialCipher` until a real one is wired in, relying on the file's
/// `0600` permissions rather than ciphertext for protection.
pub struct NoopCipher;

impl CredentialCipher for NoopCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        plaintext.to_vec()
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// File-backed store. The file holds one opaque ciphertext blob that
/// decrypts to a JSON object of key -> value; every mutation rewrites the
/// whole blob via a temp-file-then-rename so concurrent readers never see a
/// partial write.
pub struct FileBackend<C: CredentialCipher> {
    path: PathBuf,
    cipher: C,
    lock: tokio::sync::Mutex<()>,
}

impl<C: CredentialCipher> FileBackend<C> {
    pub fn new(path: PathBuf, cipher: C) -> Self {
        Self {
            path,
            cipher,
            lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn read_map(&self) -> Result<HashMap<String, String>> {
        match fs::read(&self.path).await {
            Ok(bytes) => {
                let plaintext = self.cipher.decrypt(&bytes)?;
                serde_json::from_slice(&plaintext).map_err(Into::into)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_map(&self, map: &HashMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let plaintext = serde_json::to_vec(map)?;
        let ciphertext = self.cipher.encrypt(&plaintext);
        let tmp_path = self.path.with_extension("tmp");
        fs::write(&tmp_path, &ciphertext).await?;
        fs::rename(&tmp_path, &self.path).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o600);
            tokio::fs::set_permissions(&self.path, perms).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl<C: CredentialCipher + Send + Sync> CredentialStore for FileBackend<C> {
    async fn get(&self, key: &str) -> Result<String> {
        let _guard = self.lock.lock().await;
        let map = self.read_map().await?;
        map.get(key).cloned().ok_or_else(|| not_found(key))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await?;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await?;
        if map.remove(key).is_none() {
            return Err(not_found(key));
        }
        self.write_map(&map).await
    }
}

/// OS-native secret storage (macOS Keychain, Windows Credential Manager,
/// the Secret Service on Linux), gated behind the `secret-service` feature
/// since it pulls in a platform-specific backend that isn't available in
/// every build environment (headless CI, containers without a D-Bus
/// session).
#[cfg(feature = "secret-service")]
pub struct SecretServiceBackend {
    service: String,
}

#[cfg(feature = "secret-service")]
impl SecretServiceBackend {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, key: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, key)
            .map_err(|e| TraktExportError::Internal(format!("secret service entry: {e}")))
    }
}

#[cfg(feature = "secret-service")]
#[async_trait]
impl CredentialStore for SecretServiceBackend {
    async fn get(&self, key: &str) -> Result<String> {
        let entry = self.entry(key)?;
        tokio::task::spawn_blocking(move || entry.get_password())
            .await
            .map_err(|e| TraktExportError::Internal(format!("secret service task: {e}")))?
            .map_err(|_| not_found(key))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let entry = self.entry(key)?;
        let value = value.to_string();
        tokio::task::spawn_blocking(move || entry.set_password(&value))
            .await
            .map_err(|e| TraktExportError::Internal(format!("secret service task: {e}")))?
            .map_err(|e| TraktExportError::Internal(format!("secret service write: {e}")))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let entry = self.entry(key)?;
        tokio::task::spawn_blocking(move || entry.delete_credential())
            .await
            .map_err(|e| TraktExportError::Internal(format!("secret service task: {e}")))?
            .map_err(|_| not_found(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_backend_roundtrips() {
        let store = MemoryBackend::new();
        store.put("access", "secret-value").await.unwrap();
        assert_eq!(store.get("access").await.unwrap(), "secret-value");
        store.delete("access").await.unwrap();
        assert!(store.get("access").await.is_err());
    }

    #[tokio::test]
    async fn file_backend_roundtrips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.bin");
        let store = FileBackend::new(path, NoopCipher);
        store.put("refresh", "r-value").await.unwrap();
        assert_eq!(store.get("refresh").await.unwrap(), "r-value");

        // A second handle over the same file sees the persisted value.
        let dir_path = store.path.clone();
        let store2 = FileBackend::new(dir_path, NoopCipher);
        assert_eq!(store2.get("refresh").await.unwrap(), "r-value");
    }

    #[tokio::test]
    async fn env_backend_is_read_only() {
        std::env::set_var("TRAKT_EXPORT_TEST_KEY", "env-value");
        let store = EnvBackend::new("TRAKT_EXPORT_TEST_");
        assert_eq!(store.get("key").await.unwrap(), "env-value");
        assert!(store.put("key", "x").await.is_err());
    }
}
