//! Secret lookup
//!
//! Secrets are JSON blobs addressed by name. They come from files under a
//! secrets directory or from `SECRET_<NAME>` environment variables.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::AdvisorError;
use crate::Result;

#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn get_secret(&self, name: &str) -> Result<Value>;
}

/// `<dir>/<name>.json`, falling back to the `SECRET_<NAME>` variable.
pub struct FileSecretStore {
    dir: Option<PathBuf>,
}

impl FileSecretStore {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    fn env_key(name: &str) -> String {
        let normalized: String = name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
            .collect();
        format!("SECRET_{}", normalized)
    }
}

#[async_trait]
impl SecretStore for FileSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Value> {
        if name.is_empty() || name.contains("..") || name.contains('/') {
            return Err(AdvisorError::Validation(format!("invalid secret name: {:?}", name)));
        }

        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{}.json", name));
            match tokio::fs::read_to_string(&path).await {
                Ok(raw) => return Ok(serde_json::from_str(&raw)?),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }

        match std::env::var(Self::env_key(name)) {
            Ok(raw) => Ok(serde_json::from_str(&raw)?),
            Err(_) => Err(AdvisorError::NotFound(format!("secret {}", name))),
        }
    }
}

/// Caches secrets by name for the life of the process.
pub struct CachedSecretStore {
    inner: Arc<dyn SecretStore>,
    cache: Arc<RwLock<HashMap<String, Value>>>,
}

impl CachedSecretStore {
    pub fn new(inner: Arc<dyn SecretStore>) -> Self {
        Self {
            inner,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl SecretStore for CachedSecretStore {
    async fn get_secret(&self, name: &str) -> Result<Value> {
        if let Some(value) = self.cache.read().await.get(name) {
            return Ok(value.clone());
        }

        let value = self.inner.get_secret(name).await?;
        debug!(secret = name, "Secret loaded");
        self.cache
            .write()
            .await
            .insert(name.to_string(), value.clone());
        Ok(value)
    }
}

/// A string field of a secret, e.g. `apiKey`.
pub async fn secret_field(store: &dyn SecretStore, name: &str, field: &str) -> Result<String> {
    let secret = store.get_secret(name).await?;
    secret
        .get(field)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| AdvisorError::Config(format!("secret {} has no field {}", name, field)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStore {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SecretStore for CountingStore {
        async fn get_secret(&self, _name: &str) -> Result<Value> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::json!({"apiKey": "k-123"}))
        }
    }

    #[tokio::test]
    async fn test_cache_hits_inner_store_once() {
        let inner = Arc::new(CountingStore {
            calls: AtomicUsize::new(0),
        });
        let cached = CachedSecretStore::new(inner.clone());

        for _ in 0..3 {
            assert_eq!(secret_field(&cached, "extraction", "apiKey").await.unwrap(), "k-123");
        }
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reads_from_directory() {
        let dir = std::env::temp_dir().join(format!("advisor-secrets-{}", uuid::Uuid::new_v4()));
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("llm-service.json"), r#"{"bearerToken": "abc"}"#)
            .await
            .unwrap();

        let store = FileSecretStore::new(Some(dir.clone()));
        assert_eq!(secret_field(&store, "llm-service", "bearerToken").await.unwrap(), "abc");

        let missing = store.get_secret("absent-secret-name").await.unwrap_err();
        assert_eq!(missing.status_code(), 404);
        assert!(store.get_secret("../etc/passwd").await.is_err());

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[test]
    fn test_env_key_normalizes_name() {
        assert_eq!(FileSecretStore::env_key("llm-service"), "SECRET_LLM_SERVICE");
    }
}
