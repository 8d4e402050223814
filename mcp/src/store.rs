//! Opaque handle store: the narrow interface the core uses for durable-ish
//! state (session blobs, idempotency keys).
//!
//! The core itself is stateless between restarts; anything that must survive
//! lives behind this trait in an external backend. The in-memory
//! implementation covers single-process deployments and tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::RwLock;

/// Default TTL for EXACTLY_ONCE idempotency keys.
pub const IDEMPOTENCY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend: {0}")]
    Backend(String),
}

/// Byte-oriented key/value store with optional expiry.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Returns the stored bytes, or `None` when absent or expired.
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Stores bytes under `id`; `ttl = None` means no expiry.
    async fn put(&self, id: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError>;

    async fn delete(&self, id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct StoredEntry {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredEntry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }
}

/// In-memory store with lazy TTL expiry. Not persistent.
pub struct InMemoryStateStore {
    inner: Arc<RwLock<HashMap<String, StoredEntry>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get(&self, id: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        {
            let map = self.inner.read().await;
            match map.get(id) {
                None => return Ok(None),
                Some(entry) if !entry.expired(now) => return Ok(Some(entry.bytes.clone())),
                Some(_) => {}
            }
        }
        // Expired: drop the entry under the write lock.
        let mut map = self.inner.write().await;
        if map.get(id).map(|e| e.expired(now)).unwrap_or(false) {
            map.remove(id);
        }
        Ok(None)
    }

    async fn put(&self, id: &str, bytes: Vec<u8>, ttl: Option<Duration>) -> Result<(), StoreError> {
        let entry = StoredEntry {
            bytes,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        let mut map = self.inner.write().await;
        map.insert(id.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        let mut map = self.inner.write().await;
        map.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete() {
        let store = InMemoryStateStore::new();
        store.put("k", b"v".to_vec(), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires() {
        let store = InMemoryStateStore::new();
        store
            .put("k", b"v".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn usable_as_trait_object() {
        let store: Arc<dyn StateStore> = Arc::new(InMemoryStateStore::new());
        store.put("k", vec![1, 2, 3], None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1, 2, 3]));
    }
}
