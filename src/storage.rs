//! Key-value storage backends
//!
//! Session context and monitoring rules persist in an external key-value
//! store. The [`KeyValueStore`] trait keeps the higher layers
//! backend-agnostic: production uses Redis through a multiplexed
//! connection manager, tests use the in-memory implementation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::time::Instant;

use crate::config::KvConfig;
use crate::errors::ChimeraError;

/// Minimal key-value contract needed by the platform: string values,
/// per-key TTLs, prefix scans.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetches a value. `None` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, ChimeraError>;

    /// Stores a value without expiry.
    async fn set(&self, key: &str, value: &str) -> Result<(), ChimeraError>;

    /// Stores a value with a TTL.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ChimeraError>;

    /// Removes a key. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), ChimeraError>;

    /// Resets the TTL of an existing key. Returns false when the key does
    /// not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ChimeraError>;

    /// Lists all keys with the given prefix.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, ChimeraError>;
}

/// Redis-backed store using a multiplexed connection manager that
/// transparently reconnects.
#[derive(Clone)]
pub struct RedisStore {
    manager: redis::aio::ConnectionManager,
}

impl RedisStore {
    /// Connects to the configured Redis instance.
    ///
    /// # Errors
    /// Returns a cache error when the connection cannot be established.
    pub async fn connect(config: &KvConfig) -> Result<Self, ChimeraError> {
        let client = redis::Client::open(config.redis_url())?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ChimeraError> {
        let mut con = self.manager.clone();
        let value: Option<String> = con.get(key).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ChimeraError> {
        let mut con = self.manager.clone();
        let _: () = con.set(key, value).await?;
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ChimeraError> {
        let mut con = self.manager.clone();
        let _: () = con.set_ex(key, value, ttl.as_secs()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ChimeraError> {
        let mut con = self.manager.clone();
        let _: () = con.del(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ChimeraError> {
        let mut con = self.manager.clone();
        let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
        let updated: bool = con.expire(key, ttl_secs).await?;
        Ok(updated)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, ChimeraError> {
        let mut con = self.manager.clone();
        let pattern = format!("{prefix}*");
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut con)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }
}

struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-memory store with lazy TTL expiry, used in tests and local
/// development without a Redis instance.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, MemoryEntry>>,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, ChimeraError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), ChimeraError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), ChimeraError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ChimeraError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, ChimeraError> {
        let mut entries = self.entries.lock().map_err(|_| poisoned())?;
        match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, ChimeraError> {
        let entries = self.entries.lock().map_err(|_| poisoned())?;
        Ok(entries
            .iter()
            .filter(|(key, entry)| key.starts_with(prefix) && !entry.is_expired())
            .map(|(key, _)| key.clone())
            .collect())
    }
}

fn poisoned() -> ChimeraError {
    ChimeraError::system("key-value store lock poisoned")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_set_get_delete() {
        let store = MemoryStore::new();
        store.set("a", "1").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some("1".to_string()));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("session", "ctx", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(store.get("session").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(store.get("session").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_memory_store_expire_extends_ttl() {
        let store = MemoryStore::new();
        store
            .set_with_ttl("k", "v", Duration::from_secs(10))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(8)).await;
        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());

        tokio::time::advance(Duration::from_secs(8)).await;
        assert_eq!(store.get("k").await.unwrap(), Some("v".to_string()));
    }

    #[tokio::test]
    async fn test_memory_store_expire_missing_key() {
        let store = MemoryStore::new();
        assert!(!store.expire("absent", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_scan_prefix() {
        let store = MemoryStore::new();
        store.set("monitoring:rule:a", "{}").await.unwrap();
        store.set("monitoring:rule:b", "{}").await.unwrap();
        store.set("chimera:context:s1", "{}").await.unwrap();

        let mut keys = store.scan_prefix("monitoring:rule:").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["monitoring:rule:a", "monitoring:rule:b"]);
    }
}
