//! In-process [`KeyedStore`] with per-key deadlines.
//!
//! Backs tests and the `--store-disable` single-node mode. Expiry is
//! lazy: a key past its deadline is treated as absent on the next
//! access and removed then.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::StoreError;
use crate::store::store::KeyedStore;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(entries: &'a HashMap<String, Entry>, key: &str) -> Option<&'a Entry> {
        entries
            .get(key)
            .filter(|entry| entry.expires_at > Instant::now())
    }

    fn drop_dead(entries: &mut HashMap<String, Entry>, key: &str) {
        if entries
            .get(key)
            .is_some_and(|entry| entry.expires_at <= Instant::now())
        {
            entries.remove(key);
        }
    }
}

#[async_trait]
impl KeyedStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock().await;
        Self::drop_dead(&mut entries, key);
        Ok(Self::live(&entries, key).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        Self::drop_dead(&mut entries, key);
        if Self::live(&entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn set_many(&self, batch: Vec<(String, String, Duration)>) -> Result<(), StoreError> {
        // All writes land under one lock acquisition, so readers never
        // observe a partially applied batch.
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        for (key, value, ttl) in batch {
            entries.insert(
                key,
                Entry {
                    value,
                    expires_at: now + ttl,
                },
            );
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn delete_many(&self, keys: Vec<String>) -> Result<(), StoreError> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(&key);
        }
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        Self::drop_dead(&mut entries, key);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = Instant::now() + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock().await;
        Self::drop_dead(&mut entries, key);
        Ok(Self::live(&entries, key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn expired_keys_read_as_absent() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Duration::from_millis(20))
            .await
            .unwrap();
        sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(!store.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn set_if_absent_claims_once() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("k", "a", Duration::from_secs(10))
            .await
            .unwrap());
        assert!(!store
            .set_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn set_if_absent_reclaims_after_expiry() {
        let store = MemoryStore::new();
        assert!(store
            .set_if_absent("k", "a", Duration::from_millis(20))
            .await
            .unwrap());
        sleep(Duration::from_millis(40)).await;
        assert!(store
            .set_if_absent("k", "b", Duration::from_secs(10))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn expire_refreshes_and_reports_existence() {
        let store = MemoryStore::new();
        store
            .set("k", "v", Duration::from_millis(30))
            .await
            .unwrap();
        assert!(store.expire("k", Duration::from_secs(10)).await.unwrap());
        sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(!store.expire("missing", Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn deletes_are_idempotent() {
        let store = MemoryStore::new();
        store.set("k", "v", Duration::from_secs(10)).await.unwrap();
        store.delete("k").await.unwrap();
        store.delete("k").await.unwrap();
        store
            .delete_many(vec!["k".into(), "also-missing".into()])
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }
}
