//! Shared keyed store abstraction.
//!
//! The store is the single source of truth for lobby and session
//! records; every in-process cache layered on top is a disposable
//! accelerator. The trait only requires the primitives the registries
//! actually lean on: per-key expiry, an atomic conditional set for
//! mutual exclusion, and batched writes with all-or-nothing visibility.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

#[async_trait]
pub trait KeyedStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Unconditional write with a fresh TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Atomic set-if-absent. Returns true when this caller claimed the
    /// key. This is the mutual-exclusion primitive behind "one lobby
    /// per creator".
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError>;

    /// Batched write; readers observe either all entries or none.
    async fn set_many(&self, entries: Vec<(String, String, Duration)>) -> Result<(), StoreError>;

    /// Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Single-batch delete of several keys, same idempotency.
    async fn delete_many(&self, keys: Vec<String>) -> Result<(), StoreError>;

    /// TTL keepalive. Returns false when the key no longer exists.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;
}
