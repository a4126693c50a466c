//! Lobby lifecycle against the shared keyed store.
//!
//! The store owns every lobby: a primary record under `lobby:{id}` and a
//! mutual-exclusion index under `creator:{userId}`, written with matching
//! TTLs. The in-process cache only saves round-trips; a cache hit whose
//! backing record is gone means the lobby is gone.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CoordinatorError, StoreError};
use crate::keys;
use crate::model::{Lobby, LobbyStatus};
use crate::rate_limit::RateLimiter;
use crate::store::store::KeyedStore;

pub struct LobbyRegistry<T: KeyedStore> {
    store: Arc<T>,
    limiter: Arc<RateLimiter>,
    cache: Mutex<HashMap<String, Lobby>>,
}

impl<T: KeyedStore> LobbyRegistry<T> {
    pub fn new(store: Arc<T>, limiter: Arc<RateLimiter>) -> Self {
        Self {
            store,
            limiter,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Create a lobby for `creator_id`, enforcing one open lobby per
    /// creator via an atomic claim on the creator index.
    ///
    /// The claim is written first with a sentinel value; the primary
    /// record and the real index value then land in one batch. A failed
    /// batch releases the claim so the creator is never locked out by a
    /// half-applied creation.
    pub async fn create_lobby(&self, creator_id: &str) -> Result<Lobby, CoordinatorError> {
        if !self.limiter.allow(creator_id).await {
            counter!("filetto_rate_limited_total").increment(1);
            return Err(CoordinatorError::RateLimited);
        }

        let index_key = keys::creator_index_key(creator_id);
        let claimed = self
            .store
            .set_if_absent(&index_key, keys::CREATE_SENTINEL, keys::RECORD_TTL)
            .await?;
        if !claimed {
            let existing = match self.store.get(&index_key).await {
                Ok(Some(id)) if id != keys::CREATE_SENTINEL => Some(id),
                Ok(_) => None,
                Err(err) => {
                    warn!("{}: failed to read existing lobby id: {}", creator_id, err);
                    None
                }
            };
            debug!("{}: already owns lobby {:?}", creator_id, existing);
            return Err(CoordinatorError::DuplicateLobby { existing });
        }

        let lobby = Lobby::new(creator_id);
        let record = serde_json::to_string(&lobby).map_err(StoreError::from)?;
        let batch = vec![
            (keys::lobby_key(&lobby.id), record, keys::RECORD_TTL),
            (index_key.clone(), lobby.id.clone(), keys::RECORD_TTL),
        ];
        if let Err(err) = self.store.set_many(batch).await {
            warn!(
                "{}: lobby record write failed, releasing creator claim: {}",
                creator_id, err
            );
            if let Err(cleanup) = self.store.delete(&index_key).await {
                warn!("{}: creator claim cleanup failed: {}", creator_id, cleanup);
            }
            return Err(CoordinatorError::Storage(err));
        }

        self.cache
            .lock()
            .await
            .insert(lobby.id.clone(), lobby.clone());
        counter!("filetto_lobbies_created_total").increment(1);
        debug!("{}: created lobby {}", creator_id, lobby.id);
        Ok(lobby)
    }

    /// Cache-first lookup by creator, falling back to the index, then
    /// the primary record. A dangling index (primary expired or deleted
    /// elsewhere) is removed on the way out.
    pub async fn find_lobby_by_creator(&self, creator_id: &str) -> Option<Lobby> {
        let cached_id = {
            let cache = self.cache.lock().await;
            cache
                .values()
                .find(|lobby| lobby.creator_id == creator_id)
                .map(|lobby| lobby.id.clone())
        };
        if let Some(id) = cached_id {
            if let Some(lobby) = self.load_and_refresh(&id).await {
                return Some(lobby);
            }
            // Backing record is gone; the cached entry lied.
            self.cache.lock().await.remove(&id);
        }

        let index_key = keys::creator_index_key(creator_id);
        let lobby_id = match self.store.get(&index_key).await {
            Ok(Some(id)) if id != keys::CREATE_SENTINEL => id,
            Ok(_) => return None,
            Err(err) => {
                warn!("{}: creator index read failed: {}", creator_id, err);
                return None;
            }
        };
        match self.load_and_refresh(&lobby_id).await {
            Some(lobby) => Some(lobby),
            None => {
                debug!(
                    "{}: index points at missing lobby {}, removing stale index",
                    creator_id, lobby_id
                );
                if let Err(err) = self.store.delete(&index_key).await {
                    warn!("{}: stale index cleanup failed: {}", creator_id, err);
                }
                None
            }
        }
    }

    /// Lookup by id with the same cache/authority rules.
    pub async fn find_lobby(&self, lobby_id: &str) -> Option<Lobby> {
        let lobby = self.load_and_refresh(lobby_id).await;
        if lobby.is_none() {
            self.cache.lock().await.remove(lobby_id);
        }
        lobby
    }

    /// Flip an active lobby to pending while its creator is within the
    /// reconnect grace window. A short-TTL marker key exposes the
    /// remaining grace time to other readers.
    pub async fn mark_pending(&self, lobby_id: &str) -> Result<Lobby, CoordinatorError> {
        self.set_status(lobby_id, LobbyStatus::Pending).await
    }

    /// Undo [`mark_pending`](Self::mark_pending) on timely reconnect.
    pub async fn restore(&self, lobby_id: &str) -> Result<Lobby, CoordinatorError> {
        self.set_status(lobby_id, LobbyStatus::Active).await
    }

    async fn set_status(
        &self,
        lobby_id: &str,
        status: LobbyStatus,
    ) -> Result<Lobby, CoordinatorError> {
        let mut lobby = self
            .load_and_refresh(lobby_id)
            .await
            .ok_or(CoordinatorError::LobbyNotFound)?;
        lobby.status = status;
        let record = serde_json::to_string(&lobby).map_err(StoreError::from)?;
        let mut batch = vec![(keys::lobby_key(lobby_id), record, keys::RECORD_TTL)];
        if status == LobbyStatus::Pending {
            batch.push((
                keys::pending_key(lobby_id),
                lobby.creator_id.clone(),
                keys::GRACE_PERIOD,
            ));
        }
        self.store.set_many(batch).await?;
        if status != LobbyStatus::Pending {
            if let Err(err) = self.store.delete(&keys::pending_key(lobby_id)).await {
                warn!("{}: pending marker cleanup failed: {}", lobby_id, err);
            }
        }
        self.cache
            .lock()
            .await
            .insert(lobby_id.to_string(), lobby.clone());
        debug!("{}: lobby status -> {:?}", lobby_id, status);
        Ok(lobby)
    }

    /// Remove a lobby and its creator index in one batch. Idempotent:
    /// deleting an already-gone lobby succeeds quietly. Also reopens the
    /// creator's rate-limit window so they can recreate immediately.
    pub async fn delete_lobby(&self, lobby_id: &str) -> Result<(), CoordinatorError> {
        let known = {
            let cache = self.cache.lock().await;
            cache.get(lobby_id).cloned()
        };
        let known = match known {
            Some(lobby) => Some(lobby),
            None => self.load(lobby_id).await,
        };

        let mut batch = vec![keys::lobby_key(lobby_id), keys::pending_key(lobby_id)];
        if let Some(lobby) = &known {
            batch.push(keys::creator_index_key(&lobby.creator_id));
        }
        self.store.delete_many(batch).await?;

        self.cache.lock().await.remove(lobby_id);
        if let Some(lobby) = &known {
            self.limiter.clear(&lobby.creator_id).await;
        }
        counter!("filetto_lobbies_deleted_total").increment(1);
        debug!("{}: lobby deleted", lobby_id);
        Ok(())
    }

    /// Sweeper entry point: drop cached lobbies whose primary record or
    /// creator index has disappeared from the store. Returns how many
    /// entries were reconciled.
    pub async fn reconcile_cache(&self) -> usize {
        let snapshot: Vec<Lobby> = self.cache.lock().await.values().cloned().collect();
        let mut reconciled = 0;
        for lobby in snapshot {
            let primary = self.store.exists(&keys::lobby_key(&lobby.id)).await;
            let index = self
                .store
                .exists(&keys::creator_index_key(&lobby.creator_id))
                .await;
            match (primary, index) {
                (Ok(true), Ok(true)) => {}
                (Ok(_), Ok(_)) => {
                    debug!("{}: backing keys missing, reconciling", lobby.id);
                    if let Err(err) = self.delete_lobby(&lobby.id).await {
                        warn!("{}: reconcile delete failed: {}", lobby.id, err);
                    }
                    reconciled += 1;
                }
                // Unknown store state; leave the entry for the next pass.
                _ => {}
            }
        }
        if reconciled > 0 {
            counter!("filetto_cache_reconciled_total").increment(reconciled as u64);
        }
        reconciled
    }

    /// Read the primary record without touching TTLs.
    async fn load(&self, lobby_id: &str) -> Option<Lobby> {
        let raw = match self.store.get(&keys::lobby_key(lobby_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(err) => {
                warn!("{}: lobby read failed: {}", lobby_id, err);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(lobby) => Some(lobby),
            Err(err) => {
                warn!("{}: undecodable lobby record: {}", lobby_id, err);
                None
            }
        }
    }

    /// Read the primary record and, on success, refresh both TTLs
    /// (keepalive-on-access) and the cache.
    async fn load_and_refresh(&self, lobby_id: &str) -> Option<Lobby> {
        let lobby = self.load(lobby_id).await?;
        if let Err(err) = self
            .store
            .expire(&keys::lobby_key(lobby_id), keys::RECORD_TTL)
            .await
        {
            warn!("{}: lobby keepalive failed: {}", lobby_id, err);
        }
        if let Err(err) = self
            .store
            .expire(&keys::creator_index_key(&lobby.creator_id), keys::RECORD_TTL)
            .await
        {
            warn!("{}: index keepalive failed: {}", lobby_id, err);
        }
        self.cache
            .lock()
            .await
            .insert(lobby_id.to_string(), lobby.clone());
        Some(lobby)
    }
}
