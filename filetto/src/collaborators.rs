//! External collaborator seams: profile persistence and invite
//! delivery. The server consumes these interfaces; the reference
//! implementations here keep a single-node deployment self-contained.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Profile {
    pub user_id: String,
    pub display_name: String,
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    /// Upsert the user's profile record and return its current fields.
    async fn ensure_user(&self, user_id: &str, display_name: Option<&str>) -> Result<Profile>;
}

#[async_trait]
pub trait InviteSender: Send + Sync {
    /// Deliver a lobby invite to the user's messaging channel. Returns
    /// the delivery message id.
    async fn send_invite(&self, user_id: &str, lobby_id: &str) -> Result<String>;
}

/// Process-local profile store; display name defaults to the user id.
#[derive(Default)]
pub struct LocalProfileStore {
    profiles: Mutex<HashMap<String, Profile>>,
}

impl LocalProfileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProfileStore for LocalProfileStore {
    async fn ensure_user(&self, user_id: &str, display_name: Option<&str>) -> Result<Profile> {
        let mut profiles = self.profiles.lock().await;
        let profile = profiles
            .entry(user_id.to_string())
            .or_insert_with(|| Profile {
                user_id: user_id.to_string(),
                display_name: user_id.to_string(),
            });
        if let Some(name) = display_name {
            profile.display_name = name.to_string();
        }
        Ok(profile.clone())
    }
}

/// Invite delivery that only logs; the messaging-platform bridge is an
/// external deployment concern.
pub struct LogInviteSender;

#[async_trait]
impl InviteSender for LogInviteSender {
    async fn send_invite(&self, user_id: &str, lobby_id: &str) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        info!(
            "{}: invite for lobby {} dispatched as message {}",
            user_id, lobby_id, message_id
        );
        Ok(message_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_user_upserts_and_keeps_names() {
        let store = LocalProfileStore::new();
        let first = store.ensure_user("alice", None).await.unwrap();
        assert_eq!(first.display_name, "alice");
        let renamed = store.ensure_user("alice", Some("Alice A.")).await.unwrap();
        assert_eq!(renamed.display_name, "Alice A.");
        let again = store.ensure_user("alice", None).await.unwrap();
        assert_eq!(again.display_name, "Alice A.");
    }
}
