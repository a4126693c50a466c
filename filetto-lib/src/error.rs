use thiserror::Error;

/// Failures surfaced by a [`crate::store::store::KeyedStore`]
/// implementation. These never cross the registry boundary; registries
/// convert them into [`CoordinatorError`] or degrade reads to
/// "not found" after logging.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("record serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("{0}")]
    Backend(String),
}

/// Error taxonomy visible to the connection coordinator and, through it,
/// to clients. Move-time expiry is deliberately absent: it is a
/// resolution outcome, not an error (see
/// [`crate::session::MoveOutcome`]).
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("you already have an open lobby")]
    DuplicateLobby { existing: Option<String> },

    #[error("lobby creation limit reached, try again shortly")]
    RateLimited,

    #[error("lobby not found")]
    LobbyNotFound,

    #[error("game session not found")]
    SessionNotFound,

    #[error("not your turn")]
    NotYourTurn,

    #[error("invalid board position")]
    InvalidPosition,

    #[error("storage failure, try again")]
    Storage(#[from] StoreError),
}

impl CoordinatorError {
    /// True for failures the requester can recover from by retrying
    /// later; terminal lookups and turn violations are not retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinatorError::RateLimited | CoordinatorError::Storage(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_messages_do_not_leak_backend_detail() {
        let err = CoordinatorError::Storage(StoreError::Backend("ECONNREFUSED 10.0.0.7".into()));
        assert_eq!(err.to_string(), "storage failure, try again");
    }

    #[test]
    fn retryability() {
        assert!(CoordinatorError::RateLimited.is_retryable());
        assert!(!CoordinatorError::NotYourTurn.is_retryable());
        assert!(!CoordinatorError::SessionNotFound.is_retryable());
    }
}
