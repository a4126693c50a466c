//! Key construction and timing constants for the shared keyed store.
//!
//! Every component goes through these helpers; nothing else in the
//! workspace concatenates store keys by hand.

use std::time::Duration;

/// TTL applied to primary records and the creator index, refreshed on
/// every successful read or write touching the entity.
pub const RECORD_TTL: Duration = Duration::from_millis(180_000);

/// Reconnect window after a transport close. The `pending:{id}` marker
/// carries this TTL independently of the primary record.
pub const GRACE_PERIOD: Duration = Duration::from_millis(30_000);

/// A player forfeits by clock when their move arrives more than this many
/// milliseconds after the previous move.
pub const MAX_MOVE_TIME_MS: i64 = 30_000;

/// Lobby-creation rate limit: at most `RATE_LIMIT_MAX_CREATES` per user
/// per window.
pub const RATE_LIMIT_WINDOW: Duration = Duration::from_millis(60_000);
pub const RATE_LIMIT_MAX_CREATES: u32 = 1;

/// Cleanup sweep cadence. Self-healing only; correctness never depends
/// on this timer.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Index value written while a creation is between the mutual-exclusion
/// claim and the batched record write.
pub const CREATE_SENTINEL: &str = "*";

pub fn lobby_key(lobby_id: &str) -> String {
    format!("lobby:{}", lobby_id)
}

pub fn creator_index_key(user_id: &str) -> String {
    format!("creator:{}", user_id)
}

pub fn session_key(session_id: &str) -> String {
    format!("session:{}", session_id)
}

pub fn pending_key(room_id: &str) -> String {
    format!("pending:{}", room_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced() {
        assert_eq!(lobby_key("abc"), "lobby:abc");
        assert_eq!(creator_index_key("u1"), "creator:u1");
        assert_eq!(session_key("abc"), "session:abc");
        assert_eq!(pending_key("abc"), "pending:abc");
    }

    #[test]
    fn grace_marker_is_shorter_than_records() {
        assert!(GRACE_PERIOD < RECORD_TTL);
    }
}
