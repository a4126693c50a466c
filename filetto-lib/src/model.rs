//! Domain records persisted to the shared keyed store.
//!
//! Records serialize to camelCase JSON, matching the wire protocol, so a
//! record read back from the store can be embedded into an outbound event
//! without a translation layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const BOARD_SIZE: usize = 15;
pub const BOARD_CELLS: usize = BOARD_SIZE * BOARD_SIZE;

/// Wall-clock milliseconds since the Unix epoch. All protocol timestamps
/// use this unit.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Fresh lobby identifier. v7 UUIDs are time-ordered, which keeps store
/// scans and logs roughly chronological; nothing relies on sortability.
pub fn new_lobby_id() -> String {
    Uuid::now_v7().to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyStatus {
    Active,
    Pending,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lobby {
    pub id: String,
    pub creator_id: String,
    pub opponent_id: Option<String>,
    pub status: LobbyStatus,
    pub created_at: i64,
}

impl Lobby {
    pub fn new(creator_id: &str) -> Self {
        Self {
            id: new_lobby_id(),
            creator_id: creator_id.to_string(),
            opponent_id: None,
            status: LobbyStatus::Active,
            created_at: now_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Marker {
    X,
    O,
}

impl Marker {
    pub fn other(self) -> Self {
        match self {
            Marker::X => Marker::O,
            Marker::O => Marker::X,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndReason {
    Win,
    Timeout,
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSession {
    pub id: String,
    pub creator_id: String,
    pub opponent_id: String,
    pub creator_marker: Marker,
    pub opponent_marker: Marker,
    pub current_turn: String,
    pub board: Vec<Option<Marker>>,
    pub num_moves: u32,
    pub started_at: i64,
    pub last_move_time: i64,
    /// Elapsed clock for the creator, accumulated server-side from move
    /// timestamp deltas.
    pub player_time_1: u64,
    /// Elapsed clock for the opponent, same accounting.
    pub player_time_2: u64,
}

impl GameSession {
    /// Build the session produced by a lobby handoff. The session keeps
    /// the lobby's id so the handoff stays traceable; the creator moves
    /// first.
    pub fn new(
        lobby_id: &str,
        creator_id: &str,
        opponent_id: &str,
        creator_marker: Marker,
        started_at: i64,
    ) -> Self {
        Self {
            id: lobby_id.to_string(),
            creator_id: creator_id.to_string(),
            opponent_id: opponent_id.to_string(),
            creator_marker,
            opponent_marker: creator_marker.other(),
            current_turn: creator_id.to_string(),
            board: vec![None; BOARD_CELLS],
            num_moves: 0,
            started_at,
            last_move_time: started_at,
            player_time_1: 0,
            player_time_2: 0,
        }
    }

    pub fn is_participant(&self, user_id: &str) -> bool {
        self.creator_id == user_id || self.opponent_id == user_id
    }

    pub fn marker_of(&self, user_id: &str) -> Option<Marker> {
        if self.creator_id == user_id {
            Some(self.creator_marker)
        } else if self.opponent_id == user_id {
            Some(self.opponent_marker)
        } else {
            None
        }
    }

    pub fn opponent_of(&self, user_id: &str) -> Option<&str> {
        if self.creator_id == user_id {
            Some(&self.opponent_id)
        } else if self.opponent_id == user_id {
            Some(&self.creator_id)
        } else {
            None
        }
    }

    /// Charge elapsed milliseconds to whichever player just moved.
    pub fn charge_clock(&mut self, user_id: &str, elapsed_ms: u64) {
        if self.creator_id == user_id {
            self.player_time_1 += elapsed_ms;
        } else if self.opponent_id == user_id {
            self.player_time_2 += elapsed_ms;
        }
    }
}

/// Terminal statistics handed to the result sink when a session resolves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameSummary {
    pub session_id: String,
    pub creator_id: String,
    pub opponent_id: String,
    pub winner_id: Option<String>,
    pub reason: EndReason,
    pub num_moves: u32,
    pub total_time_ms: i64,
    pub creator_time_ms: u64,
    pub opponent_time_ms: u64,
    pub ended_at: i64,
}

impl GameSummary {
    pub fn from_session(
        session: &GameSession,
        winner_id: Option<&str>,
        reason: EndReason,
        ended_at: i64,
    ) -> Self {
        Self {
            session_id: session.id.clone(),
            creator_id: session.creator_id.clone(),
            opponent_id: session.opponent_id.clone(),
            winner_id: winner_id.map(str::to_string),
            reason,
            num_moves: session.num_moves,
            total_time_ms: ended_at.saturating_sub(session.started_at),
            creator_time_ms: session.player_time_1,
            opponent_time_ms: session.player_time_2,
            ended_at,
        }
    }
}
