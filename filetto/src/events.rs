//! JSON wire protocol spoken over the WebSocket.
//!
//! Inbound and outbound payloads are externally tagged with `type`,
//! camelCase throughout. Domain records embed directly (they already
//! serialize camelCase), so a reconnect replay is exactly the stored
//! snapshot.

use serde::{Deserialize, Serialize};

use filetto_lib::model::{EndReason, GameSession, GameSummary, Lobby, Marker};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientEvent {
    /// First frame on every connection; everything else is rejected
    /// until it succeeds.
    Auth { token: String },
    CreateLobby,
    #[serde(rename_all = "camelCase")]
    JoinLobby { lobby_id: String },
    CancelLobby,
    #[serde(rename_all = "camelCase")]
    MakeMove {
        session_id: String,
        position: usize,
        timestamp: i64,
    },
    #[serde(rename_all = "camelCase")]
    ClockUpdate {
        session_id: String,
        player_time_1: u64,
        player_time_2: u64,
    },
    #[serde(rename_all = "camelCase")]
    TimeExpired { session_id: String },
    Ping,
}

impl ClientEvent {
    /// Stable label for the per-event dispatch counter.
    pub fn label(&self) -> &'static str {
        match self {
            ClientEvent::Auth { .. } => "auth",
            ClientEvent::CreateLobby => "create_lobby",
            ClientEvent::JoinLobby { .. } => "join_lobby",
            ClientEvent::CancelLobby => "cancel_lobby",
            ClientEvent::MakeMove { .. } => "make_move",
            ClientEvent::ClockUpdate { .. } => "clock_update",
            ClientEvent::TimeExpired { .. } => "time_expired",
            ClientEvent::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    AuthOk {
        user_id: String,
        display_name: String,
    },
    LobbyReady { lobby: Lobby },
    LobbyDeleted { reason: String },
    #[serde(rename_all = "camelCase")]
    GameStart {
        session: GameSession,
        marker: Marker,
    },
    GameState { session: GameSession },
    #[serde(rename_all = "camelCase")]
    MoveMade {
        player_id: String,
        position: usize,
        marker: Marker,
        current_turn: String,
        num_moves: u32,
    },
    #[serde(rename_all = "camelCase")]
    PlayerDisconnected { user_id: String },
    #[serde(rename_all = "camelCase")]
    GameEnded {
        winner_id: Option<String>,
        reason: EndReason,
        summary: GameSummary,
    },
    Pong,
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_events_decode_from_camel_case() {
        let event: ClientEvent =
            serde_json::from_str(r#"{"type":"joinLobby","lobbyId":"l-7"}"#).unwrap();
        assert_eq!(
            event,
            ClientEvent::JoinLobby {
                lobby_id: "l-7".into()
            }
        );

        let event: ClientEvent = serde_json::from_str(
            r#"{"type":"makeMove","sessionId":"s-1","position":112,"timestamp":1700000000000}"#,
        )
        .unwrap();
        assert_eq!(
            event,
            ClientEvent::MakeMove {
                session_id: "s-1".into(),
                position: 112,
                timestamp: 1_700_000_000_000,
            }
        );
    }

    #[test]
    fn unknown_event_types_fail_to_decode() {
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"adminReset"}"#).is_err());
    }

    #[test]
    fn server_errors_serialize_with_structured_shape() {
        let raw = serde_json::to_string(&ServerEvent::Error {
            message: "not your turn".into(),
        })
        .unwrap();
        assert_eq!(raw, r#"{"type":"error","message":"not your turn"}"#);
    }

    #[test]
    fn game_ended_carries_the_reason_string() {
        let session = GameSession::new("s-1", "alice", "bob", Marker::X, 0);
        let summary = GameSummary::from_session(&session, Some("bob"), EndReason::Disconnect, 10);
        let raw = serde_json::to_string(&ServerEvent::GameEnded {
            winner_id: summary.winner_id.clone(),
            reason: EndReason::Disconnect,
            summary,
        })
        .unwrap();
        assert!(raw.contains(r#""reason":"disconnect""#));
        assert!(raw.contains(r#""winnerId":"bob""#));
    }
}
