//! Game-session lifecycle: handoff creation, the move state machine,
//! timeout resolution, and terminal teardown.
//!
//! Updates are last-writer-wins; two near-simultaneous move submissions
//! are resolved by the turn-flip invariant, not by locking. Per-turn
//! elapsed time is derived server-side from `last_move_time` deltas;
//! client-reported clock totals are never trusted for resolution.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CoordinatorError, StoreError};
use crate::keys;
use crate::model::{now_ms, EndReason, GameSession, GameSummary, Marker, BOARD_CELLS};
use crate::results::ResultSink;
use crate::store::store::KeyedStore;

/// What became of a submitted move.
#[derive(Debug)]
pub enum MoveOutcome {
    /// The move was applied; the updated session is attached.
    Applied(GameSession),
    /// The mover overran the move clock. Their move was not applied and
    /// the session must resolve as a timeout loss for them.
    TimedOut {
        session: GameSession,
        winner_id: String,
    },
}

pub struct SessionRegistry<T: KeyedStore, S: ResultSink> {
    store: Arc<T>,
    results: S,
    cache: Mutex<HashMap<String, GameSession>>,
}

impl<T: KeyedStore, S: ResultSink> SessionRegistry<T, S> {
    pub fn new(store: Arc<T>, results: S) -> Self {
        Self {
            store,
            results,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Create the session a lobby hands off into. The session reuses the
    /// lobby's id. The caller is responsible for having verified the
    /// lobby (active, no opponent yet) and for superseding it afterwards.
    pub async fn create_game_session(
        &self,
        lobby_id: &str,
        creator_id: &str,
        opponent_id: &str,
        creator_marker: Marker,
        started_at: i64,
    ) -> Result<GameSession, CoordinatorError> {
        let session = GameSession::new(lobby_id, creator_id, opponent_id, creator_marker, started_at);
        self.persist(&session).await?;
        counter!("filetto_sessions_started_total").increment(1);
        debug!(
            "{}: session started, {} (as {:?}) vs {}",
            session.id, creator_id, creator_marker, opponent_id
        );
        Ok(session)
    }

    /// Authoritative snapshot, TTL refreshed. Used for reconnect replay.
    pub async fn get(&self, session_id: &str) -> Option<GameSession> {
        self.load_and_refresh(session_id).await
    }

    /// Apply `player_id`'s move at `position`, stamped `move_ts` by the
    /// client in wall-clock milliseconds.
    pub async fn apply_move(
        &self,
        session_id: &str,
        player_id: &str,
        position: usize,
        move_ts: i64,
    ) -> Result<MoveOutcome, CoordinatorError> {
        let mut session = self
            .load_and_refresh(session_id)
            .await
            .ok_or(CoordinatorError::SessionNotFound)?;

        if session.current_turn != player_id || !session.is_participant(player_id) {
            return Err(CoordinatorError::NotYourTurn);
        }

        let elapsed = move_ts.saturating_sub(session.last_move_time).max(0);
        if elapsed > keys::MAX_MOVE_TIME_MS {
            let winner_id = session
                .opponent_of(player_id)
                .unwrap_or_default()
                .to_string();
            debug!(
                "{}: {} overran the move clock by {}ms",
                session_id,
                player_id,
                elapsed - keys::MAX_MOVE_TIME_MS
            );
            return Ok(MoveOutcome::TimedOut { session, winner_id });
        }

        if position >= BOARD_CELLS || session.board[position].is_some() {
            return Err(CoordinatorError::InvalidPosition);
        }

        let marker = session
            .marker_of(player_id)
            .ok_or(CoordinatorError::NotYourTurn)?;
        session.board[position] = Some(marker);
        session.charge_clock(player_id, elapsed as u64);
        session.current_turn = session
            .opponent_of(player_id)
            .unwrap_or_default()
            .to_string();
        session.last_move_time = session.last_move_time.max(move_ts);
        session.num_moves += 1;

        self.persist(&session).await?;
        counter!("filetto_moves_total").increment(1);
        Ok(MoveOutcome::Applied(session))
    }

    /// Server-side verification of a "time expired" claim: resolves only
    /// if the wall clock really is past the current player's budget.
    /// Returns the session and the winner when the claim holds.
    pub async fn check_timeout(
        &self,
        session_id: &str,
        now: i64,
    ) -> Result<Option<(GameSession, String)>, CoordinatorError> {
        let session = self
            .load_and_refresh(session_id)
            .await
            .ok_or(CoordinatorError::SessionNotFound)?;
        let elapsed = now.saturating_sub(session.last_move_time);
        if elapsed <= keys::MAX_MOVE_TIME_MS {
            debug!(
                "{}: timeout claim rejected, only {}ms elapsed",
                session_id, elapsed
            );
            return Ok(None);
        }
        let winner_id = session
            .opponent_of(&session.current_turn)
            .unwrap_or_default()
            .to_string();
        Ok(Some((session, winner_id)))
    }

    /// Keepalive driven by a client clock report. The reported values
    /// are a UI hint only; the snapshot returned (and re-broadcast) is
    /// the server-side accounting.
    pub async fn refresh_clocks(
        &self,
        session_id: &str,
        reported: (u64, u64),
    ) -> Result<GameSession, CoordinatorError> {
        let session = self
            .load_and_refresh(session_id)
            .await
            .ok_or(CoordinatorError::SessionNotFound)?;
        debug!(
            "{}: client reports clocks {:?}, server has ({}, {})",
            session_id, reported, session.player_time_1, session.player_time_2
        );
        Ok(session)
    }

    /// Terminal transition: hand the summary to the result sink, then
    /// remove the record. A second invocation finds no record and
    /// reports `SessionNotFound`, which callers treat as "already
    /// resolved".
    pub async fn end_game_session(
        &self,
        session_id: &str,
        winner_id: Option<&str>,
        reason: EndReason,
    ) -> Result<GameSummary, CoordinatorError> {
        let session = self
            .load(session_id)
            .await
            .ok_or(CoordinatorError::SessionNotFound)?;
        let summary = GameSummary::from_session(&session, winner_id, reason, now_ms());
        self.results
            .record(summary.clone())
            .await
            .map_err(|err| StoreError::Backend(err.to_string()))?;

        if let Err(err) = self.store.delete(&keys::session_key(session_id)).await {
            // The summary is already recorded; the record will TTL out.
            warn!("{}: session record delete failed: {}", session_id, err);
        }
        self.cache.lock().await.remove(session_id);
        counter!("filetto_sessions_ended_total", "reason" => reason_label(reason)).increment(1);
        debug!(
            "{}: session ended, winner={:?} reason={:?}",
            session_id, summary.winner_id, reason
        );
        Ok(summary)
    }

    async fn persist(&self, session: &GameSession) -> Result<(), CoordinatorError> {
        let record = serde_json::to_string(session).map_err(StoreError::from)?;
        self.store
            .set(&keys::session_key(&session.id), &record, keys::RECORD_TTL)
            .await?;
        self.cache
            .lock()
            .await
            .insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Option<GameSession> {
        let raw = match self.store.get(&keys::session_key(session_id)).await {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                self.cache.lock().await.remove(session_id);
                return None;
            }
            Err(err) => {
                warn!("{}: session read failed: {}", session_id, err);
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(session) => Some(session),
            Err(err) => {
                warn!("{}: undecodable session record: {}", session_id, err);
                None
            }
        }
    }

    async fn load_and_refresh(&self, session_id: &str) -> Option<GameSession> {
        let session = self.load(session_id).await?;
        if let Err(err) = self
            .store
            .expire(&keys::session_key(session_id), keys::RECORD_TTL)
            .await
        {
            warn!("{}: session keepalive failed: {}", session_id, err);
        }
        self.cache
            .lock()
            .await
            .insert(session_id.to_string(), session.clone());
        Some(session)
    }
}

fn reason_label(reason: EndReason) -> &'static str {
    match reason {
        EndReason::Win => "win",
        EndReason::Timeout => "timeout",
        EndReason::Disconnect => "disconnect",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use tokio::sync::mpsc;

    type TestRegistry = SessionRegistry<MemoryStore, mpsc::Sender<GameSummary>>;

    fn registry() -> (TestRegistry, mpsc::Receiver<GameSummary>) {
        let (tx, rx) = mpsc::channel(16);
        (SessionRegistry::new(Arc::new(MemoryStore::new()), tx), rx)
    }

    async fn started_session(registry: &TestRegistry) -> GameSession {
        registry
            .create_game_session("room-1", "alice", "bob", Marker::X, 1_000)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn legal_move_flips_turn_and_charges_mover() {
        let (registry, _rx) = registry();
        started_session(&registry).await;

        let outcome = registry.apply_move("room-1", "alice", 112, 5_000).await.unwrap();
        let session = match outcome {
            MoveOutcome::Applied(session) => session,
            other => panic!("expected applied move, got {other:?}"),
        };
        assert_eq!(session.board[112], Some(Marker::X));
        assert_eq!(session.current_turn, "bob");
        assert_eq!(session.num_moves, 1);
        assert_eq!(session.last_move_time, 5_000);
        assert_eq!(session.player_time_1, 4_000);
        assert_eq!(session.player_time_2, 0);

        // The persisted record matches what was returned.
        let stored = registry.get("room-1").await.unwrap();
        assert_eq!(stored, session);
    }

    #[tokio::test]
    async fn out_of_turn_move_changes_nothing() {
        let (registry, _rx) = registry();
        started_session(&registry).await;

        match registry.apply_move("room-1", "bob", 0, 2_000).await {
            Err(CoordinatorError::NotYourTurn) => {}
            other => panic!("expected turn rejection, got {other:?}"),
        }
        let session = registry.get("room-1").await.unwrap();
        assert!(session.board.iter().all(Option::is_none));
        assert_eq!(session.current_turn, "alice");
        assert_eq!(session.num_moves, 0);
    }

    #[tokio::test]
    async fn non_participant_is_rejected() {
        let (registry, _rx) = registry();
        started_session(&registry).await;
        match registry.apply_move("room-1", "mallory", 0, 2_000).await {
            Err(CoordinatorError::NotYourTurn) => {}
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn occupied_and_out_of_range_positions_are_rejected() {
        let (registry, _rx) = registry();
        started_session(&registry).await;
        registry.apply_move("room-1", "alice", 7, 2_000).await.unwrap();
        match registry.apply_move("room-1", "bob", 7, 3_000).await {
            Err(CoordinatorError::InvalidPosition) => {}
            other => panic!("expected invalid position, got {other:?}"),
        }
        match registry.apply_move("room-1", "bob", BOARD_CELLS, 3_000).await {
            Err(CoordinatorError::InvalidPosition) => {}
            other => panic!("expected invalid position, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn move_past_the_clock_resolves_against_the_mover() {
        let (registry, _rx) = registry();
        started_session(&registry).await;

        // One millisecond past the budget, measured from the last move.
        let late = 1_000 + keys::MAX_MOVE_TIME_MS + 1;
        match registry.apply_move("room-1", "alice", 0, late).await.unwrap() {
            MoveOutcome::TimedOut { session, winner_id } => {
                assert_eq!(winner_id, "bob");
                // The late move was not applied.
                assert!(session.board.iter().all(Option::is_none));
                assert_eq!(session.num_moves, 0);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn move_at_the_exact_budget_is_still_legal() {
        let (registry, _rx) = registry();
        started_session(&registry).await;
        let at_budget = 1_000 + keys::MAX_MOVE_TIME_MS;
        match registry.apply_move("room-1", "alice", 0, at_budget).await.unwrap() {
            MoveOutcome::Applied(session) => assert_eq!(session.num_moves, 1),
            other => panic!("expected applied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_claims_are_verified_server_side() {
        let (registry, _rx) = registry();
        started_session(&registry).await;

        // Too early: claim rejected.
        let verdict = registry.check_timeout("room-1", 20_000).await.unwrap();
        assert!(verdict.is_none());

        // Genuinely late: current turn (alice) loses.
        let (_, winner) = registry
            .check_timeout("room-1", 1_000 + keys::MAX_MOVE_TIME_MS + 500)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(winner, "bob");
    }

    #[tokio::test]
    async fn ending_hands_off_a_summary_and_deletes_the_record() {
        let (registry, mut rx) = registry();
        started_session(&registry).await;
        registry.apply_move("room-1", "alice", 0, 3_000).await.unwrap();

        let summary = registry
            .end_game_session("room-1", Some("bob"), EndReason::Disconnect)
            .await
            .unwrap();
        assert_eq!(summary.winner_id.as_deref(), Some("bob"));
        assert_eq!(summary.num_moves, 1);
        assert_eq!(summary.creator_time_ms, 2_000);

        let delivered = rx.recv().await.unwrap();
        assert_eq!(delivered, summary);
        assert!(registry.get("room-1").await.is_none());
    }

    #[tokio::test]
    async fn double_resolution_reports_already_resolved() {
        let (registry, _rx) = registry();
        started_session(&registry).await;
        registry
            .end_game_session("room-1", Some("bob"), EndReason::Timeout)
            .await
            .unwrap();
        match registry
            .end_game_session("room-1", Some("alice"), EndReason::Win)
            .await
        {
            Err(CoordinatorError::SessionNotFound) => {}
            other => panic!("expected already-resolved signal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clock_reports_do_not_overwrite_server_accounting() {
        let (registry, _rx) = registry();
        started_session(&registry).await;
        registry.apply_move("room-1", "alice", 0, 4_000).await.unwrap();

        let session = registry
            .refresh_clocks("room-1", (999_999, 999_999))
            .await
            .unwrap();
        assert_eq!(session.player_time_1, 3_000);
        assert_eq!(session.player_time_2, 0);
    }
}
