//! Connection coordinator: which live connection belongs to which user,
//! which room it is joined to, and the grace timers that turn transport
//! closes into lobby/session resolutions.
//!
//! All cross-connection state lives in the shared keyed store; the maps
//! here are process-local bookkeeping and are rebuilt from the store on
//! reconnect (the `gameState` replay is the restart-recovery mechanism).
//! Grace timers are explicit abortable tasks keyed by user id; every
//! state transition that supersedes a timer aborts it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, gauge};
use rand::Rng;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use filetto_lib::error::CoordinatorError;
use filetto_lib::lobby::LobbyRegistry;
use filetto_lib::model::{now_ms, EndReason, GameSession, LobbyStatus, Marker};
use filetto_lib::rate_limit::RateLimiter;
use filetto_lib::results::ResultSink;
use filetto_lib::session::{MoveOutcome, SessionRegistry};
use filetto_lib::store::store::KeyedStore;

use crate::collaborators::InviteSender;
use crate::events::{ClientEvent, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RoomKind {
    Lobby,
    Session,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Creator,
    Opponent,
}

#[derive(Debug, Clone)]
struct Membership {
    room_id: String,
    kind: RoomKind,
    role: Role,
}

struct Connection {
    conn_id: u64,
    tx: UnboundedSender<ServerEvent>,
    membership: Option<Membership>,
}

struct GraceTimer {
    handle: JoinHandle<()>,
    membership: Membership,
}

struct Inner<T: KeyedStore, S: ResultSink> {
    lobbies: Arc<LobbyRegistry<T>>,
    sessions: Arc<SessionRegistry<T, S>>,
    invites: Arc<dyn InviteSender>,
    grace_period: Duration,
    connections: Mutex<HashMap<String, Connection>>,
    rooms: Mutex<HashMap<String, HashSet<String>>>,
    grace_timers: Mutex<HashMap<String, GraceTimer>>,
    conn_seq: AtomicU64,
}

/// Cheap-clone handle; all state is behind the inner `Arc`, so timer
/// tasks and per-connection tasks share one coordinator.
pub struct Coordinator<T: KeyedStore, S: ResultSink> {
    inner: Arc<Inner<T, S>>,
}

impl<T: KeyedStore, S: ResultSink> Clone for Coordinator<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: KeyedStore, S: ResultSink> Coordinator<T, S> {
    pub fn new(
        lobbies: Arc<LobbyRegistry<T>>,
        sessions: Arc<SessionRegistry<T, S>>,
        invites: Arc<dyn InviteSender>,
        grace_period: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                lobbies,
                sessions,
                invites,
                grace_period,
                connections: Mutex::new(HashMap::new()),
                rooms: Mutex::new(HashMap::new()),
                grace_timers: Mutex::new(HashMap::new()),
                conn_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Register an authenticated connection. Returns a connection serial
    /// the transport passes back on disconnect, so a superseded socket
    /// cannot tear down its replacement.
    pub async fn connect(&self, user_id: &str, tx: UnboundedSender<ServerEvent>) -> u64 {
        let conn_id = self.inner.conn_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let membership = {
            let mut connections = self.inner.connections.lock().await;
            let mut timers = self.inner.grace_timers.lock().await;
            let membership = match timers.remove(user_id) {
                Some(timer) => {
                    // Reconnect within the grace window.
                    timer.handle.abort();
                    counter!("filetto_reconnects_total").increment(1);
                    Some(timer.membership)
                }
                None => None,
            };
            connections.insert(
                user_id.to_string(),
                Connection {
                    conn_id,
                    tx,
                    membership: membership.clone(),
                },
            );
            gauge!("filetto_connections").set(connections.len() as f64);
            membership
        };

        match membership {
            Some(membership) => {
                debug!("{}: reconnected within grace window", user_id);
                self.rejoin(user_id, &membership).await;
            }
            None => {
                // No timer on file: either a fresh client or one coming
                // back after a process restart. Their own lobby, if any,
                // is still recoverable from the store.
                if let Some(lobby) = self.inner.lobbies.find_lobby_by_creator(user_id).await {
                    let membership = Membership {
                        room_id: lobby.id.clone(),
                        kind: RoomKind::Lobby,
                        role: Role::Creator,
                    };
                    self.rejoin(user_id, &membership).await;
                }
            }
        }
        conn_id
    }

    /// Transport close for connection `conn_id`. No-op when a newer
    /// connection for the same user has already replaced it.
    pub async fn disconnect(&self, user_id: &str, conn_id: u64) {
        let membership = {
            let mut connections = self.inner.connections.lock().await;
            match connections.get(user_id) {
                Some(connection) if connection.conn_id == conn_id => {
                    let connection = connections.remove(user_id);
                    gauge!("filetto_connections").set(connections.len() as f64);
                    connection.and_then(|c| c.membership)
                }
                _ => return,
            }
        };
        debug!("{}: connection closed", user_id);
        let Some(membership) = membership else {
            return;
        };
        self.leave_room(&membership.room_id, user_id).await;

        match membership.kind {
            RoomKind::Lobby => match self.inner.lobbies.mark_pending(&membership.room_id).await {
                Ok(_) => self.start_grace_timer(user_id, membership).await,
                Err(CoordinatorError::LobbyNotFound) => {
                    debug!("{}: lobby already gone at disconnect", membership.room_id);
                }
                Err(err) => {
                    warn!("{}: pending flip failed: {}", membership.room_id, err);
                    self.start_grace_timer(user_id, membership).await;
                }
            },
            RoomKind::Session => {
                self.broadcast(
                    &membership.room_id,
                    ServerEvent::PlayerDisconnected {
                        user_id: user_id.to_string(),
                    },
                )
                .await;
                self.start_grace_timer(user_id, membership).await;
            }
        }
    }

    /// Dispatch one authenticated client event.
    pub async fn handle_event(&self, user_id: &str, event: ClientEvent) {
        counter!("filetto_client_events_total", "type" => event.label()).increment(1);
        match event {
            ClientEvent::Auth { .. } => {
                self.send_to(
                    user_id,
                    ServerEvent::Error {
                        message: "already authenticated".into(),
                    },
                )
                .await;
            }
            ClientEvent::Ping => self.send_to(user_id, ServerEvent::Pong).await,
            ClientEvent::CreateLobby => self.create_lobby(user_id).await,
            ClientEvent::JoinLobby { lobby_id } => self.join_lobby(user_id, &lobby_id).await,
            ClientEvent::CancelLobby => self.cancel_lobby(user_id).await,
            ClientEvent::MakeMove {
                session_id,
                position,
                timestamp,
            } => self.make_move(user_id, &session_id, position, timestamp).await,
            ClientEvent::ClockUpdate {
                session_id,
                player_time_1,
                player_time_2,
            } => {
                self.clock_update(user_id, &session_id, (player_time_1, player_time_2))
                    .await
            }
            ClientEvent::TimeExpired { session_id } => {
                self.time_expired(user_id, &session_id).await
            }
        }
    }

    async fn create_lobby(&self, user_id: &str) {
        match self.inner.lobbies.create_lobby(user_id).await {
            Ok(lobby) => {
                self.join_room(&lobby.id, user_id).await;
                self.set_membership(
                    user_id,
                    Some(Membership {
                        room_id: lobby.id.clone(),
                        kind: RoomKind::Lobby,
                        role: Role::Creator,
                    }),
                )
                .await;
                if let Err(err) = self.inner.invites.send_invite(user_id, &lobby.id).await {
                    warn!("{}: invite delivery failed: {}", user_id, err);
                }
                self.send_to(user_id, ServerEvent::LobbyReady { lobby }).await;
            }
            Err(err) => self.reject(user_id, &err).await,
        }
    }

    async fn join_lobby(&self, user_id: &str, lobby_id: &str) {
        let Some(lobby) = self.inner.lobbies.find_lobby(lobby_id).await else {
            self.reject(user_id, &CoordinatorError::LobbyNotFound).await;
            return;
        };
        if lobby.creator_id == user_id {
            self.send_to(
                user_id,
                ServerEvent::Error {
                    message: "cannot join your own lobby".into(),
                },
            )
            .await;
            return;
        }
        if lobby.status != LobbyStatus::Active {
            self.send_to(
                user_id,
                ServerEvent::Error {
                    message: "lobby is not open".into(),
                },
            )
            .await;
            return;
        }

        let creator_marker = if rand::rng().random_bool(0.5) {
            Marker::X
        } else {
            Marker::O
        };
        let session = match self
            .inner
            .sessions
            .create_game_session(&lobby.id, &lobby.creator_id, user_id, creator_marker, now_ms())
            .await
        {
            Ok(session) => session,
            Err(err) => {
                self.reject(user_id, &err).await;
                return;
            }
        };

        // Handoff: the lobby is superseded by the session.
        if let Err(err) = self.inner.lobbies.delete_lobby(&lobby.id).await {
            warn!("{}: lobby supersede failed: {}", lobby.id, err);
        }

        self.join_room(&session.id, &lobby.creator_id).await;
        self.join_room(&session.id, user_id).await;
        self.set_membership(
            &lobby.creator_id,
            Some(Membership {
                room_id: session.id.clone(),
                kind: RoomKind::Session,
                role: Role::Creator,
            }),
        )
        .await;
        self.set_membership(
            user_id,
            Some(Membership {
                room_id: session.id.clone(),
                kind: RoomKind::Session,
                role: Role::Opponent,
            }),
        )
        .await;

        for member in [lobby.creator_id.as_str(), user_id] {
            let Some(marker) = session.marker_of(member) else {
                continue;
            };
            self.send_to(
                member,
                ServerEvent::GameStart {
                    session: session.clone(),
                    marker,
                },
            )
            .await;
        }
    }

    async fn cancel_lobby(&self, user_id: &str) {
        // Membership first; fall back to the store index so a client on
        // a freshly restarted server can still cancel.
        let lobby_id = match self.membership_of(user_id).await {
            Some(membership) if membership.kind == RoomKind::Lobby => Some(membership.room_id),
            _ => self
                .inner
                .lobbies
                .find_lobby_by_creator(user_id)
                .await
                .map(|lobby| lobby.id),
        };
        let Some(lobby_id) = lobby_id else {
            self.reject(user_id, &CoordinatorError::LobbyNotFound).await;
            return;
        };
        match self.inner.lobbies.delete_lobby(&lobby_id).await {
            Ok(()) => {
                self.broadcast(
                    &lobby_id,
                    ServerEvent::LobbyDeleted {
                        reason: "cancelled".into(),
                    },
                )
                .await;
                self.release_room(&lobby_id).await;
            }
            Err(err) => self.reject(user_id, &err).await,
        }
    }

    async fn make_move(&self, user_id: &str, session_id: &str, position: usize, timestamp: i64) {
        match self
            .inner
            .sessions
            .apply_move(session_id, user_id, position, timestamp)
            .await
        {
            Ok(MoveOutcome::Applied(session)) => {
                self.attach_to_session(user_id, &session).await;
                let marker = session.marker_of(user_id).unwrap_or(session.creator_marker);
                self.broadcast(
                    session_id,
                    ServerEvent::MoveMade {
                        player_id: user_id.to_string(),
                        position,
                        marker,
                        current_turn: session.current_turn.clone(),
                        num_moves: session.num_moves,
                    },
                )
                .await;
            }
            Ok(MoveOutcome::TimedOut { winner_id, .. }) => {
                counter!("filetto_move_timeouts_total").increment(1);
                self.resolve_session(session_id, Some(&winner_id), EndReason::Timeout)
                    .await;
            }
            Err(err) => self.reject(user_id, &err).await,
        }
    }

    async fn clock_update(&self, user_id: &str, session_id: &str, reported: (u64, u64)) {
        match self.inner.sessions.refresh_clocks(session_id, reported).await {
            Ok(session) => {
                self.attach_to_session(user_id, &session).await;
                self.broadcast(session_id, ServerEvent::GameState { session })
                    .await;
            }
            Err(err) => self.reject(user_id, &err).await,
        }
    }

    async fn time_expired(&self, user_id: &str, session_id: &str) {
        match self.inner.sessions.check_timeout(session_id, now_ms()).await {
            Ok(Some((_, winner_id))) => {
                counter!("filetto_move_timeouts_total").increment(1);
                self.resolve_session(session_id, Some(&winner_id), EndReason::Timeout)
                    .await;
            }
            Ok(None) => {
                debug!(
                    "{}: time-expired claim from {} not verified",
                    session_id, user_id
                );
            }
            Err(err) => self.reject(user_id, &err).await,
        }
    }

    /// Re-establish room bookkeeping after a reconnect.
    async fn rejoin(&self, user_id: &str, membership: &Membership) {
        debug!(
            "{}: rejoining room {} as {:?}",
            user_id, membership.room_id, membership.role
        );
        match membership.kind {
            RoomKind::Lobby => match self.inner.lobbies.restore(&membership.room_id).await {
                Ok(lobby) => {
                    self.join_room(&membership.room_id, user_id).await;
                    self.set_membership(user_id, Some(membership.clone())).await;
                    self.send_to(user_id, ServerEvent::LobbyReady { lobby }).await;
                }
                Err(CoordinatorError::LobbyNotFound) => {
                    debug!("{}: lobby vanished before reconnect", membership.room_id);
                    self.set_membership(user_id, None).await;
                }
                Err(err) => {
                    warn!("{}: lobby restore failed: {}", membership.room_id, err);
                    self.set_membership(user_id, None).await;
                }
            },
            RoomKind::Session => match self.inner.sessions.get(&membership.room_id).await {
                // The authoritative snapshot replay; after a network
                // blip or server restart the client resumes from this.
                Some(session) => {
                    self.join_room(&membership.room_id, user_id).await;
                    self.set_membership(user_id, Some(membership.clone())).await;
                    self.send_to(user_id, ServerEvent::GameState { session }).await;
                }
                None => {
                    debug!("{}: session vanished before reconnect", membership.room_id);
                    self.set_membership(user_id, None).await;
                }
            },
        }
    }

    /// A participant whose bookkeeping was lost (server restart) is
    /// quietly re-attached to their session room on the next session op.
    async fn attach_to_session(&self, user_id: &str, session: &GameSession) {
        if self.membership_of(user_id).await.is_some() {
            return;
        }
        let role = if session.creator_id == user_id {
            Role::Creator
        } else {
            Role::Opponent
        };
        self.join_room(&session.id, user_id).await;
        self.set_membership(
            user_id,
            Some(Membership {
                room_id: session.id.clone(),
                kind: RoomKind::Session,
                role,
            }),
        )
        .await;
    }

    async fn start_grace_timer(&self, user_id: &str, membership: Membership) {
        let coordinator = self.clone();
        let user = user_id.to_string();
        let timer_membership = membership.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(coordinator.inner.grace_period).await;
            coordinator.grace_expired(&user, timer_membership).await;
        });
        let mut timers = self.inner.grace_timers.lock().await;
        if let Some(stale) = timers.insert(user_id.to_string(), GraceTimer { handle, membership }) {
            stale.handle.abort();
        }
    }

    async fn grace_expired(&self, user_id: &str, membership: Membership) {
        {
            let connections = self.inner.connections.lock().await;
            let mut timers = self.inner.grace_timers.lock().await;
            if connections.contains_key(user_id) {
                // Reconnect won the race; nothing to resolve.
                return;
            }
            timers.remove(user_id);
        }
        let room_label = match membership.kind {
            RoomKind::Lobby => "lobby",
            RoomKind::Session => "session",
        };
        counter!("filetto_grace_expired_total", "room" => room_label).increment(1);

        match membership.kind {
            RoomKind::Lobby => {
                match self.inner.lobbies.find_lobby(&membership.room_id).await {
                    Some(lobby) if lobby.status == LobbyStatus::Pending => {
                        debug!(
                            "{}: creator {} failed to reconnect, deleting lobby",
                            membership.room_id, user_id
                        );
                        if let Err(err) = self.inner.lobbies.delete_lobby(&membership.room_id).await
                        {
                            warn!(
                                "{}: grace-period delete failed: {}",
                                membership.room_id, err
                            );
                        }
                        self.broadcast(
                            &membership.room_id,
                            ServerEvent::LobbyDeleted {
                                reason: "creator-disconnected".into(),
                            },
                        )
                        .await;
                        self.release_room(&membership.room_id).await;
                    }
                    // Restored or already superseded elsewhere.
                    _ => {}
                }
            }
            RoomKind::Session => {
                let winner = match self.inner.sessions.get(&membership.room_id).await {
                    Some(session) => session.opponent_of(user_id).map(str::to_string),
                    None => {
                        debug!("{}: session already resolved", membership.room_id);
                        return;
                    }
                };
                debug!(
                    "{}: {} failed to reconnect, resolving disconnect loss",
                    membership.room_id, user_id
                );
                self.resolve_session(&membership.room_id, winner.as_deref(), EndReason::Disconnect)
                    .await;
            }
        }
    }

    /// Terminal session resolution shared by move timeouts, verified
    /// time-expired claims and grace-period expiries.
    async fn resolve_session(&self, session_id: &str, winner_id: Option<&str>, reason: EndReason) {
        match self
            .inner
            .sessions
            .end_game_session(session_id, winner_id, reason)
            .await
        {
            Ok(summary) => {
                self.broadcast(
                    session_id,
                    ServerEvent::GameEnded {
                        winner_id: summary.winner_id.clone(),
                        reason,
                        summary,
                    },
                )
                .await;
                self.release_room(session_id).await;
            }
            Err(CoordinatorError::SessionNotFound) => {
                // Already resolved by a concurrent path.
                debug!("{}: duplicate resolution ignored", session_id);
            }
            Err(err) => warn!("{}: session resolution failed: {}", session_id, err),
        }
    }

    async fn join_room(&self, room_id: &str, user_id: &str) {
        self.inner
            .rooms
            .lock()
            .await
            .entry(room_id.to_string())
            .or_default()
            .insert(user_id.to_string());
    }

    async fn leave_room(&self, room_id: &str, user_id: &str) {
        let mut rooms = self.inner.rooms.lock().await;
        if let Some(members) = rooms.get_mut(room_id) {
            members.remove(user_id);
            if members.is_empty() {
                rooms.remove(room_id);
            }
        }
    }

    /// Drop a room and every piece of bookkeeping pointing at it,
    /// including grace timers of members who were disconnected when the
    /// room resolved.
    async fn release_room(&self, room_id: &str) {
        let members = self
            .inner
            .rooms
            .lock()
            .await
            .remove(room_id)
            .unwrap_or_default();
        {
            let mut connections = self.inner.connections.lock().await;
            for member in &members {
                if let Some(connection) = connections.get_mut(member) {
                    if connection
                        .membership
                        .as_ref()
                        .is_some_and(|m| m.room_id == room_id)
                    {
                        connection.membership = None;
                    }
                }
            }
        }
        let mut timers = self.inner.grace_timers.lock().await;
        let stale: Vec<String> = timers
            .iter()
            .filter(|(_, timer)| timer.membership.room_id == room_id)
            .map(|(user, _)| user.clone())
            .collect();
        for user in stale {
            if let Some(timer) = timers.remove(&user) {
                timer.handle.abort();
            }
        }
    }

    async fn membership_of(&self, user_id: &str) -> Option<Membership> {
        self.inner
            .connections
            .lock()
            .await
            .get(user_id)
            .and_then(|connection| connection.membership.clone())
    }

    async fn set_membership(&self, user_id: &str, membership: Option<Membership>) {
        if let Some(connection) = self.inner.connections.lock().await.get_mut(user_id) {
            connection.membership = membership;
        }
    }

    async fn send_to(&self, user_id: &str, event: ServerEvent) {
        let connections = self.inner.connections.lock().await;
        if let Some(connection) = connections.get(user_id) {
            // A closed channel means the socket task is gone; the
            // disconnect path cleans up.
            let _ = connection.tx.send(event);
        }
    }

    /// Deliver to every member of a room. Private validation failures
    /// never go through here; only state-changing outcomes are shared.
    async fn broadcast(&self, room_id: &str, event: ServerEvent) {
        let members: Vec<String> = {
            let rooms = self.inner.rooms.lock().await;
            match rooms.get(room_id) {
                Some(members) => members.iter().cloned().collect(),
                None => return,
            }
        };
        let connections = self.inner.connections.lock().await;
        for member in members {
            if let Some(connection) = connections.get(&member) {
                let _ = connection.tx.send(event.clone());
            }
        }
    }

    async fn reject(&self, user_id: &str, err: &CoordinatorError) {
        debug!("{}: request rejected: {}", user_id, err);
        self.send_to(
            user_id,
            ServerEvent::Error {
                message: err.to_string(),
            },
        )
        .await;
    }
}

/// Periodic self-healing pass: reconcile the lobby cache against the
/// store and evict elapsed rate-limit windows. Jittered so restarted
/// instances do not sweep in lockstep.
pub async fn sweeper<T: KeyedStore>(
    lobbies: Arc<LobbyRegistry<T>>,
    limiter: Arc<RateLimiter>,
    interval: Duration,
) {
    loop {
        let jitter = {
            let mut rng = rand::rng();
            rng.random_range(0..=interval.as_secs().max(1) / 10)
        };
        tokio::time::sleep(interval + Duration::from_secs(jitter)).await;
        let reconciled = lobbies.reconcile_cache().await;
        let evicted = limiter.evict_expired().await;
        debug!(
            "sweep complete: {} lobbies reconciled, {} rate windows evicted",
            reconciled, evicted
        );
        counter!("filetto_sweeps_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::LogInviteSender;
    use filetto_lib::keys::MAX_MOVE_TIME_MS;
    use filetto_lib::model::GameSummary;
    use filetto_lib::store::memory::MemoryStore;
    use tokio::sync::mpsc;
    use tokio::time::{sleep, timeout};

    type TestCoordinator = Coordinator<MemoryStore, mpsc::Sender<GameSummary>>;

    const GRACE: Duration = Duration::from_millis(60);

    fn coordinator() -> (TestCoordinator, mpsc::Receiver<GameSummary>) {
        let store = Arc::new(MemoryStore::new());
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(60), 16));
        let lobbies = Arc::new(LobbyRegistry::new(store.clone(), limiter));
        let (results_tx, results_rx) = mpsc::channel(16);
        let sessions = Arc::new(SessionRegistry::new(store, results_tx));
        (
            Coordinator::new(lobbies, sessions, Arc::new(LogInviteSender), GRACE),
            results_rx,
        )
    }

    async fn attach(
        coordinator: &TestCoordinator,
        user_id: &str,
    ) -> (u64, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let conn_id = coordinator.connect(user_id, tx).await;
        (conn_id, rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> ServerEvent {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("event should arrive")
            .expect("channel should stay open")
    }

    /// Drive two users through create + join; returns the session along
    /// with both connections, drained past the start events.
    async fn started_game(
        coordinator: &TestCoordinator,
    ) -> (
        GameSession,
        (u64, mpsc::UnboundedReceiver<ServerEvent>),
        (u64, mpsc::UnboundedReceiver<ServerEvent>),
    ) {
        let (alice_conn, mut alice_rx) = attach(coordinator, "alice").await;
        let (bob_conn, mut bob_rx) = attach(coordinator, "bob").await;

        coordinator.handle_event("alice", ClientEvent::CreateLobby).await;
        let lobby = match recv(&mut alice_rx).await {
            ServerEvent::LobbyReady { lobby } => lobby,
            other => panic!("expected lobbyReady, got {other:?}"),
        };

        coordinator
            .handle_event(
                "bob",
                ClientEvent::JoinLobby {
                    lobby_id: lobby.id.clone(),
                },
            )
            .await;
        let session = match recv(&mut alice_rx).await {
            ServerEvent::GameStart { session, marker } => {
                assert_eq!(Some(marker), session.marker_of("alice"));
                session
            }
            other => panic!("expected gameStart, got {other:?}"),
        };
        match recv(&mut bob_rx).await {
            ServerEvent::GameStart { marker, .. } => {
                assert_eq!(Some(marker), session.marker_of("bob"));
            }
            other => panic!("expected gameStart, got {other:?}"),
        }
        assert_eq!(session.id, lobby.id);
        assert_eq!(session.current_turn, "alice");
        (session, (alice_conn, alice_rx), (bob_conn, bob_rx))
    }

    #[tokio::test]
    async fn create_and_join_hands_off_into_a_session() {
        let (coordinator, _results) = coordinator();
        let (session, _, _) = started_game(&coordinator).await;
        // The lobby is superseded: the creator index is released.
        assert!(coordinator
            .inner
            .lobbies
            .find_lobby_by_creator("alice")
            .await
            .is_none());
        assert!(coordinator.inner.sessions.get(&session.id).await.is_some());
    }

    #[tokio::test]
    async fn cannot_join_own_lobby() {
        let (coordinator, _results) = coordinator();
        let (_, mut alice_rx) = attach(&coordinator, "alice").await;
        coordinator.handle_event("alice", ClientEvent::CreateLobby).await;
        let lobby = match recv(&mut alice_rx).await {
            ServerEvent::LobbyReady { lobby } => lobby,
            other => panic!("expected lobbyReady, got {other:?}"),
        };
        coordinator
            .handle_event("alice", ClientEvent::JoinLobby { lobby_id: lobby.id })
            .await;
        match recv(&mut alice_rx).await {
            ServerEvent::Error { message } => assert!(message.contains("own lobby")),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn out_of_turn_move_is_rejected_privately() {
        let (coordinator, _results) = coordinator();
        let (session, (_, mut alice_rx), (_, mut bob_rx)) = started_game(&coordinator).await;

        coordinator
            .handle_event(
                "bob",
                ClientEvent::MakeMove {
                    session_id: session.id.clone(),
                    position: 0,
                    timestamp: session.started_at + 100,
                },
            )
            .await;
        match recv(&mut bob_rx).await {
            ServerEvent::Error { message } => assert_eq!(message, "not your turn"),
            other => panic!("expected private error, got {other:?}"),
        }
        // The other participant hears nothing about it.
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn moves_broadcast_to_the_room() {
        let (coordinator, _results) = coordinator();
        let (session, (_, mut alice_rx), (_, mut bob_rx)) = started_game(&coordinator).await;

        coordinator
            .handle_event(
                "alice",
                ClientEvent::MakeMove {
                    session_id: session.id.clone(),
                    position: 112,
                    timestamp: session.started_at + 500,
                },
            )
            .await;
        for rx in [&mut alice_rx, &mut bob_rx] {
            match recv(rx).await {
                ServerEvent::MoveMade {
                    player_id,
                    position,
                    current_turn,
                    num_moves,
                    ..
                } => {
                    assert_eq!(player_id, "alice");
                    assert_eq!(position, 112);
                    assert_eq!(current_turn, "bob");
                    assert_eq!(num_moves, 1);
                }
                other => panic!("expected moveMade, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn late_move_resolves_timeout_loss_for_the_mover() {
        let (coordinator, mut results) = coordinator();
        let (session, (_, mut alice_rx), (_, mut bob_rx)) = started_game(&coordinator).await;

        coordinator
            .handle_event(
                "alice",
                ClientEvent::MakeMove {
                    session_id: session.id.clone(),
                    position: 0,
                    timestamp: session.started_at + MAX_MOVE_TIME_MS + 1,
                },
            )
            .await;
        for rx in [&mut alice_rx, &mut bob_rx] {
            match recv(rx).await {
                ServerEvent::GameEnded {
                    winner_id, reason, ..
                } => {
                    assert_eq!(winner_id.as_deref(), Some("bob"));
                    assert_eq!(reason, EndReason::Timeout);
                }
                other => panic!("expected gameEnded, got {other:?}"),
            }
        }
        let summary = results.recv().await.unwrap();
        assert_eq!(summary.reason, EndReason::Timeout);
        assert!(coordinator.inner.sessions.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn unverified_time_expired_claim_is_ignored() {
        let (coordinator, _results) = coordinator();
        let (session, _alice, (_, mut bob_rx)) = started_game(&coordinator).await;
        coordinator
            .handle_event(
                "bob",
                ClientEvent::TimeExpired {
                    session_id: session.id.clone(),
                },
            )
            .await;
        sleep(Duration::from_millis(20)).await;
        assert!(bob_rx.try_recv().is_err());
        assert!(coordinator.inner.sessions.get(&session.id).await.is_some());
    }

    #[tokio::test]
    async fn timely_reconnect_replays_the_snapshot() {
        let (coordinator, _results) = coordinator();
        let (session, (alice_conn, _alice_rx), (_, mut bob_rx)) = started_game(&coordinator).await;

        coordinator
            .handle_event(
                "alice",
                ClientEvent::MakeMove {
                    session_id: session.id.clone(),
                    position: 7,
                    timestamp: session.started_at + 200,
                },
            )
            .await;
        recv(&mut bob_rx).await; // moveMade

        coordinator.disconnect("alice", alice_conn).await;
        match recv(&mut bob_rx).await {
            ServerEvent::PlayerDisconnected { user_id } => assert_eq!(user_id, "alice"),
            other => panic!("expected playerDisconnected, got {other:?}"),
        }

        // Reconnect well inside the grace window.
        sleep(Duration::from_millis(10)).await;
        let (_, mut alice_rx) = attach(&coordinator, "alice").await;
        match recv(&mut alice_rx).await {
            ServerEvent::GameState { session: replayed } => {
                assert_eq!(replayed.board[7], session.marker_of("alice"));
                assert_eq!(replayed.current_turn, "bob");
                assert_eq!(replayed.num_moves, 1);
            }
            other => panic!("expected gameState replay, got {other:?}"),
        }

        // Past the original deadline: the aborted timer must not fire.
        sleep(GRACE + Duration::from_millis(40)).await;
        assert!(coordinator.inner.sessions.get(&session.id).await.is_some());
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn grace_expiry_resolves_a_disconnect_loss() {
        let (coordinator, mut results) = coordinator();
        let (session, (alice_conn, _alice_rx), (_, mut bob_rx)) = started_game(&coordinator).await;

        coordinator.disconnect("alice", alice_conn).await;
        recv(&mut bob_rx).await; // playerDisconnected

        match recv(&mut bob_rx).await {
            ServerEvent::GameEnded {
                winner_id, reason, ..
            } => {
                assert_eq!(winner_id.as_deref(), Some("bob"));
                assert_eq!(reason, EndReason::Disconnect);
            }
            other => panic!("expected gameEnded, got {other:?}"),
        }
        let summary = results.recv().await.unwrap();
        assert_eq!(summary.winner_id.as_deref(), Some("bob"));
        assert!(coordinator.inner.sessions.get(&session.id).await.is_none());
    }

    #[tokio::test]
    async fn lobby_creator_reconnect_restores_the_lobby() {
        let (coordinator, _results) = coordinator();
        let (alice_conn, mut alice_rx) = attach(&coordinator, "alice").await;
        coordinator.handle_event("alice", ClientEvent::CreateLobby).await;
        let lobby = match recv(&mut alice_rx).await {
            ServerEvent::LobbyReady { lobby } => lobby,
            other => panic!("expected lobbyReady, got {other:?}"),
        };

        coordinator.disconnect("alice", alice_conn).await;
        sleep(Duration::from_millis(10)).await;

        let (_, mut alice_rx) = attach(&coordinator, "alice").await;
        match recv(&mut alice_rx).await {
            ServerEvent::LobbyReady { lobby: restored } => {
                assert_eq!(restored.id, lobby.id);
                assert_eq!(restored.status, LobbyStatus::Active);
            }
            other => panic!("expected lobbyReady replay, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lobby_grace_expiry_deletes_the_lobby() {
        let (coordinator, _results) = coordinator();
        let (alice_conn, mut alice_rx) = attach(&coordinator, "alice").await;
        coordinator.handle_event("alice", ClientEvent::CreateLobby).await;
        recv(&mut alice_rx).await; // lobbyReady

        coordinator.disconnect("alice", alice_conn).await;
        sleep(GRACE + Duration::from_millis(40)).await;

        assert!(coordinator
            .inner
            .lobbies
            .find_lobby_by_creator("alice")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn superseded_connection_cannot_tear_down_its_replacement() {
        let (coordinator, _results) = coordinator();
        let (old_conn, _old_rx) = attach(&coordinator, "alice").await;
        let (_new_conn, _new_rx) = attach(&coordinator, "alice").await;

        coordinator.disconnect("alice", old_conn).await;
        assert!(coordinator
            .inner
            .connections
            .lock()
            .await
            .contains_key("alice"));
    }
}
