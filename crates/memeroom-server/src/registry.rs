use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use memeroom_core::error::GameError;
use memeroom_core::ids::{RoomId, UserId};
use memeroom_core::room::{
    Room, RoomStatus, RoomSummary, RoomView, Visibility, generate_join_code, is_valid_join_code,
    normalize_join_code, validate_capacity,
};
use memeroom_core::time::timestamp_now;

use crate::broadcaster::{ConnId, ConnectionHandle};
use crate::config::ServerConfig;
use crate::prompts::PromptSource;
use crate::session::{SessionConfig, SessionDeps, SessionHandle, spawn_session};
use crate::transition::TransitionSink;

/// Who is asking, as established by the connection hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlayerIdentity {
    pub user_id: UserId,
    pub nickname: String,
}

/// How a player names the room they want to join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinTarget {
    Id(RoomId),
    Code(String),
}

struct RoomEntry {
    handle: SessionHandle,
    summary: RoomSummary,
    join_code: Option<String>,
    last_activity: Instant,
    /// Creation order, for oldest-first matchmaking.
    seq: u64,
}

#[derive(Default)]
struct DirectoryInner {
    rooms: HashMap<RoomId, RoomEntry>,
    codes: HashMap<String, RoomId>,
    /// The one live room each user belongs to.
    memberships: HashMap<UserId, RoomId>,
    /// The current socket of every connected user.
    connections: HashMap<UserId, ConnectionHandle>,
    next_seq: u64,
}

/// Process-wide index of rooms, join codes, memberships and connections.
///
/// The lock is synchronous and never held across an await; room state
/// itself lives in the sessions and only a summary is mirrored here.
#[derive(Default)]
pub struct Directory {
    inner: Mutex<DirectoryInner>,
}

impl std::fmt::Debug for Directory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("Directory")
            .field("rooms", &inner.rooms.len())
            .field("memberships", &inner.memberships.len())
            .field("connections", &inner.connections.len())
            .finish()
    }
}

impl Directory {
    fn lock(&self) -> MutexGuard<'_, DirectoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mirror a session's latest summary. `touched` marks player activity.
    pub fn update_summary(&self, room_id: RoomId, summary: RoomSummary, touched: bool) {
        let mut inner = self.lock();
        if let Some(entry) = inner.rooms.get_mut(&room_id) {
            entry.summary = summary;
            if touched {
                entry.last_activity = Instant::now();
            }
        }
    }

    /// Forget `user_id`'s membership if it still points at `room_id`.
    pub fn release_user(&self, user_id: &str, room_id: RoomId) {
        let mut inner = self.lock();
        if inner.memberships.get(user_id) == Some(&room_id) {
            inner.memberships.remove(user_id);
        }
    }

    pub fn release_room_members(&self, room_id: RoomId) {
        self.lock().memberships.retain(|_, r| *r != room_id);
    }

    /// Drop every trace of a room whose session has ended.
    pub fn remove_room(&self, room_id: RoomId) {
        let mut inner = self.lock();
        if let Some(entry) = inner.rooms.remove(&room_id)
            && let Some(code) = entry.join_code
        {
            inner.codes.remove(&code);
        }
        inner.memberships.retain(|_, r| *r != room_id);
    }

    pub fn membership(&self, user_id: &str) -> Option<RoomId> {
        self.lock().memberships.get(user_id).copied()
    }

    pub fn summary(&self, room_id: RoomId) -> Option<RoomSummary> {
        self.lock().rooms.get(&room_id).map(|e| e.summary.clone())
    }

    #[cfg(test)]
    pub(crate) fn insert_for_tests(
        &self,
        handle: SessionHandle,
        summary: RoomSummary,
        creator: &str,
    ) {
        let mut inner = self.lock();
        let room_id = handle.room_id();
        inner.memberships.insert(creator.to_string(), room_id);
        inner.rooms.insert(
            room_id,
            RoomEntry {
                handle,
                summary,
                join_code: None,
                last_activity: Instant::now(),
                seq: 0,
            },
        );
    }
}

/// Counts reported by health checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub rooms: usize,
    pub waiting: usize,
    pub playing: usize,
    pub members: usize,
    pub connections: usize,
}

/// Creates, finds and retires rooms, and routes each user to the one room
/// session they belong to.
pub struct RoomRegistry {
    directory: Arc<Directory>,
    deps: SessionDeps,
    default_capacity: u8,
    idle_timeout: Duration,
}

impl RoomRegistry {
    pub fn new(
        config: &ServerConfig,
        prompts: Arc<dyn PromptSource>,
        sink: Arc<dyn TransitionSink>,
    ) -> Self {
        let directory = Arc::new(Directory::default());
        Self {
            deps: SessionDeps {
                config: Arc::new(SessionConfig::from_server_config(config)),
                directory: Arc::clone(&directory),
                prompts,
                sink,
            },
            directory,
            default_capacity: config.game.default_capacity,
            idle_timeout: Duration::from_secs(config.rooms.idle_timeout_secs),
        }
    }

    pub fn directory(&self) -> &Arc<Directory> {
        &self.directory
    }

    /// Open a room with `player` as creator and first participant.
    pub fn create_room(
        &self,
        player: &PlayerIdentity,
        capacity: u8,
        visibility: Visibility,
        conn: Option<ConnectionHandle>,
    ) -> Result<RoomView, GameError> {
        let capacity = validate_capacity(capacity)?;
        let mut inner = self.directory.lock();
        if inner.memberships.contains_key(&player.user_id) {
            return Err(GameError::AlreadyInRoom);
        }

        let join_code = match visibility {
            Visibility::Public => None,
            Visibility::Private => Some(unique_join_code(&inner.codes)),
        };
        let room = Room::new(
            Uuid::new_v4(),
            player.user_id.clone(),
            player.nickname.clone(),
            capacity,
            visibility,
            join_code.clone(),
            timestamp_now(),
        );
        let room_id = room.id;
        let view = room.view();
        let summary = room.summary();
        let handle = spawn_session(room, conn, self.deps.clone());

        let seq = inner.next_seq;
        inner.next_seq += 1;
        if let Some(code) = &join_code {
            inner.codes.insert(code.clone(), room_id);
        }
        inner.memberships.insert(player.user_id.clone(), room_id);
        inner.rooms.insert(
            room_id,
            RoomEntry {
                handle,
                summary,
                join_code,
                last_activity: Instant::now(),
                seq,
            },
        );
        drop(inner);

        tracing::info!(
            %room_id,
            creator = %player.user_id,
            capacity,
            ?visibility,
            "Room created"
        );
        Ok(view)
    }

    /// Join an existing room. Private rooms are reachable by join code only.
    pub async fn join_room(
        &self,
        player: &PlayerIdentity,
        target: JoinTarget,
        conn: Option<ConnectionHandle>,
    ) -> Result<RoomView, GameError> {
        let handle = {
            let mut inner = self.directory.lock();
            if inner.memberships.contains_key(&player.user_id) {
                return Err(GameError::AlreadyInRoom);
            }
            let room_id = match &target {
                JoinTarget::Id(id) => *id,
                JoinTarget::Code(code) => {
                    let code = normalize_join_code(code);
                    if !is_valid_join_code(&code) {
                        return Err(GameError::Validation(format!(
                            "malformed join code: {code:?}"
                        )));
                    }
                    *inner.codes.get(&code).ok_or(GameError::RoomNotFound)?
                },
            };
            let entry = inner.rooms.get(&room_id).ok_or(GameError::RoomNotFound)?;
            if matches!(target, JoinTarget::Id(_))
                && entry.summary.visibility == Visibility::Private
            {
                return Err(GameError::RoomNotFound);
            }
            if entry.summary.status != RoomStatus::Waiting {
                return Err(GameError::RoomNotJoinable);
            }
            let handle = entry.handle.clone();
            // Reserve before the await so a concurrent create/join by the same
            // user sees the membership.
            inner.memberships.insert(player.user_id.clone(), room_id);
            handle
        };

        let room_id = handle.room_id();
        let result = handle
            .join(player.user_id.clone(), player.nickname.clone(), conn)
            .await;
        if let Err(e) = &result {
            self.directory.release_user(&player.user_id, room_id);
            tracing::debug!(%room_id, user_id = %player.user_id, error = %e, "Join rejected");
        }
        result
    }

    /// Leave the user's room. Idempotent: leaving when not in a room, or
    /// naming a room the user is not in, succeeds without effect.
    pub async fn leave_room(&self, user_id: &str, room_id: Option<RoomId>) -> Result<(), GameError> {
        let handle = {
            let mut inner = self.directory.lock();
            let Some(current) = inner.memberships.get(user_id).copied() else {
                return Ok(());
            };
            if room_id.is_some_and(|r| r != current) {
                return Ok(());
            }
            match inner.rooms.get(&current) {
                Some(entry) => entry.handle.clone(),
                None => {
                    inner.memberships.remove(user_id);
                    return Ok(());
                },
            }
        };
        match handle.leave(user_id.to_string()).await {
            Ok(()) => Ok(()),
            Err(GameError::RoomClosed) => {
                self.directory.release_user(user_id, handle.room_id());
                Ok(())
            },
            Err(e) => Err(e),
        }
    }

    /// Seat the player in the oldest public waiting room with a free seat
    /// (of the preferred capacity, if any), or open a new public room.
    pub async fn quick_match(
        &self,
        player: &PlayerIdentity,
        preferred_capacity: Option<u8>,
        conn: Option<ConnectionHandle>,
    ) -> Result<RoomView, GameError> {
        if let Some(capacity) = preferred_capacity {
            validate_capacity(capacity)?;
        }
        if self.directory.membership(&player.user_id).is_some() {
            return Err(GameError::AlreadyInRoom);
        }

        for room_id in self.open_public_rooms(preferred_capacity) {
            match self
                .join_room(player, JoinTarget::Id(room_id), conn.clone())
                .await
            {
                Ok(view) => {
                    tracing::debug!(%room_id, user_id = %player.user_id, "Quick match joined room");
                    return Ok(view);
                },
                Err(
                    GameError::RoomFull
                    | GameError::RoomNotJoinable
                    | GameError::RoomClosed
                    | GameError::RoomNotFound,
                ) => continue,
                Err(e) => return Err(e),
            }
        }

        let capacity = preferred_capacity.unwrap_or(self.default_capacity);
        self.create_room(player, capacity, Visibility::Public, conn)
    }

    fn open_public_rooms(&self, capacity: Option<u8>) -> Vec<RoomId> {
        let inner = self.directory.lock();
        let mut open: Vec<(u64, RoomId)> = inner
            .rooms
            .values()
            .filter(|e| e.summary.visibility == Visibility::Public && e.summary.has_open_seat())
            .filter(|e| capacity.is_none_or(|c| e.summary.capacity == c))
            .map(|e| (e.seq, e.summary.room_id))
            .collect();
        open.sort_unstable();
        open.into_iter().map(|(_, id)| id).collect()
    }

    /// Register `conn` as the user's live socket, closing any socket it
    /// supersedes, and re-attach it to the user's room. Returns that room.
    pub async fn connect(&self, user_id: &str, conn: ConnectionHandle) -> Option<RoomId> {
        let (previous, handle) = {
            let mut inner = self.directory.lock();
            let previous = inner.connections.insert(user_id.to_string(), conn.clone());
            let handle = inner
                .memberships
                .get(user_id)
                .and_then(|room_id| inner.rooms.get(room_id))
                .map(|e| e.handle.clone());
            (previous, handle)
        };

        if let Some(previous) = previous
            && previous.conn_id != conn.conn_id
        {
            tracing::info!(user_id, old = previous.conn_id, new = conn.conn_id, "Connection superseded");
            previous.close();
        }

        let handle = handle?;
        let room_id = handle.room_id();
        match handle.attach(user_id.to_string(), conn).await {
            Ok(()) => Some(room_id),
            Err(GameError::RoomClosed) => {
                tracing::debug!(%room_id, user_id, "Re-attach to closed room");
                self.directory.release_user(user_id, room_id);
                None
            },
            // Not a member yet: a join may still be in flight and owns the reservation.
            Err(e) => {
                tracing::debug!(%room_id, user_id, error = %e, "Re-attach failed");
                None
            },
        }
    }

    /// The socket `conn_id` closed. Ignored when a newer socket already
    /// replaced it.
    pub async fn disconnect(&self, user_id: &str, conn_id: ConnId) {
        let handle = {
            let mut inner = self.directory.lock();
            if inner
                .connections
                .get(user_id)
                .is_none_or(|current| current.conn_id != conn_id)
            {
                return;
            }
            inner.connections.remove(user_id);
            inner
                .memberships
                .get(user_id)
                .and_then(|room_id| inner.rooms.get(room_id))
                .map(|e| e.handle.clone())
        };
        if let Some(handle) = handle {
            handle.detach(user_id.to_string(), conn_id).await;
        }
    }

    /// The session handling the user's room.
    pub fn route(&self, user_id: &str) -> Result<SessionHandle, GameError> {
        let inner = self.directory.lock();
        let room_id = inner
            .memberships
            .get(user_id)
            .ok_or(GameError::NotInRoom)?;
        inner
            .rooms
            .get(room_id)
            .map(|e| e.handle.clone())
            .ok_or(GameError::RoomClosed)
    }

    /// Public rooms still accepting players, oldest first.
    pub fn list_public_rooms(&self) -> Vec<RoomSummary> {
        let inner = self.directory.lock();
        let mut rooms: Vec<&RoomEntry> = inner
            .rooms
            .values()
            .filter(|e| {
                e.summary.visibility == Visibility::Public
                    && e.summary.status == RoomStatus::Waiting
            })
            .collect();
        rooms.sort_by_key(|e| e.seq);
        rooms.into_iter().map(|e| e.summary.clone()).collect()
    }

    /// Summary of a public room. Private rooms are not discoverable.
    pub fn room_summary(&self, room_id: RoomId) -> Option<RoomSummary> {
        self.directory
            .summary(room_id)
            .filter(|s| s.visibility == Visibility::Public)
    }

    pub fn stats(&self) -> RegistryStats {
        let inner = self.directory.lock();
        let mut stats = RegistryStats {
            rooms: inner.rooms.len(),
            members: inner.memberships.len(),
            connections: inner.connections.len(),
            ..RegistryStats::default()
        };
        for entry in inner.rooms.values() {
            match entry.summary.status {
                RoomStatus::Waiting => stats.waiting += 1,
                RoomStatus::Playing => stats.playing += 1,
                RoomStatus::Finished | RoomStatus::Cancelled => {},
            }
        }
        stats
    }

    /// Close waiting rooms nobody has touched for the idle timeout and
    /// forget rooms whose sessions are gone. Returns how many were closed.
    pub async fn reap_idle_rooms(&self) -> usize {
        let idle: Vec<SessionHandle> = {
            let mut inner = self.directory.lock();
            let dead: Vec<RoomId> = inner
                .rooms
                .iter()
                .filter(|(_, e)| e.handle.is_closed())
                .map(|(id, _)| *id)
                .collect();
            for room_id in dead {
                if let Some(entry) = inner.rooms.remove(&room_id)
                    && let Some(code) = entry.join_code
                {
                    inner.codes.remove(&code);
                }
                inner.memberships.retain(|_, r| *r != room_id);
            }
            inner
                .rooms
                .values()
                .filter(|e| {
                    e.summary.status == RoomStatus::Waiting
                        && e.last_activity.elapsed() >= self.idle_timeout
                })
                .map(|e| e.handle.clone())
                .collect()
        };

        for handle in &idle {
            tracing::info!(room_id = %handle.room_id(), "Closing idle room");
            handle.shutdown("room closed after inactivity").await;
        }
        idle.len()
    }

    /// Tell every live room to close. Used on server shutdown.
    pub async fn shutdown_all(&self, reason: &str) {
        let handles: Vec<SessionHandle> = {
            let inner = self.directory.lock();
            inner.rooms.values().map(|e| e.handle.clone()).collect()
        };
        tracing::info!(rooms = handles.len(), "Closing all rooms");
        for handle in handles {
            handle.shutdown(reason).await;
        }
    }

    /// Periodically reap idle rooms until `shutdown` fires.
    pub fn spawn_reaper(
        self: &Arc<Self>,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let closed = registry.reap_idle_rooms().await;
                        if closed > 0 {
                            tracing::info!(closed, "Reaped idle rooms");
                        }
                    },
                }
            }
        })
    }
}

fn unique_join_code(existing: &HashMap<String, RoomId>) -> String {
    loop {
        let code = generate_join_code();
        if !existing.contains_key(&code) {
            return code;
        }
    }
}
