use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::GameError;
use crate::ids::{RoomId, UserId};
use crate::participant::Participant;
use crate::time::Timestamp;

pub const MIN_CAPACITY: u8 = 3;
pub const MAX_CAPACITY: u8 = 8;

/// Letters used in join codes. I and O are left out to avoid confusion with 1 and 0.
const CODE_LETTERS: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Public,
    Private,
}

/// Lifecycle of a room. `Finished` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomStatus {
    Waiting,
    Playing,
    Finished,
    Cancelled,
}

impl RoomStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Cancelled)
    }
}

/// Check a requested capacity against the allowed range.
pub fn validate_capacity(capacity: u8) -> Result<u8, GameError> {
    if (MIN_CAPACITY..=MAX_CAPACITY).contains(&capacity) {
        Ok(capacity)
    } else {
        Err(GameError::CapacityInvalid(capacity))
    }
}

/// Generate a join code in `ABCD-1234` format.
pub fn generate_join_code() -> String {
    let mut rng = rand::rng();
    let mut code = String::with_capacity(9);
    for _ in 0..4 {
        let idx = rng.random_range(0..CODE_LETTERS.len());
        code.push(CODE_LETTERS[idx] as char);
    }
    code.push('-');
    for _ in 0..4 {
        code.push(char::from(b'0' + rng.random_range(0..10u8)));
    }
    code
}

/// Whether `code` has the `ABCD-1234` shape.
pub fn is_valid_join_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 9
        && bytes[..4].iter().all(|b| CODE_LETTERS.contains(b))
        && bytes[4] == b'-'
        && bytes[5..].iter().all(u8::is_ascii_digit)
}

/// Uppercase and trim user-typed join codes before lookup.
pub fn normalize_join_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Authoritative room record, owned by the room's game session.
#[derive(Debug, Clone)]
pub struct Room {
    pub id: RoomId,
    pub creator_id: UserId,
    pub capacity: u8,
    pub visibility: Visibility,
    pub join_code: Option<String>,
    pub status: RoomStatus,
    /// Kept in join order.
    pub participants: Vec<Participant>,
    pub created_at: Timestamp,
    next_join_seq: u64,
}

impl Room {
    /// Create a waiting room with the creator as its only participant.
    pub fn new(
        id: RoomId,
        creator_id: UserId,
        creator_nickname: String,
        capacity: u8,
        visibility: Visibility,
        join_code: Option<String>,
        now: Timestamp,
    ) -> Self {
        let creator = Participant::new(creator_id.clone(), creator_nickname, 0, now);
        Self {
            id,
            creator_id,
            capacity,
            visibility,
            join_code,
            status: RoomStatus::Waiting,
            participants: vec![creator],
            created_at: now,
            next_join_seq: 1,
        }
    }

    pub fn current_players(&self) -> usize {
        self.participants.len()
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.capacity as usize
    }

    pub fn contains(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p.user_id == user_id)
    }

    pub fn participant(&self, user_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.user_id == user_id)
    }

    pub fn participant_mut(&mut self, user_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.user_id == user_id)
    }

    pub fn connected_count(&self) -> usize {
        self.participants.iter().filter(|p| p.connected).count()
    }

    /// Ids of connected participants, in join order.
    pub fn connected_ids(&self) -> Vec<UserId> {
        self.participants
            .iter()
            .filter(|p| p.connected)
            .map(|p| p.user_id.clone())
            .collect()
    }

    /// Seat a new participant. Only waiting rooms with a free seat accept joins.
    pub fn add_participant(
        &mut self,
        user_id: UserId,
        nickname: String,
        now: Timestamp,
    ) -> Result<&Participant, GameError> {
        if self.status != RoomStatus::Waiting {
            return Err(GameError::RoomNotJoinable);
        }
        if self.contains(&user_id) {
            return Err(GameError::AlreadyInRoom);
        }
        if self.is_full() {
            return Err(GameError::RoomFull);
        }
        let seq = self.next_join_seq;
        self.next_join_seq += 1;
        self.participants
            .push(Participant::new(user_id, nickname, seq, now));
        Ok(&self.participants[self.participants.len() - 1])
    }

    /// Remove a participant. If they created a still-waiting room, ownership
    /// passes to the longest-seated remaining participant.
    pub fn remove_participant(&mut self, user_id: &str) -> Option<Participant> {
        let idx = self.participants.iter().position(|p| p.user_id == user_id)?;
        let removed = self.participants.remove(idx);
        if removed.user_id == self.creator_id
            && self.status == RoomStatus::Waiting
            && let Some(next) = self.participants.iter().min_by_key(|p| p.join_seq)
        {
            self.creator_id = next.user_id.clone();
        }
        Some(removed)
    }

    /// Apply a status change. Returns false (and leaves the status alone) for
    /// transitions the room lifecycle does not allow.
    pub fn set_status(&mut self, next: RoomStatus) -> bool {
        let valid = matches!(
            (self.status, next),
            (RoomStatus::Waiting, RoomStatus::Playing)
                | (RoomStatus::Waiting, RoomStatus::Cancelled)
                | (RoomStatus::Playing, RoomStatus::Finished)
        );
        if valid {
            self.status = next;
        } else {
            tracing::warn!(
                room_id = %self.id,
                from = ?self.status,
                to = ?next,
                "Invalid room status transition"
            );
        }
        valid
    }

    pub fn view(&self) -> RoomView {
        RoomView {
            room_id: self.id,
            creator_id: self.creator_id.clone(),
            capacity: self.capacity,
            visibility: self.visibility,
            join_code: self.join_code.clone(),
            status: self.status,
            participants: self.participants.clone(),
        }
    }

    pub fn summary(&self) -> RoomSummary {
        RoomSummary {
            room_id: self.id,
            creator_id: self.creator_id.clone(),
            capacity: self.capacity,
            current_players: self.participants.len(),
            visibility: self.visibility,
            status: self.status,
            created_at: self.created_at,
        }
    }
}

/// Roster-level view of a room sent to its members.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomView {
    pub room_id: RoomId,
    pub creator_id: UserId,
    pub capacity: u8,
    pub visibility: Visibility,
    pub join_code: Option<String>,
    pub status: RoomStatus,
    pub participants: Vec<Participant>,
}

/// Directory-level view of a room, safe to show to non-members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub room_id: RoomId,
    pub creator_id: UserId,
    pub capacity: u8,
    pub current_players: usize,
    pub visibility: Visibility,
    pub status: RoomStatus,
    pub created_at: Timestamp,
}

impl RoomSummary {
    /// Whether quick match may seat someone here.
    pub fn has_open_seat(&self) -> bool {
        self.status == RoomStatus::Waiting && self.current_players < self.capacity as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn room(capacity: u8) -> Room {
        Room::new(
            Uuid::new_v4(),
            "alice".into(),
            "Alice".into(),
            capacity,
            Visibility::Public,
            None,
            0,
        )
    }

    #[test]
    fn capacity_bounds() {
        assert!(validate_capacity(2).is_err());
        assert_eq!(validate_capacity(3), Ok(3));
        assert_eq!(validate_capacity(8), Ok(8));
        assert_eq!(validate_capacity(9), Err(GameError::CapacityInvalid(9)));
    }

    #[test]
    fn join_code_format() {
        for _ in 0..100 {
            let code = generate_join_code();
            assert!(is_valid_join_code(&code), "Invalid join code: {code}");
        }
        assert!(!is_valid_join_code("abcd-1234"));
        assert!(!is_valid_join_code("ABCD1234"));
        assert!(!is_valid_join_code("ABIO-1234"));
        assert_eq!(normalize_join_code(" abcd-1234 "), "ABCD-1234");
    }

    #[test]
    fn join_respects_capacity() {
        let mut r = room(3);
        r.add_participant("bob".into(), "Bob".into(), 1).unwrap();
        r.add_participant("carol".into(), "Carol".into(), 2).unwrap();
        assert!(r.is_full());
        assert_eq!(
            r.add_participant("dave".into(), "Dave".into(), 3).unwrap_err(),
            GameError::RoomFull
        );
        assert_eq!(r.current_players(), 3);
    }

    #[test]
    fn duplicate_join_rejected() {
        let mut r = room(4);
        assert_eq!(
            r.add_participant("alice".into(), "Alice".into(), 1)
                .unwrap_err(),
            GameError::AlreadyInRoom
        );
    }

    #[test]
    fn join_after_start_rejected() {
        let mut r = room(4);
        assert!(r.set_status(RoomStatus::Playing));
        assert_eq!(
            r.add_participant("bob".into(), "Bob".into(), 1).unwrap_err(),
            GameError::RoomNotJoinable
        );
    }

    #[test]
    fn creator_transfers_to_next_oldest() {
        let mut r = room(4);
        r.add_participant("bob".into(), "Bob".into(), 1).unwrap();
        r.add_participant("carol".into(), "Carol".into(), 2).unwrap();
        r.remove_participant("alice");
        assert_eq!(r.creator_id, "bob");
        r.remove_participant("carol");
        assert_eq!(r.creator_id, "bob");
    }

    #[test]
    fn creator_kept_once_playing() {
        let mut r = room(4);
        r.add_participant("bob".into(), "Bob".into(), 1).unwrap();
        r.add_participant("carol".into(), "Carol".into(), 2).unwrap();
        assert!(r.set_status(RoomStatus::Playing));
        assert!(r.remove_participant("alice").is_some());
        assert_eq!(r.creator_id, "alice");
        assert_eq!(r.current_players(), 2);
    }

    #[test]
    fn status_transitions() {
        let mut r = room(4);
        assert!(!r.set_status(RoomStatus::Finished));
        assert!(r.set_status(RoomStatus::Playing));
        assert!(!r.set_status(RoomStatus::Waiting));
        assert!(r.set_status(RoomStatus::Finished));
        assert!(r.status.is_terminal());
    }

    #[test]
    fn summary_open_seat() {
        let mut r = room(3);
        assert!(r.summary().has_open_seat());
        r.add_participant("bob".into(), "Bob".into(), 1).unwrap();
        r.add_participant("carol".into(), "Carol".into(), 2).unwrap();
        assert!(!r.summary().has_open_seat());
    }

    #[test]
    fn connected_ids_skip_offline_players() {
        let mut r = crate::test_helpers::make_room(5, 4);
        assert_eq!(r.connected_count(), 4);
        r.participant_mut("u2").unwrap().connected = false;
        assert_eq!(r.connected_ids(), ["u1", "u3", "u4"]);
        assert_eq!(r.current_players(), 4);
    }

    #[test]
    fn visibility_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Visibility::Private).unwrap(),
            "\"private\""
        );
        assert_eq!(
            serde_json::to_string(&RoomStatus::Cancelled).unwrap(),
            "\"cancelled\""
        );
    }
}
