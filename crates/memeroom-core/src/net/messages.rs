use serde::{Deserialize, Serialize};

use crate::game::{Game, GameStatus, RankingEntry};
use crate::ids::{ChoiceId, GameId, RoomId, RoundId, UserId};
use crate::participant::Participant;
use crate::room::{RoomView, Visibility};
use crate::round::{ChoiceCard, RoundResult, RoundView};
use crate::time::Timestamp;

// ---------------------------------------------------------------------------
// Client -> server
// ---------------------------------------------------------------------------

/// Every action a client may send, as `{ "action": ..., "data": {...} }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "data", rename_all = "snake_case")]
pub enum ClientAction {
    CreateRoom(CreateRoomMsg),
    JoinRoom(JoinRoomMsg),
    QuickMatch(QuickMatchMsg),
    LeaveRoom(LeaveRoomMsg),
    StartGame(StartGameMsg),
    SubmitCardChoice(SubmitCardChoiceMsg),
    SubmitVote(SubmitVoteMsg),
    Ping(PingMsg),
    Sync(SyncMsg),
}

impl ClientAction {
    /// Wire name of the action, used when echoing errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoom(_) => "create_room",
            Self::JoinRoom(_) => "join_room",
            Self::QuickMatch(_) => "quick_match",
            Self::LeaveRoom(_) => "leave_room",
            Self::StartGame(_) => "start_game",
            Self::SubmitCardChoice(_) => "submit_card_choice",
            Self::SubmitVote(_) => "submit_vote",
            Self::Ping(_) => "ping",
            Self::Sync(_) => "sync",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRoomMsg {
    /// Falls back to the server's default capacity.
    pub capacity: Option<u8>,
    pub visibility: Visibility,
}

/// Join by id (public rooms) or by join code (any room). Exactly one of the
/// two must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct JoinRoomMsg {
    pub room_id: Option<RoomId>,
    pub join_code: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuickMatchMsg {
    pub preferred_capacity: Option<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LeaveRoomMsg {
    /// Defaults to the sender's current room.
    pub room_id: Option<RoomId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartGameMsg {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitCardChoiceMsg {
    /// When set, must name the current round.
    #[serde(default)]
    pub round_id: Option<RoundId>,
    pub card_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitVoteMsg {
    #[serde(default)]
    pub round_id: Option<RoundId>,
    pub choice_id: ChoiceId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingMsg {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMsg {}

// ---------------------------------------------------------------------------
// Server -> client
// ---------------------------------------------------------------------------

/// Every event the server pushes, as `{ "type": ..., "data": {...} }`. The
/// codec adds the `timestamp` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomSnapshot(Box<RoomSnapshotMsg>),
    PlayerJoined(PlayerJoinedMsg),
    PlayerLeft(PlayerLeftMsg),
    PlayerDisconnected(PlayerDisconnectedMsg),
    PlayerReconnected(PlayerReconnectedMsg),
    GameStarted(GameStartedMsg),
    RoundStarted(RoundStartedMsg),
    CardChoiceSubmitted(CardChoiceSubmittedMsg),
    VotingStarted(VotingStartedMsg),
    VoteSubmitted(VoteSubmittedMsg),
    RoundEnded(RoundEndedMsg),
    GameEnded(GameEndedMsg),
    TimeoutWarning(TimeoutWarningMsg),
    PlayerTimeout(PlayerTimeoutMsg),
    Error(ErrorMsg),
    Pong(PongMsg),
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RoomSnapshot(_) => "room_snapshot",
            Self::PlayerJoined(_) => "player_joined",
            Self::PlayerLeft(_) => "player_left",
            Self::PlayerDisconnected(_) => "player_disconnected",
            Self::PlayerReconnected(_) => "player_reconnected",
            Self::GameStarted(_) => "game_started",
            Self::RoundStarted(_) => "round_started",
            Self::CardChoiceSubmitted(_) => "card_choice_submitted",
            Self::VotingStarted(_) => "voting_started",
            Self::VoteSubmitted(_) => "vote_submitted",
            Self::RoundEnded(_) => "round_ended",
            Self::GameEnded(_) => "game_ended",
            Self::TimeoutWarning(_) => "timeout_warning",
            Self::PlayerTimeout(_) => "player_timeout",
            Self::Error(_) => "error",
            Self::Pong(_) => "pong",
        }
    }
}

/// Full personalised state, sent on join, reconnect and `sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomSnapshotMsg {
    pub room: RoomView,
    pub game: Option<Game>,
    pub round: Option<RoundView>,
    pub last_result: Option<RoundResult>,
    pub you: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerJoinedMsg {
    pub room_id: RoomId,
    pub participant: Participant,
    pub current_players: usize,
    pub capacity: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveReason {
    /// Explicit `leave_room`.
    Left,
    /// Reconnect grace window ran out.
    GraceExpired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerLeftMsg {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub reason: LeaveReason,
    /// Creator after the departure; changes when the creator left.
    pub creator_id: UserId,
    pub current_players: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerDisconnectedMsg {
    pub room_id: RoomId,
    pub user_id: UserId,
    pub grace_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerReconnectedMsg {
    pub room_id: RoomId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameStartedMsg {
    pub room_id: RoomId,
    pub game_id: GameId,
    pub max_rounds: u32,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundStartedMsg {
    pub round_id: RoundId,
    pub round_number: u32,
    pub max_rounds: u32,
    pub prompt: String,
    pub deadline: Timestamp,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardChoiceSubmittedMsg {
    pub round_id: RoundId,
    pub user_id: UserId,
    pub submitted: usize,
    /// Connected participants expected to submit.
    pub required: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VotingStartedMsg {
    pub round_id: RoundId,
    pub choices: Vec<ChoiceCard>,
    pub deadline: Timestamp,
    pub duration_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteSubmittedMsg {
    pub round_id: RoundId,
    pub voter_id: UserId,
    pub votes_cast: usize,
    pub eligible: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreEntry {
    pub user_id: UserId,
    pub score: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundEndedMsg {
    pub result: RoundResult,
    /// Cumulative scores after this round, in join order.
    pub scores: Vec<ScoreEntry>,
    /// When the next phase begins.
    pub next_phase_at: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameEndedMsg {
    pub game_id: GameId,
    pub rankings: Vec<RankingEntry>,
    pub winner_id: Option<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeoutWarningMsg {
    pub round_id: RoundId,
    pub phase: GameStatus,
    pub deadline: Timestamp,
    pub seconds_left: u64,
}

/// Sent when a phase deadline fires with actions still outstanding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerTimeoutMsg {
    pub round_id: RoundId,
    pub phase: GameStatus,
    pub user_ids: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMsg {
    pub code: String,
    pub message: String,
    /// The action that was rejected, when it could be parsed that far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PongMsg {}
