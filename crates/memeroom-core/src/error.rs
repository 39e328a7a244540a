/// Every reason the room/game/round machinery can refuse a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameError {
    Validation(String),
    CapacityInvalid(u8),
    RoomFull,
    RoomNotJoinable,
    AlreadyInRoom,
    RoomNotFound,
    NotInRoom,
    RoomClosed,
    Unauthorized,
    InsufficientPlayers { connected: usize, required: usize },
    PhaseMismatch,
    DuplicateSubmission,
    DuplicateVote,
    SelfVote,
    UnknownChoice,
}

impl GameError {
    /// Stable machine-readable code sent to clients in `error` events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::CapacityInvalid(_) => "capacity_invalid",
            Self::RoomFull => "room_full",
            Self::RoomNotJoinable => "room_not_joinable",
            Self::AlreadyInRoom => "already_in_room",
            Self::RoomNotFound => "room_not_found",
            Self::NotInRoom => "not_in_room",
            Self::RoomClosed => "room_closed",
            Self::Unauthorized => "unauthorized",
            Self::InsufficientPlayers { .. } => "insufficient_players",
            Self::PhaseMismatch => "phase_mismatch",
            Self::DuplicateSubmission => "duplicate_submission",
            Self::DuplicateVote => "duplicate_vote",
            Self::SelfVote => "self_vote",
            Self::UnknownChoice => "unknown_choice",
        }
    }
}

impl std::fmt::Display for GameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(m) => write!(f, "invalid request: {m}"),
            Self::CapacityInvalid(c) => write!(
                f,
                "capacity {c} is outside the allowed range {}..={}",
                crate::room::MIN_CAPACITY,
                crate::room::MAX_CAPACITY
            ),
            Self::RoomFull => write!(f, "room is full"),
            Self::RoomNotJoinable => write!(f, "room is not accepting players"),
            Self::AlreadyInRoom => write!(f, "already a member of an active room"),
            Self::RoomNotFound => write!(f, "room not found"),
            Self::NotInRoom => write!(f, "not a member of this room"),
            Self::RoomClosed => write!(f, "room is closed"),
            Self::Unauthorized => write!(f, "only the room creator can do that"),
            Self::InsufficientPlayers {
                connected,
                required,
            } => write!(
                f,
                "need at least {required} connected players, have {connected}"
            ),
            Self::PhaseMismatch => write!(f, "action not allowed in the current phase"),
            Self::DuplicateSubmission => write!(f, "card already submitted this round"),
            Self::DuplicateVote => write!(f, "vote already cast this round"),
            Self::SelfVote => write!(f, "cannot vote for your own card"),
            Self::UnknownChoice => write!(f, "no such choice in this round"),
        }
    }
}

impl std::error::Error for GameError {}
