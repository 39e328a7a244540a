use serde::{Deserialize, Serialize};

use crate::ids::UserId;
use crate::time::Timestamp;

/// Maximum accepted nickname length in bytes.
pub const MAX_NICKNAME_LEN: usize = 32;

/// A user seated in a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub user_id: UserId,
    pub nickname: String,
    /// False while the transport is gone and the grace window is running.
    pub connected: bool,
    pub score: u32,
    /// Monotonic seat order within the room; lower joined earlier.
    pub join_seq: u64,
    pub joined_at: Timestamp,
}

impl Participant {
    pub fn new(user_id: UserId, nickname: String, join_seq: u64, joined_at: Timestamp) -> Self {
        Self {
            user_id,
            nickname,
            connected: true,
            score: 0,
            join_seq,
            joined_at,
        }
    }
}

/// Trim a requested nickname, falling back to the user id when it is unusable.
pub fn sanitize_nickname(requested: Option<&str>, user_id: &str) -> String {
    let trimmed = requested.map(str::trim).unwrap_or_default();
    if trimmed.is_empty()
        || trimmed.len() > MAX_NICKNAME_LEN
        || trimmed.chars().any(char::is_control)
    {
        let mut fallback: String = user_id.chars().take(MAX_NICKNAME_LEN).collect();
        fallback.retain(|c| !c.is_control());
        return fallback;
    }
    trimmed.to_string()
}
