use serde::Serialize;

use memeroom_core::game::GameStatus;
use memeroom_core::ids::{GameId, RoomId, UserId};
use memeroom_core::room::RoomStatus;
use memeroom_core::time::Timestamp;

/// A status that changed: the room's lifecycle or the game's phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "of", content = "status", rename_all = "snake_case")]
pub enum TransitionState {
    Room(RoomStatus),
    Game(GameStatus),
}

/// What triggered a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum TransitionCause {
    Player(UserId),
    AllActionsIn,
    Deadline,
    RosterChange,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionRecord {
    pub room_id: RoomId,
    pub game_id: Option<GameId>,
    pub round_number: u32,
    pub from: Option<TransitionState>,
    pub to: TransitionState,
    pub cause: TransitionCause,
    pub at: Timestamp,
}

/// Write-only outlet for state transitions, called after each one is applied.
/// Implementations must not block; the caller is a room's session loop.
pub trait TransitionSink: Send + Sync + 'static {
    fn on_transition(&self, record: &TransitionRecord);
}

/// Default sink: one structured `tracing` event per transition.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTransitionSink;

impl TransitionSink for TracingTransitionSink {
    fn on_transition(&self, record: &TransitionRecord) {
        tracing::info!(
            target: "memeroom::transition",
            room_id = %record.room_id,
            game_id = ?record.game_id,
            round = record.round_number,
            from = ?record.from,
            to = ?record.to,
            cause = ?record.cause,
            at = record.at,
            "State transition"
        );
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Keeps every record for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub records: Mutex<Vec<TransitionRecord>>,
    }

    impl RecordingSink {
        pub fn states(&self) -> Vec<TransitionState> {
            self.records
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.to)
                .collect()
        }
    }

    impl TransitionSink for RecordingSink {
        fn on_transition(&self, record: &TransitionRecord) {
            self.records.lock().unwrap().push(record.clone());
        }
    }
}
