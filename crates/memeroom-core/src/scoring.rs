use serde::{Deserialize, Serialize};

/// Converts a choice's vote count into points. Swappable so rounds can be
/// rebalanced without touching the tally.
pub trait ScoringPolicy: Send + Sync + std::fmt::Debug {
    fn points(&self, votes_received: u32, is_round_winner: bool) -> u32;
}

/// Fixed bonus for the round winner plus partial credit for every vote received.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoteShareScoring {
    pub winner_points: u32,
    pub points_per_vote: u32,
}

impl Default for VoteShareScoring {
    fn default() -> Self {
        Self {
            winner_points: 3,
            points_per_vote: 1,
        }
    }
}

impl ScoringPolicy for VoteShareScoring {
    fn points(&self, votes_received: u32, is_round_winner: bool) -> u32 {
        let bonus = if is_round_winner {
            self.winner_points
        } else {
            0
        };
        bonus.saturating_add(votes_received.saturating_mul(self.points_per_vote))
    }
}

/// Only the round winner scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinnerTakesAll {
    pub points: u32,
}

impl ScoringPolicy for WinnerTakesAll {
    fn points(&self, _votes_received: u32, is_round_winner: bool) -> u32 {
        if is_round_winner { self.points } else { 0 }
    }
}
