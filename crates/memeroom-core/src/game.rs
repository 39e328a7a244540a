use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::{GameId, RoomId, UserId};
use crate::participant::Participant;
use crate::time::Timestamp;

/// Game phase as seen by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Starting,
    CardSelection,
    Voting,
    RoundResults,
    Finished,
}

impl GameStatus {
    /// Whether the phase machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: GameStatus) -> bool {
        matches!(
            (self, next),
            (Self::Starting, Self::CardSelection)
                | (Self::CardSelection, Self::Voting)
                | (Self::CardSelection, Self::RoundResults)
                | (Self::Voting, Self::RoundResults)
                | (Self::RoundResults, Self::CardSelection)
                | (Self::RoundResults, Self::Finished)
                | (Self::CardSelection, Self::Finished)
                | (Self::Voting, Self::Finished)
                | (Self::Starting, Self::Finished)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Game {
    pub id: GameId,
    pub room_id: RoomId,
    pub status: GameStatus,
    pub round_number: u32,
    pub max_rounds: u32,
    pub winner_id: Option<UserId>,
    pub started_at: Timestamp,
    pub ended_at: Option<Timestamp>,
}

impl Game {
    pub fn new(room_id: RoomId, max_rounds: u32, now: Timestamp) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            status: GameStatus::Starting,
            round_number: 0,
            max_rounds,
            winner_id: None,
            started_at: now,
            ended_at: None,
        }
    }

    /// Move to `next`. Returns false and leaves the game untouched when the
    /// transition is not allowed.
    pub fn transition(&mut self, next: GameStatus) -> bool {
        if !self.status.can_transition_to(next) {
            tracing::warn!(
                game_id = %self.id,
                from = ?self.status,
                to = ?next,
                "Invalid game phase transition"
            );
            return false;
        }
        self.status = next;
        true
    }

    pub fn is_last_round(&self) -> bool {
        self.round_number >= self.max_rounds
    }

    pub fn is_finished(&self) -> bool {
        self.status == GameStatus::Finished
    }

    /// Close the game with the final ranking's leader (if anyone scored).
    pub fn finish(&mut self, rankings: &[RankingEntry], now: Timestamp) {
        if self.is_finished() {
            return;
        }
        self.status = GameStatus::Finished;
        self.ended_at = Some(now);
        self.winner_id = rankings
            .first()
            .filter(|r| r.score > 0)
            .map(|r| r.user_id.clone());
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankingEntry {
    /// 1-based. Tied scores still get distinct ranks, earlier join first.
    pub rank: u32,
    pub user_id: UserId,
    pub nickname: String,
    pub score: u32,
}

/// Rank participants by cumulative score, descending; ties go to whoever
/// joined first.
pub fn final_ranking(participants: &[Participant]) -> Vec<RankingEntry> {
    let mut ordered: Vec<&Participant> = participants.iter().collect();
    ordered.sort_by(|a, b| b.score.cmp(&a.score).then(a.join_seq.cmp(&b.join_seq)));
    ordered
        .into_iter()
        .enumerate()
        .map(|(i, p)| RankingEntry {
            rank: i as u32 + 1,
            user_id: p.user_id.clone(),
            nickname: p.nickname.clone(),
            score: p.score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn player(id: &str, seq: u64, score: u32) -> Participant {
        let mut p = Participant::new(id.into(), id.to_uppercase(), seq, 0);
        p.score = score;
        p
    }

    #[test]
    fn phase_order() {
        let mut g = Game::new(Uuid::new_v4(), 3, 0);
        assert!(!g.transition(GameStatus::Voting));
        assert!(g.transition(GameStatus::CardSelection));
        assert!(g.transition(GameStatus::Voting));
        assert!(!g.transition(GameStatus::CardSelection));
        assert!(g.transition(GameStatus::RoundResults));
        assert!(g.transition(GameStatus::CardSelection));
        assert!(g.transition(GameStatus::RoundResults));
        assert!(g.transition(GameStatus::Finished));
        assert!(!g.transition(GameStatus::CardSelection));
    }

    #[test]
    fn ranking_breaks_ties_by_join_order() {
        let ranking = final_ranking(&[player("c", 2, 4), player("a", 0, 4), player("b", 1, 7)]);
        let ids: Vec<&str> = ranking.iter().map(|r| r.user_id.as_str()).collect();
        assert_eq!(ids, ["b", "a", "c"]);
        assert_eq!(ranking[2].rank, 3);
    }

    #[test]
    fn finish_sets_winner_only_when_someone_scored() {
        let mut g = Game::new(Uuid::new_v4(), 1, 0);
        g.finish(&final_ranking(&[player("a", 0, 0), player("b", 1, 0)]), 50);
        assert!(g.is_finished());
        assert_eq!(g.winner_id, None);
        assert_eq!(g.ended_at, Some(50));

        let mut g = Game::new(Uuid::new_v4(), 1, 0);
        g.finish(&final_ranking(&[player("a", 0, 1), player("b", 1, 5)]), 60);
        assert_eq!(g.winner_id.as_deref(), Some("b"));
    }

    #[test]
    fn scoreless_game_ranks_in_join_order() {
        let ranking = final_ranking(&crate::test_helpers::make_participants(3));
        let ranks: Vec<(u32, &str)> = ranking.iter().map(|r| (r.rank, r.user_id.as_str())).collect();
        assert_eq!(ranks, [(1, "u1"), (2, "u2"), (3, "u3")]);
    }

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&GameStatus::CardSelection).unwrap(),
            "\"card_selection\""
        );
    }
}
