use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GameError;
use crate::ids::{CardId, ChoiceId, GameId, RoundId, UserId};
use crate::scoring::ScoringPolicy;
use crate::time::Timestamp;

/// Maximum accepted card reference length in bytes.
pub const MAX_CARD_REF_LEN: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Waiting,
    Choosing,
    Voting,
    Finished,
}

/// A card submitted for the round's prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub choice_id: ChoiceId,
    pub round_id: RoundId,
    pub user_id: UserId,
    pub card_id: CardId,
    pub submitted_at: Timestamp,
    /// Submission order within the round; breaks ties between equal timestamps.
    pub seq: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub round_id: RoundId,
    pub voter_id: UserId,
    pub choice_id: ChoiceId,
    pub cast_at: Timestamp,
}

/// A choice as shown to voters, without its author.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceCard {
    pub choice_id: ChoiceId,
    pub card_id: CardId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChoiceTally {
    pub choice_id: ChoiceId,
    pub user_id: UserId,
    pub card_id: CardId,
    pub votes: u32,
    pub points: u32,
}

/// Outcome of a finished round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundResult {
    pub round_id: RoundId,
    pub round_number: u32,
    /// None when no choice received a vote.
    pub winner: Option<ChoiceTally>,
    /// Ordered by votes (descending), then submission order.
    pub tallies: Vec<ChoiceTally>,
    pub total_votes: u32,
}

/// Count votes and award points.
///
/// Pure: the same choices and votes always produce the same result, whatever
/// order the votes arrived in. The winner is the choice with the most votes;
/// ties go to the earliest submission. A choice needs at least one vote to win.
pub fn tally_votes(
    round_id: RoundId,
    round_number: u32,
    choices: &[Choice],
    votes: &[Vote],
    scoring: &dyn ScoringPolicy,
) -> RoundResult {
    let mut counts: HashMap<ChoiceId, u32> = choices.iter().map(|c| (c.choice_id, 0)).collect();
    let mut total_votes = 0;
    for vote in votes {
        if let Some(count) = counts.get_mut(&vote.choice_id) {
            *count += 1;
            total_votes += 1;
        }
    }

    let votes_for = |c: &Choice| counts.get(&c.choice_id).copied().unwrap_or(0);
    let mut ordered: Vec<&Choice> = choices.iter().collect();
    ordered.sort_by(|a, b| {
        votes_for(b)
            .cmp(&votes_for(a))
            .then(a.submitted_at.cmp(&b.submitted_at))
            .then(a.seq.cmp(&b.seq))
    });

    let winner_id = ordered
        .first()
        .filter(|c| votes_for(c) > 0)
        .map(|c| c.choice_id);

    let tallies: Vec<ChoiceTally> = ordered
        .iter()
        .map(|c| {
            let votes = votes_for(c);
            ChoiceTally {
                choice_id: c.choice_id,
                user_id: c.user_id.clone(),
                card_id: c.card_id.clone(),
                votes,
                points: scoring.points(votes, Some(c.choice_id) == winner_id),
            }
        })
        .collect();

    let winner = winner_id.and_then(|_| tallies.first().cloned());

    RoundResult {
        round_id,
        round_number,
        winner,
        tallies,
        total_votes,
    }
}

/// One prompt → choose → vote cycle.
#[derive(Debug, Clone)]
pub struct Round {
    pub id: RoundId,
    pub game_id: GameId,
    pub number: u32,
    pub prompt: String,
    pub status: RoundStatus,
    /// Wall-clock deadline of the current phase, if one is armed.
    pub deadline: Option<Timestamp>,
    choices: Vec<Choice>,
    votes: Vec<Vote>,
    result: Option<RoundResult>,
}

impl Round {
    pub fn new(game_id: GameId, number: u32, prompt: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            game_id,
            number,
            prompt,
            status: RoundStatus::Waiting,
            deadline: None,
            choices: Vec::new(),
            votes: Vec::new(),
            result: None,
        }
    }

    pub fn begin_choosing(&mut self, deadline: Timestamp) -> Result<(), GameError> {
        if self.status != RoundStatus::Waiting {
            return Err(GameError::PhaseMismatch);
        }
        self.status = RoundStatus::Choosing;
        self.deadline = Some(deadline);
        Ok(())
    }

    pub fn begin_voting(&mut self, deadline: Timestamp) -> Result<(), GameError> {
        if self.status != RoundStatus::Choosing {
            return Err(GameError::PhaseMismatch);
        }
        self.status = RoundStatus::Voting;
        self.deadline = Some(deadline);
        Ok(())
    }

    /// Record a card for `user_id`. A second submission is rejected, never
    /// overwritten.
    pub fn submit_choice(
        &mut self,
        user_id: &str,
        card_id: &str,
        now: Timestamp,
    ) -> Result<&Choice, GameError> {
        if self.status != RoundStatus::Choosing {
            return Err(GameError::PhaseMismatch);
        }
        let card_id = card_id.trim();
        if card_id.is_empty() || card_id.len() > MAX_CARD_REF_LEN {
            return Err(GameError::Validation(format!(
                "card_id must be 1..={MAX_CARD_REF_LEN} bytes"
            )));
        }
        if self.has_submitted(user_id) {
            return Err(GameError::DuplicateSubmission);
        }
        let seq = self.choices.len() as u32;
        self.choices.push(Choice {
            choice_id: Uuid::new_v4(),
            round_id: self.id,
            user_id: user_id.to_string(),
            card_id: card_id.to_string(),
            submitted_at: now,
            seq,
        });
        Ok(&self.choices[self.choices.len() - 1])
    }

    pub fn submit_vote(
        &mut self,
        voter_id: &str,
        choice_id: ChoiceId,
        now: Timestamp,
    ) -> Result<&Vote, GameError> {
        if self.status != RoundStatus::Voting {
            return Err(GameError::PhaseMismatch);
        }
        let choice = self
            .choices
            .iter()
            .find(|c| c.choice_id == choice_id)
            .ok_or(GameError::UnknownChoice)?;
        if choice.user_id == voter_id {
            return Err(GameError::SelfVote);
        }
        if self.vote_of(voter_id).is_some() {
            return Err(GameError::DuplicateVote);
        }
        self.votes.push(Vote {
            round_id: self.id,
            voter_id: voter_id.to_string(),
            choice_id,
            cast_at: now,
        });
        Ok(&self.votes[self.votes.len() - 1])
    }

    pub fn choices(&self) -> &[Choice] {
        &self.choices
    }

    pub fn votes(&self) -> &[Vote] {
        &self.votes
    }

    pub fn has_submitted(&self, user_id: &str) -> bool {
        self.choice_of(user_id).is_some()
    }

    pub fn choice_of(&self, user_id: &str) -> Option<&Choice> {
        self.choices.iter().find(|c| c.user_id == user_id)
    }

    pub fn vote_of(&self, voter_id: &str) -> Option<&Vote> {
        self.votes.iter().find(|v| v.voter_id == voter_id)
    }

    /// Connected users who still owe a card.
    pub fn pending_choosers(&self, connected: &[UserId]) -> Vec<UserId> {
        connected
            .iter()
            .filter(|u| !self.has_submitted(u))
            .cloned()
            .collect()
    }

    /// Connected submitters who have someone else's card to vote for.
    /// Non-submitters are left out of the denominator.
    pub fn eligible_voters(&self, connected: &[UserId]) -> Vec<UserId> {
        if self.choices.len() < 2 {
            return Vec::new();
        }
        connected
            .iter()
            .filter(|u| self.has_submitted(u))
            .cloned()
            .collect()
    }

    pub fn pending_voters(&self, connected: &[UserId]) -> Vec<UserId> {
        self.eligible_voters(connected)
            .into_iter()
            .filter(|u| self.vote_of(u).is_none())
            .collect()
    }

    /// Every connected participant has a card in. An empty table never
    /// completes early; it waits for the deadline.
    pub fn all_choices_in(&self, connected: &[UserId]) -> bool {
        !connected.is_empty() && self.pending_choosers(connected).is_empty()
    }

    pub fn all_votes_in(&self, connected: &[UserId]) -> bool {
        self.pending_voters(connected).is_empty()
    }

    /// Choices in a stable order that does not reveal who submitted first.
    pub fn anonymous_choices(&self) -> Vec<ChoiceCard> {
        let mut cards: Vec<ChoiceCard> = self
            .choices
            .iter()
            .map(|c| ChoiceCard {
                choice_id: c.choice_id,
                card_id: c.card_id.clone(),
            })
            .collect();
        cards.sort_by_key(|c| c.choice_id);
        cards
    }

    /// Tally the round without changing it.
    pub fn tally(&self, scoring: &dyn ScoringPolicy) -> RoundResult {
        tally_votes(self.id, self.number, &self.choices, &self.votes, scoring)
    }

    /// Close the round and return its result. Calling this again on a
    /// finished round returns the stored result unchanged.
    pub fn finish(&mut self, scoring: &dyn ScoringPolicy) -> &RoundResult {
        if self.result.is_none() {
            self.status = RoundStatus::Finished;
            self.deadline = None;
        }
        let (id, number) = (self.id, self.number);
        let (choices, votes) = (&self.choices, &self.votes);
        self.result
            .get_or_insert_with(|| tally_votes(id, number, choices, votes, scoring))
    }

    pub fn result(&self) -> Option<&RoundResult> {
        self.result.as_ref()
    }

    /// Round state as `user_id` is allowed to see it. Cards stay hidden until
    /// voting opens; the viewer always sees their own card and vote.
    pub fn view_for(&self, user_id: &str) -> RoundView {
        let choices = match self.status {
            RoundStatus::Voting | RoundStatus::Finished => self.anonymous_choices(),
            RoundStatus::Waiting | RoundStatus::Choosing => Vec::new(),
        };
        RoundView {
            round_id: self.id,
            number: self.number,
            prompt: self.prompt.clone(),
            status: self.status,
            deadline: self.deadline,
            submitted: self.choices.iter().map(|c| c.user_id.clone()).collect(),
            choices,
            votes_cast: self.votes.len(),
            your_choice: self.choice_of(user_id).map(|c| ChoiceCard {
                choice_id: c.choice_id,
                card_id: c.card_id.clone(),
            }),
            your_vote: self.vote_of(user_id).map(|v| v.choice_id),
        }
    }
}

/// Personalised round state carried in room snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundView {
    pub round_id: RoundId,
    pub number: u32,
    pub prompt: String,
    pub status: RoundStatus,
    pub deadline: Option<Timestamp>,
    /// Who has a card in, without the cards themselves.
    pub submitted: Vec<UserId>,
    /// Empty until voting opens.
    pub choices: Vec<ChoiceCard>,
    pub votes_cast: usize,
    pub your_choice: Option<ChoiceCard>,
    pub your_vote: Option<ChoiceId>,
}
