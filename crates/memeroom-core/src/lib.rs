pub mod error;
pub mod game;
pub mod ids;
pub mod net;
pub mod participant;
pub mod room;
pub mod round;
pub mod scoring;
pub mod time;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use uuid::Uuid;

    use crate::ids::{ChoiceId, UserId};
    use crate::participant::Participant;
    use crate::room::{Room, Visibility};
    use crate::round::Round;

    /// User ids `u1..=un`.
    pub fn user_ids(n: usize) -> Vec<UserId> {
        (1..=n).map(|i| format!("u{i}")).collect()
    }

    /// `n` connected participants in join order with zero scores.
    pub fn make_participants(n: usize) -> Vec<Participant> {
        user_ids(n)
            .into_iter()
            .enumerate()
            .map(|(i, id)| Participant::new(id, format!("Player{}", i + 1), i as u64, 0))
            .collect()
    }

    /// A waiting public room created by `u1` and filled with `players` members.
    pub fn make_room(capacity: u8, players: usize) -> Room {
        let ids = user_ids(players.max(1));
        let mut room = Room::new(
            Uuid::new_v4(),
            ids[0].clone(),
            "Player1".into(),
            capacity,
            Visibility::Public,
            None,
            0,
        );
        for (i, id) in ids.iter().enumerate().skip(1) {
            let _ = room.add_participant(id.clone(), format!("Player{}", i + 1), i as u64);
        }
        room
    }

    /// A round in voting where every user in `submitters` has a card in.
    /// Returns the round and the choice ids in submission order.
    pub fn round_in_voting(submitters: &[UserId]) -> (Round, Vec<ChoiceId>) {
        let mut round = Round::new(Uuid::new_v4(), 1, "test prompt".into());
        let _ = round.begin_choosing(u64::MAX);
        let ids = submitters
            .iter()
            .enumerate()
            .filter_map(|(i, u)| {
                round
                    .submit_choice(u, &format!("card-{u}"), i as u64)
                    .ok()
                    .map(|c| c.choice_id)
            })
            .collect();
        let _ = round.begin_voting(u64::MAX);
        (round, ids)
    }
}
