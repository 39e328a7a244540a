use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use memeroom_core::ids::RoomId;

/// Supplies the prompt text for each round. Prompts are opaque to the game.
pub trait PromptSource: Send + Sync + 'static {
    fn next_prompt(&self, room_id: RoomId, round_number: u32) -> String;
}

const BUILTIN_PROMPTS: &[&str] = &[
    "When the code works on the first try",
    "Me explaining my side project to my family",
    "The group chat at 3 a.m.",
    "When someone says \"quick call\"",
    "Monday morning, first coffee",
    "When the Wi-Fi drops during a ranked match",
    "Me pretending to understand the meeting",
    "When you finally find the bug and it was a typo",
    "Opening the fridge for the fifth time",
    "When the group chat says \"quick call?\"",
];

/// Cycles through a fixed pool, starting from a random offset.
#[derive(Debug)]
pub struct StaticPrompts {
    pool: Vec<String>,
    cursor: AtomicUsize,
}

impl StaticPrompts {
    /// Use `pool`, or the built-in prompts when it is empty.
    pub fn new(pool: Vec<String>) -> Self {
        let pool = if pool.is_empty() {
            BUILTIN_PROMPTS.iter().map(|p| p.to_string()).collect()
        } else {
            pool
        };
        let start = rand::rng().random_range(0..pool.len());
        Self {
            pool,
            cursor: AtomicUsize::new(start),
        }
    }
}

impl PromptSource for StaticPrompts {
    fn next_prompt(&self, _room_id: RoomId, _round_number: u32) -> String {
        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % self.pool.len();
        self.pool[idx].clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn empty_pool_falls_back_to_builtin() {
        let prompts = StaticPrompts::new(Vec::new());
        assert_eq!(prompts.pool.len(), BUILTIN_PROMPTS.len());
        assert!(!prompts.next_prompt(Uuid::nil(), 1).is_empty());
    }

    #[test]
    fn cycles_through_configured_pool() {
        let prompts = StaticPrompts::new(vec!["a".into(), "b".into()]);
        let first = prompts.next_prompt(Uuid::nil(), 1);
        let second = prompts.next_prompt(Uuid::nil(), 2);
        let third = prompts.next_prompt(Uuid::nil(), 3);
        assert_ne!(first, second);
        assert_eq!(first, third);
    }
}
