use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use memeroom_core::ids::UserId;
use memeroom_core::time::{Timestamp, timestamp_now};

/// What an armed deadline ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Choosing,
    Voting,
    Results,
    /// A finished room staying readable before it shuts down.
    Linger,
}

/// One armed deadline. `generation` identifies it; re-arming bumps the
/// generation so an older firing can be recognised and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDeadline {
    pub phase: Phase,
    pub round: u32,
    pub generation: u64,
    pub at: Instant,
    /// The same deadline in wall-clock millis, as shown to clients.
    pub wall_deadline: Timestamp,
    pub warn_at: Option<Instant>,
}

/// Something that came due.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Wakeup {
    Warning(PhaseDeadline),
    Deadline(PhaseDeadline),
    GraceExpired(UserId),
}

/// Deadlines for one room: at most one phase deadline plus a reconnect
/// grace deadline per disconnected participant.
///
/// This is a plain value owned by the room's session loop, which sleeps
/// until [`PhaseTimer::next_wakeup`] and then collects [`PhaseTimer::due`].
#[derive(Debug, Default)]
pub struct PhaseTimer {
    generation: u64,
    armed: Option<PhaseDeadline>,
    warned: bool,
    grace: HashMap<UserId, Instant>,
}

impl PhaseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm a deadline `duration` from now, replacing any armed one. A
    /// warning is scheduled `warning` before the deadline when that leaves
    /// a positive lead time.
    pub fn arm(
        &mut self,
        phase: Phase,
        round: u32,
        duration: Duration,
        warning: Duration,
    ) -> PhaseDeadline {
        self.generation += 1;
        let now = Instant::now();
        let at = now + duration;
        let warn_at = (!warning.is_zero() && warning < duration).then(|| at - warning);
        let deadline = PhaseDeadline {
            phase,
            round,
            generation: self.generation,
            at,
            wall_deadline: timestamp_now() + duration.as_millis() as Timestamp,
            warn_at,
        };
        self.armed = Some(deadline);
        self.warned = false;
        deadline
    }

    pub fn disarm(&mut self) {
        self.generation += 1;
        self.armed = None;
    }

    /// Whether `generation` still names the most recently armed deadline.
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == generation
    }

    pub fn start_grace(&mut self, user_id: UserId, window: Duration) {
        self.grace.insert(user_id, Instant::now() + window);
    }

    /// Returns true if a grace window was running.
    pub fn cancel_grace(&mut self, user_id: &str) -> bool {
        self.grace.remove(user_id).is_some()
    }

    pub fn clear_grace(&mut self) {
        self.grace.clear();
    }

    /// Earliest instant anything comes due.
    pub fn next_wakeup(&self) -> Option<Instant> {
        let phase = self.armed.map(|d| match d.warn_at {
            Some(w) if !self.warned => w,
            _ => d.at,
        });
        let grace = self.grace.values().min().copied();
        match (phase, grace) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Collect everything due at `now`. A fired deadline is disarmed; each
    /// warning fires once.
    pub fn due(&mut self, now: Instant) -> Vec<Wakeup> {
        let mut out = Vec::new();

        if let Some(deadline) = self.armed {
            if !self.warned
                && let Some(warn_at) = deadline.warn_at
                && warn_at <= now
                && deadline.at > now
            {
                self.warned = true;
                out.push(Wakeup::Warning(deadline));
            }
            if deadline.at <= now {
                self.armed = None;
                out.push(Wakeup::Deadline(deadline));
            }
        }

        let mut expired: Vec<(Instant, UserId)> = self
            .grace
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(user, at)| (*at, user.clone()))
            .collect();
        expired.sort();
        for (_, user_id) in expired {
            self.grace.remove(&user_id);
            out.push(Wakeup::GraceExpired(user_id));
        }

        out
    }
}

/// Sleep until `at`, or forever when nothing is armed.
pub async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deadline_fires_once() {
        let mut timer = PhaseTimer::new();
        let d = timer.arm(Phase::Choosing, 1, Duration::from_secs(60), Duration::ZERO);
        assert_eq!(timer.next_wakeup(), Some(d.at));
        assert!(timer.due(Instant::now()).is_empty());

        tokio::time::advance(Duration::from_secs(60)).await;
        let due = timer.due(Instant::now());
        assert_eq!(due, vec![Wakeup::Deadline(d)]);
        assert!(timer.due(Instant::now()).is_empty());
        assert_eq!(timer.next_wakeup(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_precedes_deadline() {
        let mut timer = PhaseTimer::new();
        let d = timer.arm(
            Phase::Voting,
            2,
            Duration::from_secs(30),
            Duration::from_secs(10),
        );
        assert_eq!(timer.next_wakeup(), d.warn_at);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(timer.due(Instant::now()), vec![Wakeup::Warning(d)]);
        assert_eq!(timer.next_wakeup(), Some(d.at));

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(timer.due(Instant::now()), vec![Wakeup::Deadline(d)]);
    }

    #[tokio::test(start_paused = true)]
    async fn rearm_supersedes_previous_deadline() {
        let mut timer = PhaseTimer::new();
        let first = timer.arm(Phase::Choosing, 1, Duration::from_secs(60), Duration::ZERO);
        let second = timer.arm(Phase::Voting, 1, Duration::from_secs(30), Duration::ZERO);
        assert!(!timer.is_current(first.generation));
        assert!(timer.is_current(second.generation));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(timer.due(Instant::now()), vec![Wakeup::Deadline(second)]);

        timer.disarm();
        assert!(!timer.is_current(second.generation));
    }

    #[tokio::test(start_paused = true)]
    async fn grace_windows_expire_independently() {
        let mut timer = PhaseTimer::new();
        timer.start_grace("a".into(), Duration::from_secs(5));
        timer.start_grace("b".into(), Duration::from_secs(10));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(
            timer.due(Instant::now()),
            vec![Wakeup::GraceExpired("a".into())]
        );
        assert!(timer.cancel_grace("b"));
        assert!(!timer.cancel_grace("b"));
        assert_eq!(timer.next_wakeup(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_longer_than_phase_is_skipped() {
        let mut timer = PhaseTimer::new();
        let d = timer.arm(
            Phase::Results,
            1,
            Duration::from_secs(5),
            Duration::from_secs(10),
        );
        assert_eq!(d.warn_at, None);
    }
}
