use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use memeroom_core::error::GameError;
use memeroom_core::game::{Game, GameStatus, final_ranking};
use memeroom_core::ids::{ChoiceId, RoomId, RoundId, UserId};
use memeroom_core::net::messages::{
    CardChoiceSubmittedMsg, ErrorMsg, GameEndedMsg, GameStartedMsg, LeaveReason,
    PlayerDisconnectedMsg, PlayerJoinedMsg, PlayerLeftMsg, PlayerReconnectedMsg,
    PlayerTimeoutMsg, RoomSnapshotMsg, RoundEndedMsg, RoundStartedMsg, ScoreEntry, ServerEvent,
    TimeoutWarningMsg, VoteSubmittedMsg, VotingStartedMsg,
};
use memeroom_core::room::{Room, RoomStatus, RoomView};
use memeroom_core::round::{Round, RoundResult};
use memeroom_core::scoring::ScoringPolicy;
use memeroom_core::time::timestamp_now;

use crate::broadcaster::{Broadcaster, ConnId, ConnectionHandle};
use crate::config::ServerConfig;
use crate::prompts::PromptSource;
use crate::registry::Directory;
use crate::scheduler::{Phase, PhaseDeadline, PhaseTimer, Wakeup, sleep_until};
use crate::transition::{TransitionCause, TransitionRecord, TransitionSink, TransitionState};

/// Rules and pacing shared by every room session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub min_players: usize,
    pub max_rounds: u32,
    pub choosing: Duration,
    pub voting: Duration,
    pub results: Duration,
    pub warning: Duration,
    pub reconnect_grace: Duration,
    pub finished_linger: Duration,
    /// Inbox capacity.
    pub queue: usize,
    pub scoring: Arc<dyn ScoringPolicy>,
}

impl SessionConfig {
    pub fn from_server_config(config: &ServerConfig) -> Self {
        Self {
            min_players: config.game.min_players,
            max_rounds: config.game.max_rounds,
            choosing: config.game.choosing(),
            voting: config.game.voting(),
            results: config.game.results(),
            warning: config.game.timeout_warning(),
            reconnect_grace: config.game.reconnect_grace(),
            finished_linger: Duration::from_secs(config.rooms.finished_linger_secs),
            queue: config.limits.session_queue,
            scoring: Arc::new(config.scoring),
        }
    }
}

/// Everything a session needs besides its room.
#[derive(Clone)]
pub struct SessionDeps {
    pub config: Arc<SessionConfig>,
    pub directory: Arc<Directory>,
    pub prompts: Arc<dyn PromptSource>,
    pub sink: Arc<dyn TransitionSink>,
}

type Reply<T> = oneshot::Sender<Result<T, GameError>>;

/// Inputs to a room's session. Every room mutation goes through here.
#[derive(Debug)]
pub enum SessionCommand {
    Join {
        user_id: UserId,
        nickname: String,
        conn: Option<ConnectionHandle>,
        reply: Reply<RoomView>,
    },
    Leave {
        user_id: UserId,
        reply: Reply<()>,
    },
    /// A returning connection for an existing participant.
    Attach {
        user_id: UserId,
        conn: ConnectionHandle,
        reply: Reply<()>,
    },
    /// The participant's socket `conn_id` went away.
    Detach {
        user_id: UserId,
        conn_id: ConnId,
    },
    StartGame {
        user_id: UserId,
        reply: Reply<()>,
    },
    SubmitChoice {
        user_id: UserId,
        round_id: Option<RoundId>,
        card_id: String,
        reply: Reply<()>,
    },
    SubmitVote {
        user_id: UserId,
        round_id: Option<RoundId>,
        choice_id: ChoiceId,
        reply: Reply<()>,
    },
    /// Fresh snapshot for `user_id`, also queued on `conn` in event order.
    Sync {
        user_id: UserId,
        conn: Option<ConnectionHandle>,
        reply: Reply<RoomSnapshotMsg>,
    },
    /// A phase deadline fired. Produced by the session's own timer.
    AdvancePhase {
        phase: Phase,
        generation: u64,
    },
    Shutdown {
        reason: String,
    },
    #[cfg(test)]
    Crash,
}

/// Cloneable address of a running room session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    room_id: RoomId,
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    pub fn room_id(&self) -> RoomId {
        self.room_id
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, GameError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(make(tx))
            .await
            .map_err(|_| GameError::RoomClosed)?;
        rx.await.map_err(|_| GameError::RoomClosed)?
    }

    async fn notify(&self, cmd: SessionCommand) {
        if self.sender.send(cmd).await.is_err() {
            tracing::debug!(room_id = %self.room_id, "Session already stopped");
        }
    }

    pub async fn join(
        &self,
        user_id: UserId,
        nickname: String,
        conn: Option<ConnectionHandle>,
    ) -> Result<RoomView, GameError> {
        self.request(|reply| SessionCommand::Join {
            user_id,
            nickname,
            conn,
            reply,
        })
        .await
    }

    pub async fn leave(&self, user_id: UserId) -> Result<(), GameError> {
        self.request(|reply| SessionCommand::Leave { user_id, reply })
            .await
    }

    pub async fn attach(&self, user_id: UserId, conn: ConnectionHandle) -> Result<(), GameError> {
        self.request(|reply| SessionCommand::Attach {
            user_id,
            conn,
            reply,
        })
        .await
    }

    pub async fn detach(&self, user_id: UserId, conn_id: ConnId) {
        self.notify(SessionCommand::Detach { user_id, conn_id })
            .await;
    }

    pub async fn start_game(&self, user_id: UserId) -> Result<(), GameError> {
        self.request(|reply| SessionCommand::StartGame { user_id, reply })
            .await
    }

    pub async fn submit_choice(
        &self,
        user_id: UserId,
        round_id: Option<RoundId>,
        card_id: String,
    ) -> Result<(), GameError> {
        self.request(|reply| SessionCommand::SubmitChoice {
            user_id,
            round_id,
            card_id,
            reply,
        })
        .await
    }

    pub async fn submit_vote(
        &self,
        user_id: UserId,
        round_id: Option<RoundId>,
        choice_id: ChoiceId,
    ) -> Result<(), GameError> {
        self.request(|reply| SessionCommand::SubmitVote {
            user_id,
            round_id,
            choice_id,
            reply,
        })
        .await
    }

    pub async fn sync(
        &self,
        user_id: UserId,
        conn: Option<ConnectionHandle>,
    ) -> Result<RoomSnapshotMsg, GameError> {
        self.request(|reply| SessionCommand::Sync {
            user_id,
            conn,
            reply,
        })
        .await
    }

    pub async fn shutdown(&self, reason: impl Into<String>) {
        self.notify(SessionCommand::Shutdown {
            reason: reason.into(),
        })
        .await;
    }

    #[cfg(test)]
    pub(crate) async fn crash(&self) {
        self.notify(SessionCommand::Crash).await;
    }
}

/// Spawn the actor for `room` plus a supervisor that removes the room from
/// the directory when the actor ends, whether it stopped or panicked.
///
/// Synchronous so the registry can call it while holding its directory lock.
pub fn spawn_session(
    room: Room,
    creator_conn: Option<ConnectionHandle>,
    deps: SessionDeps,
) -> SessionHandle {
    let room_id = room.id;
    let (sender, inbox) = mpsc::channel(deps.config.queue);
    let directory = Arc::clone(&deps.directory);
    let session = GameSession::new(room, deps);

    let actor = tokio::spawn(session.run(inbox, creator_conn));
    tokio::spawn(async move {
        match actor.await {
            Ok(()) => tracing::debug!(%room_id, "Room session stopped"),
            Err(e) if e.is_panic() => {
                tracing::error!(%room_id, "Room session panicked, closing room");
            },
            Err(e) => tracing::warn!(%room_id, error = %e, "Room session task failed"),
        }
        directory.remove_room(room_id);
    });

    SessionHandle { room_id, sender }
}

/// The single owner of a room's roster, game and round state.
struct GameSession {
    room: Room,
    game: Option<Game>,
    round: Option<Round>,
    last_result: Option<RoundResult>,
    timer: PhaseTimer,
    broadcaster: Broadcaster,
    /// Subscribers dropped during delivery, handled once the current input is done.
    pending_drops: Vec<UserId>,
    deps: SessionDeps,
    stopped: bool,
}

impl GameSession {
    fn new(room: Room, deps: SessionDeps) -> Self {
        Self {
            broadcaster: Broadcaster::new(room.id),
            room,
            game: None,
            round: None,
            last_result: None,
            timer: PhaseTimer::new(),
            pending_drops: Vec::new(),
            deps,
            stopped: false,
        }
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<SessionCommand>,
        creator_conn: Option<ConnectionHandle>,
    ) {
        let creator = self.room.creator_id.clone();
        tracing::info!(room_id = %self.room.id, creator = %creator, "Room opened");
        self.record(
            None,
            TransitionState::Room(RoomStatus::Waiting),
            TransitionCause::Player(creator.clone()),
        );
        if let Some(conn) = creator_conn {
            self.broadcaster.subscribe(creator.clone(), conn);
            self.send_snapshot(&creator);
        }
        self.settle(true);

        while !self.stopped {
            tokio::select! {
                cmd = inbox.recv() => match cmd {
                    Some(cmd) => {
                        self.handle(cmd);
                        self.settle(true);
                    },
                    None => break,
                },
                () = sleep_until(self.timer.next_wakeup()) => {
                    for wakeup in self.timer.due(Instant::now()) {
                        self.on_wakeup(wakeup);
                    }
                    self.settle(false);
                },
            }
        }
        tracing::info!(room_id = %self.room.id, status = ?self.room.status, "Room closed");
    }

    fn handle(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Join {
                user_id,
                nickname,
                conn,
                reply,
            } => {
                let _ = reply.send(self.join(user_id, nickname, conn));
            },
            SessionCommand::Leave { user_id, reply } => {
                self.leave(&user_id);
                let _ = reply.send(Ok(()));
            },
            SessionCommand::Attach {
                user_id,
                conn,
                reply,
            } => {
                let _ = reply.send(self.attach(&user_id, conn));
            },
            SessionCommand::Detach { user_id, conn_id } => self.detach(&user_id, conn_id),
            SessionCommand::StartGame { user_id, reply } => {
                let _ = reply.send(self.start_game(&user_id));
            },
            SessionCommand::SubmitChoice {
                user_id,
                round_id,
                card_id,
                reply,
            } => {
                let _ = reply.send(self.submit_choice(&user_id, round_id, &card_id));
            },
            SessionCommand::SubmitVote {
                user_id,
                round_id,
                choice_id,
                reply,
            } => {
                let _ = reply.send(self.submit_vote(&user_id, round_id, choice_id));
            },
            SessionCommand::Sync {
                user_id,
                conn,
                reply,
            } => {
                let snapshot = if self.room.contains(&user_id) {
                    let snapshot = self.snapshot_for(&user_id);
                    if let Some(conn) = conn {
                        self.deliver_snapshot(&user_id, &conn, &snapshot);
                    }
                    Ok(snapshot)
                } else {
                    Err(GameError::NotInRoom)
                };
                let _ = reply.send(snapshot);
            },
            SessionCommand::AdvancePhase { phase, generation } => {
                self.on_phase_deadline(phase, generation);
            },
            SessionCommand::Shutdown { reason } => self.shutdown(&reason),
            #[cfg(test)]
            SessionCommand::Crash => panic!("session crash requested"),
        }
    }

    fn on_wakeup(&mut self, wakeup: Wakeup) {
        match wakeup {
            Wakeup::Warning(deadline) => self.publish_warning(deadline),
            Wakeup::Deadline(deadline) => self.handle(SessionCommand::AdvancePhase {
                phase: deadline.phase,
                generation: deadline.generation,
            }),
            Wakeup::GraceExpired(user_id) => self.on_grace_expired(&user_id),
        }
    }

    /// Deal with subscribers dropped mid-delivery, then advance any phase
    /// that is now complete, then refresh the directory's summary.
    fn settle(&mut self, touched: bool) {
        loop {
            while let Some(user_id) = self.pending_drops.pop() {
                self.mark_disconnected(&user_id);
            }
            if self.stopped || !self.advance_if_complete() {
                break;
            }
        }
        if !self.stopped {
            self.deps
                .directory
                .update_summary(self.room.id, self.room.summary(), touched);
        }
    }

    // ---------------------------------------------------------------------
    // Roster
    // ---------------------------------------------------------------------

    fn join(
        &mut self,
        user_id: UserId,
        nickname: String,
        conn: Option<ConnectionHandle>,
    ) -> Result<RoomView, GameError> {
        let participant = self
            .room
            .add_participant(user_id.clone(), nickname, timestamp_now())?
            .clone();
        tracing::info!(
            room_id = %self.room.id,
            user_id = %user_id,
            players = self.room.current_players(),
            "Player joined"
        );
        if let Some(conn) = conn {
            self.broadcaster.subscribe(user_id.clone(), conn);
        }
        self.send_snapshot(&user_id);
        self.publish(ServerEvent::PlayerJoined(PlayerJoinedMsg {
            room_id: self.room.id,
            participant,
            current_players: self.room.current_players(),
            capacity: self.room.capacity,
        }));
        Ok(self.room.view())
    }

    fn leave(&mut self, user_id: &str) {
        if self.room.status.is_terminal() || !self.room.contains(user_id) {
            self.broadcaster.unsubscribe(user_id);
            self.deps.directory.release_user(user_id, self.room.id);
            return;
        }
        self.remove_participant(user_id, LeaveReason::Left);
    }

    fn remove_participant(&mut self, user_id: &str, reason: LeaveReason) {
        if self.room.remove_participant(user_id).is_none() {
            return;
        }
        self.broadcaster.unsubscribe(user_id);
        self.timer.cancel_grace(user_id);
        self.deps.directory.release_user(user_id, self.room.id);
        tracing::info!(
            room_id = %self.room.id,
            user_id,
            ?reason,
            players = self.room.current_players(),
            "Player left"
        );
        self.publish(ServerEvent::PlayerLeft(PlayerLeftMsg {
            room_id: self.room.id,
            user_id: user_id.to_string(),
            reason,
            creator_id: self.room.creator_id.clone(),
            current_players: self.room.current_players(),
        }));

        if self.room.participants.is_empty() {
            match self.room.status {
                RoomStatus::Waiting => self.cancel_room(TransitionCause::RosterChange),
                RoomStatus::Playing => {
                    self.end_game(TransitionCause::RosterChange);
                    self.stopped = true;
                },
                RoomStatus::Finished | RoomStatus::Cancelled => {},
            }
        }
    }

    fn attach(&mut self, user_id: &str, conn: ConnectionHandle) -> Result<(), GameError> {
        if self.room.status.is_terminal() {
            return Err(GameError::RoomClosed);
        }
        let participant = self
            .room
            .participant_mut(user_id)
            .ok_or(GameError::NotInRoom)?;
        let was_connected = participant.connected;
        participant.connected = true;
        self.timer.cancel_grace(user_id);
        self.broadcaster.subscribe(user_id.to_string(), conn);
        self.send_snapshot(user_id);
        if !was_connected {
            tracing::info!(room_id = %self.room.id, user_id, "Player reconnected");
            self.publish(ServerEvent::PlayerReconnected(PlayerReconnectedMsg {
                room_id: self.room.id,
                user_id: user_id.to_string(),
            }));
        }
        Ok(())
    }

    fn detach(&mut self, user_id: &str, conn_id: ConnId) {
        // A newer connection already took over.
        if !self.broadcaster.unsubscribe_conn(user_id, conn_id)
            && self.broadcaster.conn_id_of(user_id).is_some()
        {
            return;
        }
        self.mark_disconnected(user_id);
    }

    /// Flag a participant offline and start their grace window. They never
    /// block phase completion while offline.
    fn mark_disconnected(&mut self, user_id: &str) {
        if self.room.status.is_terminal() {
            return;
        }
        let Some(participant) = self.room.participant_mut(user_id) else {
            return;
        };
        if !participant.connected {
            return;
        }
        participant.connected = false;
        let grace = self.deps.config.reconnect_grace;
        self.timer.start_grace(user_id.to_string(), grace);
        tracing::info!(
            room_id = %self.room.id,
            user_id,
            grace_secs = grace.as_secs(),
            "Player disconnected"
        );
        self.publish(ServerEvent::PlayerDisconnected(PlayerDisconnectedMsg {
            room_id: self.room.id,
            user_id: user_id.to_string(),
            grace_secs: grace.as_secs(),
        }));
    }

    fn on_grace_expired(&mut self, user_id: &str) {
        let still_offline = self
            .room
            .participant(user_id)
            .is_some_and(|p| !p.connected);
        if still_offline && !self.room.status.is_terminal() {
            tracing::info!(room_id = %self.room.id, user_id, "Reconnect grace expired");
            self.remove_participant(user_id, LeaveReason::GraceExpired);
        }
    }

    // ---------------------------------------------------------------------
    // Game flow
    // ---------------------------------------------------------------------

    fn start_game(&mut self, user_id: &str) -> Result<(), GameError> {
        if !self.room.contains(user_id) {
            return Err(GameError::NotInRoom);
        }
        if self.room.status != RoomStatus::Waiting {
            return Err(GameError::PhaseMismatch);
        }
        if self.room.creator_id != user_id {
            return Err(GameError::Unauthorized);
        }
        let connected = self.room.connected_count();
        let required = self.deps.config.min_players;
        if connected < required {
            return Err(GameError::InsufficientPlayers {
                connected,
                required,
            });
        }

        let cause = TransitionCause::Player(user_id.to_string());
        self.room.set_status(RoomStatus::Playing);
        self.record(
            Some(TransitionState::Room(RoomStatus::Waiting)),
            TransitionState::Room(RoomStatus::Playing),
            cause.clone(),
        );
        let game = Game::new(self.room.id, self.deps.config.max_rounds, timestamp_now());
        let game_id = game.id;
        let max_rounds = game.max_rounds;
        self.game = Some(game);
        self.record(None, TransitionState::Game(GameStatus::Starting), cause.clone());
        tracing::info!(room_id = %self.room.id, %game_id, players = connected, "Game started");

        self.publish(ServerEvent::GameStarted(GameStartedMsg {
            room_id: self.room.id,
            game_id,
            max_rounds,
            participants: self.room.participants.clone(),
        }));
        self.start_round(cause);
        Ok(())
    }

    fn start_round(&mut self, cause: TransitionCause) {
        let config = Arc::clone(&self.deps.config);
        let Some(game) = self.game.as_mut() else {
            return;
        };
        let from = game.status;
        if !game.transition(GameStatus::CardSelection) {
            return;
        }
        game.round_number += 1;
        let (game_id, number, max_rounds) = (game.id, game.round_number, game.max_rounds);

        let prompt = self.deps.prompts.next_prompt(self.room.id, number);
        let deadline = self
            .timer
            .arm(Phase::Choosing, number, config.choosing, config.warning);
        let mut round = Round::new(game_id, number, prompt.clone());
        if let Err(e) = round.begin_choosing(deadline.wall_deadline) {
            tracing::error!(room_id = %self.room.id, error = %e, "Fresh round refused to open");
            return;
        }
        let round_id = round.id;
        self.round = Some(round);
        self.record(
            Some(TransitionState::Game(from)),
            TransitionState::Game(GameStatus::CardSelection),
            cause,
        );
        tracing::debug!(room_id = %self.room.id, round = number, "Round started");

        self.publish(ServerEvent::RoundStarted(RoundStartedMsg {
            round_id,
            round_number: number,
            max_rounds,
            prompt,
            deadline: deadline.wall_deadline,
            duration_secs: config.choosing.as_secs(),
        }));
    }

    fn submit_choice(
        &mut self,
        user_id: &str,
        round_id: Option<RoundId>,
        card_id: &str,
    ) -> Result<(), GameError> {
        if !self.room.contains(user_id) {
            return Err(GameError::NotInRoom);
        }
        if self.phase() != Some(GameStatus::CardSelection) {
            return Err(GameError::PhaseMismatch);
        }
        let round = self.round.as_mut().ok_or(GameError::PhaseMismatch)?;
        if round_id.is_some_and(|id| id != round.id) {
            return Err(GameError::PhaseMismatch);
        }
        round.submit_choice(user_id, card_id, timestamp_now())?;
        let (round_id, submitted) = (round.id, round.choices().len());

        self.publish(ServerEvent::CardChoiceSubmitted(CardChoiceSubmittedMsg {
            round_id,
            user_id: user_id.to_string(),
            submitted,
            required: self.room.connected_count(),
        }));
        Ok(())
    }

    fn submit_vote(
        &mut self,
        user_id: &str,
        round_id: Option<RoundId>,
        choice_id: ChoiceId,
    ) -> Result<(), GameError> {
        if !self.room.contains(user_id) {
            return Err(GameError::NotInRoom);
        }
        if self.phase() != Some(GameStatus::Voting) {
            return Err(GameError::PhaseMismatch);
        }
        let connected = self.room.connected_ids();
        let round = self.round.as_mut().ok_or(GameError::PhaseMismatch)?;
        if round_id.is_some_and(|id| id != round.id) {
            return Err(GameError::PhaseMismatch);
        }
        round.submit_vote(user_id, choice_id, timestamp_now())?;
        let event = VoteSubmittedMsg {
            round_id: round.id,
            voter_id: user_id.to_string(),
            votes_cast: round.votes().len(),
            eligible: round.eligible_voters(&connected).len(),
        };

        self.publish(ServerEvent::VoteSubmitted(event));
        Ok(())
    }

    fn phase(&self) -> Option<GameStatus> {
        self.game.as_ref().map(|g| g.status)
    }

    /// Advance when every required action is in. Returns true if it did.
    fn advance_if_complete(&mut self) -> bool {
        let connected = self.room.connected_ids();
        let complete = match (self.phase(), self.round.as_ref()) {
            (Some(GameStatus::CardSelection), Some(round)) => round.all_choices_in(&connected),
            (Some(GameStatus::Voting), Some(round)) => round.all_votes_in(&connected),
            _ => false,
        };
        if complete {
            self.advance(TransitionCause::AllActionsIn);
        }
        complete
    }

    fn on_phase_deadline(&mut self, phase: Phase, generation: u64) {
        if !self.timer.is_current(generation) {
            tracing::debug!(room_id = %self.room.id, ?phase, generation, "Ignoring superseded deadline");
            return;
        }
        match phase {
            Phase::Linger => self.stopped = true,
            Phase::Choosing | Phase::Voting | Phase::Results => {
                self.advance(TransitionCause::Deadline);
            },
        }
    }

    fn advance(&mut self, cause: TransitionCause) {
        match self.phase() {
            Some(GameStatus::CardSelection) => self.close_choosing(cause),
            Some(GameStatus::Voting) => self.close_voting(cause),
            Some(GameStatus::RoundResults) => self.next_round_or_finish(cause),
            Some(GameStatus::Starting | GameStatus::Finished) | None => {},
        }
    }

    fn close_choosing(&mut self, cause: TransitionCause) {
        let config = Arc::clone(&self.deps.config);
        let connected = self.room.connected_ids();
        let Some(round) = self.round.as_ref() else {
            return;
        };
        let (round_id, number) = (round.id, round.number);
        let missing = round.pending_choosers(&connected);
        let no_choices = round.choices().is_empty();

        if cause == TransitionCause::Deadline && !missing.is_empty() {
            self.publish(ServerEvent::PlayerTimeout(PlayerTimeoutMsg {
                round_id,
                phase: GameStatus::CardSelection,
                user_ids: missing,
            }));
        }
        if no_choices {
            self.close_round(cause);
            return;
        }

        let deadline = self
            .timer
            .arm(Phase::Voting, number, config.voting, config.warning);
        let Some(round) = self.round.as_mut() else {
            return;
        };
        if let Err(e) = round.begin_voting(deadline.wall_deadline) {
            tracing::error!(room_id = %self.room.id, error = %e, "Round refused to open voting");
            return;
        }
        let choices = round.anonymous_choices();
        if let Some(game) = self.game.as_mut() {
            game.transition(GameStatus::Voting);
        }
        self.record(
            Some(TransitionState::Game(GameStatus::CardSelection)),
            TransitionState::Game(GameStatus::Voting),
            cause,
        );
        self.publish(ServerEvent::VotingStarted(VotingStartedMsg {
            round_id,
            choices,
            deadline: deadline.wall_deadline,
            duration_secs: config.voting.as_secs(),
        }));
    }

    fn close_voting(&mut self, cause: TransitionCause) {
        let connected = self.room.connected_ids();
        if cause == TransitionCause::Deadline
            && let Some(round) = self.round.as_ref()
        {
            let missing = round.pending_voters(&connected);
            if !missing.is_empty() {
                let round_id = round.id;
                self.publish(ServerEvent::PlayerTimeout(PlayerTimeoutMsg {
                    round_id,
                    phase: GameStatus::Voting,
                    user_ids: missing,
                }));
            }
        }
        self.close_round(cause);
    }

    /// Tally the round, bank the points and show results.
    fn close_round(&mut self, cause: TransitionCause) {
        let config = Arc::clone(&self.deps.config);
        let Some(round) = self.round.as_mut() else {
            return;
        };
        let result = round.finish(config.scoring.as_ref()).clone();
        for tally in &result.tallies {
            if let Some(p) = self.room.participant_mut(&tally.user_id) {
                p.score = p.score.saturating_add(tally.points);
            }
        }

        let Some(game) = self.game.as_mut() else {
            return;
        };
        let from = game.status;
        game.transition(GameStatus::RoundResults);
        let deadline = self
            .timer
            .arm(Phase::Results, result.round_number, config.results, Duration::ZERO);
        self.last_result = Some(result.clone());
        self.record(
            Some(TransitionState::Game(from)),
            TransitionState::Game(GameStatus::RoundResults),
            cause,
        );
        tracing::info!(
            room_id = %self.room.id,
            round = result.round_number,
            winner = ?result.winner.as_ref().map(|w| &w.user_id),
            votes = result.total_votes,
            "Round scored"
        );

        let scores = self
            .room
            .participants
            .iter()
            .map(|p| ScoreEntry {
                user_id: p.user_id.clone(),
                score: p.score,
            })
            .collect();
        self.publish(ServerEvent::RoundEnded(RoundEndedMsg {
            result,
            scores,
            next_phase_at: deadline.wall_deadline,
        }));
    }

    fn next_round_or_finish(&mut self, cause: TransitionCause) {
        let Some(game) = self.game.as_ref() else {
            return;
        };
        if game.is_last_round() || self.room.connected_count() <= 1 {
            self.end_game(cause);
        } else {
            self.start_round(cause);
        }
    }

    /// Rank, close the game, release every membership and linger briefly so
    /// the final state stays readable.
    fn end_game(&mut self, cause: TransitionCause) {
        let rankings = final_ranking(&self.room.participants);
        let Some(game) = self.game.as_mut() else {
            return;
        };
        if game.is_finished() {
            return;
        }
        let from = game.status;
        game.finish(&rankings, timestamp_now());
        let (game_id, winner_id, round) = (game.id, game.winner_id.clone(), game.round_number);

        self.room.set_status(RoomStatus::Finished);
        self.timer.disarm();
        self.timer.clear_grace();
        self.record(
            Some(TransitionState::Game(from)),
            TransitionState::Game(GameStatus::Finished),
            cause.clone(),
        );
        self.record(
            Some(TransitionState::Room(RoomStatus::Playing)),
            TransitionState::Room(RoomStatus::Finished),
            cause,
        );
        tracing::info!(room_id = %self.room.id, %game_id, winner = ?winner_id, "Game finished");

        self.publish(ServerEvent::GameEnded(GameEndedMsg {
            game_id,
            rankings,
            winner_id,
        }));
        self.deps.directory.release_room_members(self.room.id);
        self.broadcaster.detach_all();
        self.timer
            .arm(Phase::Linger, round, self.deps.config.finished_linger, Duration::ZERO);
    }

    fn cancel_room(&mut self, cause: TransitionCause) {
        if self.room.set_status(RoomStatus::Cancelled) {
            self.record(
                Some(TransitionState::Room(RoomStatus::Waiting)),
                TransitionState::Room(RoomStatus::Cancelled),
                cause,
            );
        }
        self.timer.disarm();
        self.stopped = true;
    }

    fn shutdown(&mut self, reason: &str) {
        tracing::info!(room_id = %self.room.id, reason, "Room shutting down");
        let err = GameError::RoomClosed;
        self.publish(ServerEvent::Error(ErrorMsg {
            code: err.code().to_string(),
            message: reason.to_string(),
            action: None,
        }));
        match self.room.status {
            RoomStatus::Waiting => self.cancel_room(TransitionCause::Shutdown),
            RoomStatus::Playing => {
                self.end_game(TransitionCause::Shutdown);
                self.stopped = true;
            },
            RoomStatus::Finished | RoomStatus::Cancelled => self.stopped = true,
        }
    }

    fn publish_warning(&mut self, deadline: PhaseDeadline) {
        let phase = match deadline.phase {
            Phase::Choosing => GameStatus::CardSelection,
            Phase::Voting => GameStatus::Voting,
            Phase::Results | Phase::Linger => return,
        };
        let Some(round_id) = self.round.as_ref().map(|r| r.id) else {
            return;
        };
        let seconds_left = deadline
            .at
            .saturating_duration_since(Instant::now())
            .as_secs_f64()
            .round() as u64;
        self.publish(ServerEvent::TimeoutWarning(TimeoutWarningMsg {
            round_id,
            phase,
            deadline: deadline.wall_deadline,
            seconds_left,
        }));
    }

    // ---------------------------------------------------------------------
    // Delivery and bookkeeping
    // ---------------------------------------------------------------------

    fn publish(&mut self, event: ServerEvent) {
        let dropped = self.broadcaster.publish(&event);
        self.pending_drops.extend(dropped);
    }

    fn send_snapshot(&mut self, user_id: &str) {
        let snapshot = ServerEvent::RoomSnapshot(Box::new(self.snapshot_for(user_id)));
        if let Some(dropped) = self.broadcaster.send_to(user_id, &snapshot) {
            self.pending_drops.push(dropped);
        }
    }

    /// Queue `snapshot` on `conn` from inside the session, so it lands
    /// between the events published before and after it.
    fn deliver_snapshot(
        &mut self,
        user_id: &str,
        conn: &ConnectionHandle,
        snapshot: &RoomSnapshotMsg,
    ) {
        let event = ServerEvent::RoomSnapshot(Box::new(snapshot.clone()));
        if self.broadcaster.conn_id_of(user_id) == Some(conn.conn_id) {
            if let Some(dropped) = self.broadcaster.send_to(user_id, &event) {
                self.pending_drops.push(dropped);
            }
        } else if !conn.send_event(&event) {
            tracing::debug!(
                room_id = %self.room.id,
                user_id,
                conn_id = conn.conn_id,
                "Snapshot not delivered"
            );
        }
    }

    fn snapshot_for(&self, user_id: &str) -> RoomSnapshotMsg {
        RoomSnapshotMsg {
            room: self.room.view(),
            game: self.game.clone(),
            round: self.round.as_ref().map(|r| r.view_for(user_id)),
            last_result: self.last_result.clone(),
            you: user_id.to_string(),
        }
    }

    fn record(
        &self,
        from: Option<TransitionState>,
        to: TransitionState,
        cause: TransitionCause,
    ) {
        let record = TransitionRecord {
            room_id: self.room.id,
            game_id: self.game.as_ref().map(|g| g.id),
            round_number: self.game.as_ref().map_or(0, |g| g.round_number),
            from,
            to,
            cause,
            at: timestamp_now(),
        };
        self.deps.sink.on_transition(&record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompts::StaticPrompts;
    use crate::transition::testing::RecordingSink;
    use memeroom_core::net::protocol::decode_server_envelope;
    use memeroom_core::room::Visibility;
    use memeroom_core::round::RoundStatus;
    use memeroom_core::scoring::VoteShareScoring;
    use memeroom_core::test_helpers::{make_room, user_ids};
    use uuid::Uuid;

    struct Client {
        user_id: UserId,
        conn: ConnectionHandle,
        rx: mpsc::Receiver<axum::extract::ws::Utf8Bytes>,
    }

    impl Client {
        fn new(user_id: &str, conn_id: ConnId) -> Self {
            let (conn, rx) = ConnectionHandle::new(conn_id, 64);
            Self {
                user_id: user_id.to_string(),
                conn,
                rx,
            }
        }

        async fn next(&mut self) -> ServerEvent {
            let frame = self.rx.recv().await.expect("connection closed");
            decode_server_envelope(frame.as_str()).unwrap().event
        }

        /// Skip events until one matches `pred`.
        async fn until(&mut self, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
            loop {
                let event = self.next().await;
                if pred(&event) {
                    return event;
                }
            }
        }

        fn drain(&mut self) -> Vec<ServerEvent> {
            let mut out = Vec::new();
            while let Ok(frame) = self.rx.try_recv() {
                out.push(decode_server_envelope(frame.as_str()).unwrap().event);
            }
            out
        }
    }

    fn session_config() -> SessionConfig {
        SessionConfig {
            min_players: 3,
            max_rounds: 2,
            choosing: Duration::from_secs(60),
            voting: Duration::from_secs(30),
            results: Duration::from_secs(8),
            warning: Duration::from_secs(10),
            reconnect_grace: Duration::from_secs(20),
            finished_linger: Duration::from_secs(5),
            queue: 32,
            scoring: Arc::new(VoteShareScoring::default()),
        }
    }

    struct Fixture {
        handle: SessionHandle,
        directory: Arc<Directory>,
        sink: Arc<RecordingSink>,
        room_id: RoomId,
    }

    fn spawn_room(config: SessionConfig, creator: &Client) -> Fixture {
        let directory = Arc::new(Directory::default());
        let sink = Arc::new(RecordingSink::default());
        let deps = SessionDeps {
            config: Arc::new(config),
            directory: Arc::clone(&directory),
            prompts: Arc::new(StaticPrompts::new(vec!["prompt".into()])),
            sink: Arc::clone(&sink) as Arc<dyn TransitionSink>,
        };
        let room = Room::new(
            Uuid::new_v4(),
            creator.user_id.clone(),
            creator.user_id.clone(),
            4,
            Visibility::Public,
            None,
            timestamp_now(),
        );
        let room_id = room.id;
        let summary = room.summary();
        let handle = spawn_session(room, Some(creator.conn.clone()), deps);
        directory.insert_for_tests(handle.clone(), summary, &creator.user_id);
        Fixture {
            handle,
            directory,
            sink,
            room_id,
        }
    }

    async fn join(fx: &Fixture, client: &Client) {
        fx.handle
            .join(
                client.user_id.clone(),
                client.user_id.clone(),
                Some(client.conn.clone()),
            )
            .await
            .unwrap();
    }

    /// Three players in a started game, everyone's queue drained up to the
    /// first `round_started`.
    async fn started_game(config: SessionConfig) -> (Fixture, Vec<Client>) {
        let mut clients = vec![Client::new("a", 1), Client::new("b", 2), Client::new("c", 3)];
        let fx = spawn_room(config, &clients[0]);
        join(&fx, &clients[1]).await;
        join(&fx, &clients[2]).await;
        fx.handle.start_game("a".into()).await.unwrap();
        for c in &mut clients {
            c.until(|e| matches!(e, ServerEvent::RoundStarted(_))).await;
        }
        (fx, clients)
    }

    fn is_voting_started(e: &ServerEvent) -> bool {
        matches!(e, ServerEvent::VotingStarted(_))
    }

    #[tokio::test(start_paused = true)]
    async fn creator_receives_snapshot_on_open() {
        let mut creator = Client::new("a", 1);
        let _fx = spawn_room(session_config(), &creator);
        match creator.next().await {
            ServerEvent::RoomSnapshot(snap) => {
                assert_eq!(snap.you, "a");
                assert_eq!(snap.room.participants.len(), 1);
                assert!(snap.game.is_none());
            },
            other => panic!("expected room_snapshot, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn start_needs_enough_connected_players() {
        let creator = Client::new("a", 1);
        let fx = spawn_room(session_config(), &creator);
        let b = Client::new("b", 2);
        join(&fx, &b).await;

        assert_eq!(
            fx.handle.start_game("b".into()).await,
            Err(GameError::Unauthorized)
        );
        assert_eq!(
            fx.handle.start_game("a".into()).await,
            Err(GameError::InsufficientPlayers {
                connected: 2,
                required: 3
            })
        );

        let c = Client::new("c", 3);
        join(&fx, &c).await;
        fx.handle.start_game("a".into()).await.unwrap();
        assert_eq!(
            fx.handle.start_game("a".into()).await,
            Err(GameError::PhaseMismatch)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn round_one_opens_with_choosing_deadline() {
        let (fx, mut clients) = started_game(session_config()).await;
        let snap = fx.handle.sync("b".into(), None).await.unwrap();
        let game = snap.game.unwrap();
        assert_eq!(game.status, GameStatus::CardSelection);
        assert_eq!(game.round_number, 1);
        let round = snap.round.unwrap();
        let deadline = round.deadline.unwrap();
        let now = timestamp_now();
        assert!(deadline > now + 55_000 && deadline <= now + 60_000);
        assert!(clients[0].drain().is_empty());
        assert_eq!(
            fx.sink.states(),
            vec![
                TransitionState::Room(RoomStatus::Waiting),
                TransitionState::Room(RoomStatus::Playing),
                TransitionState::Game(GameStatus::Starting),
                TransitionState::Game(GameStatus::CardSelection),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn all_choices_in_advances_immediately() {
        let (fx, mut clients) = started_game(session_config()).await;
        for user in ["a", "b", "c"] {
            fx.handle
                .submit_choice(user.into(), None, format!("card-{user}"))
                .await
                .unwrap();
        }
        let start = Instant::now();
        match clients[0].until(is_voting_started).await {
            ServerEvent::VotingStarted(v) => assert_eq!(v.choices.len(), 3),
            _ => unreachable!(),
        }
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_moves_partial_round_to_voting() {
        let (fx, mut clients) = started_game(session_config()).await;
        let start = Instant::now();
        fx.handle
            .submit_choice("a".into(), None, "card-a".into())
            .await
            .unwrap();
        fx.handle
            .submit_choice("b".into(), None, "card-b".into())
            .await
            .unwrap();

        let timeout = clients[0]
            .until(|e| matches!(e, ServerEvent::PlayerTimeout(_)))
            .await;
        match timeout {
            ServerEvent::PlayerTimeout(t) => {
                assert_eq!(t.user_ids, vec!["c".to_string()]);
                assert_eq!(t.phase, GameStatus::CardSelection);
            },
            _ => unreachable!(),
        }
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61));
        match clients[0].next().await {
            ServerEvent::VotingStarted(v) => assert_eq!(v.choices.len(), 2),
            other => panic!("expected voting_started, got {other:?}"),
        }
        let snap = fx.handle.sync("c".into(), None).await.unwrap();
        assert_eq!(snap.game.unwrap().status, GameStatus::Voting);
    }

    #[tokio::test(start_paused = true)]
    async fn warning_fires_before_choosing_deadline() {
        let (_fx, mut clients) = started_game(session_config()).await;
        let start = Instant::now();
        match clients[1]
            .until(|e| matches!(e, ServerEvent::TimeoutWarning(_)))
            .await
        {
            ServerEvent::TimeoutWarning(w) => {
                assert_eq!(w.phase, GameStatus::CardSelection);
                assert_eq!(w.seconds_left, 10);
            },
            _ => unreachable!(),
        }
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(50) && waited < Duration::from_secs(51));
    }

    #[tokio::test(start_paused = true)]
    async fn zero_choices_skip_to_results() {
        let (fx, mut clients) = started_game(session_config()).await;
        let start = Instant::now();
        let ended = loop {
            match clients[2].next().await {
                ServerEvent::RoundEnded(r) => break r,
                ServerEvent::VotingStarted(_) => panic!("voting opened with no choices"),
                _ => {},
            }
        };
        let waited = Instant::now() - start;
        assert!(waited >= Duration::from_secs(60) && waited < Duration::from_secs(61));
        assert!(ended.result.winner.is_none());
        assert!(ended.result.tallies.is_empty());
        let snap = fx.handle.sync("a".into(), None).await.unwrap();
        assert_eq!(snap.game.unwrap().status, GameStatus::RoundResults);
    }

    #[tokio::test(start_paused = true)]
    async fn two_votes_for_same_choice_win_and_score() {
        let (fx, mut clients) = started_game(session_config()).await;
        for user in ["a", "b", "c"] {
            fx.handle
                .submit_choice(user.into(), None, format!("card-{user}"))
                .await
                .unwrap();
        }
        clients[0].until(is_voting_started).await;
        let snap = fx.handle.sync("b".into(), None).await.unwrap();
        let choice_a = snap
            .round
            .unwrap()
            .choices
            .into_iter()
            .find(|c| c.card_id == "card-a")
            .unwrap()
            .choice_id;
        let snap_a = fx.handle.sync("a".into(), None).await.unwrap();
        let choice_b = snap_a
            .round
            .unwrap()
            .choices
            .into_iter()
            .find(|c| c.card_id == "card-b")
            .unwrap()
            .choice_id;

        assert_eq!(
            fx.handle.submit_vote("a".into(), None, choice_a).await,
            Err(GameError::SelfVote)
        );
        fx.handle
            .submit_vote("b".into(), None, choice_a)
            .await
            .unwrap();
        fx.handle
            .submit_vote("c".into(), None, choice_a)
            .await
            .unwrap();
        assert_eq!(
            fx.handle.submit_vote("c".into(), None, choice_b).await,
            Err(GameError::DuplicateVote)
        );
        fx.handle
            .submit_vote("a".into(), None, choice_b)
            .await
            .unwrap();

        match clients[1]
            .until(|e| matches!(e, ServerEvent::RoundEnded(_)))
            .await
        {
            ServerEvent::RoundEnded(r) => {
                let winner = r.result.winner.unwrap();
                assert_eq!(winner.user_id, "a");
                assert_eq!(winner.votes, 2);
                let score_a = r.scores.iter().find(|s| s.user_id == "a").unwrap();
                assert_eq!(score_a.score, 3 + 2);
                let score_b = r.scores.iter().find(|s| s.user_id == "b").unwrap();
                assert_eq!(score_b.score, 1);
            },
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stale_round_id_is_phase_mismatch() {
        let (fx, _clients) = started_game(session_config()).await;
        assert_eq!(
            fx.handle
                .submit_choice("a".into(), Some(Uuid::new_v4()), "card".into())
                .await,
            Err(GameError::PhaseMismatch)
        );
        assert_eq!(
            fx.handle
                .submit_vote("a".into(), None, Uuid::new_v4())
                .await,
            Err(GameError::PhaseMismatch)
        );
        assert_eq!(
            fx.handle
                .submit_choice("zed".into(), None, "card".into())
                .await,
            Err(GameError::NotInRoom)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_mid_voting_keeps_vote_and_sends_snapshot() {
        let (fx, mut clients) = started_game(session_config()).await;
        for user in ["a", "b", "c"] {
            fx.handle
                .submit_choice(user.into(), None, format!("card-{user}"))
                .await
                .unwrap();
        }
        clients[0].until(is_voting_started).await;
        let snap = fx.handle.sync("b".into(), None).await.unwrap();
        let target = snap
            .round
            .unwrap()
            .choices
            .into_iter()
            .find(|c| c.card_id == "card-a")
            .unwrap()
            .choice_id;
        fx.handle
            .submit_vote("b".into(), None, target)
            .await
            .unwrap();

        fx.handle.detach("b".into(), 2).await;
        clients[0]
            .until(|e| matches!(e, ServerEvent::PlayerDisconnected(_)))
            .await;

        let mut back = Client::new("b", 22);
        fx.handle
            .attach("b".into(), back.conn.clone())
            .await
            .unwrap();
        match back.next().await {
            ServerEvent::RoomSnapshot(snap) => {
                let round = snap.round.unwrap();
                assert_eq!(round.your_vote, Some(target));
                assert_eq!(round.your_choice.unwrap().card_id, "card-b");
                assert_eq!(snap.game.unwrap().status, GameStatus::Voting);
                assert!(
                    snap.room
                        .participants
                        .iter()
                        .all(|p| p.connected)
                );
            },
            other => panic!("expected room_snapshot, got {other:?}"),
        }
        clients[0]
            .until(|e| matches!(e, ServerEvent::PlayerReconnected(_)))
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn offline_player_does_not_block_voting() {
        let (fx, mut clients) = started_game(session_config()).await;
        fx.handle.detach("c".into(), 3).await;
        fx.handle
            .submit_choice("a".into(), None, "card-a".into())
            .await
            .unwrap();
        let start = Instant::now();
        fx.handle
            .submit_choice("b".into(), None, "card-b".into())
            .await
            .unwrap();
        clients[0].until(is_voting_started).await;
        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn grace_expiry_removes_player() {
        let creator = Client::new("a", 1);
        let fx = spawn_room(session_config(), &creator);
        let mut b = Client::new("b", 2);
        join(&fx, &b).await;
        b.drain();
        fx.handle.detach("a".into(), 1).await;

        match b
            .until(|e| matches!(e, ServerEvent::PlayerLeft(_)))
            .await
        {
            ServerEvent::PlayerLeft(left) => {
                assert_eq!(left.user_id, "a");
                assert_eq!(left.reason, LeaveReason::GraceExpired);
                assert_eq!(left.creator_id, "b");
            },
            _ => unreachable!(),
        }
        assert!(fx.directory.membership("a").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_detach_is_ignored_after_reattach() {
        let creator = Client::new("a", 1);
        let fx = spawn_room(session_config(), &creator);
        let fresh = Client::new("a", 11);
        fx.handle
            .attach("a".into(), fresh.conn.clone())
            .await
            .unwrap();
        fx.handle.detach("a".into(), 1).await;
        let snap = fx.handle.sync("a".into(), None).await.unwrap();
        assert!(snap.room.participants[0].connected);
    }

    #[tokio::test(start_paused = true)]
    async fn game_runs_to_completion_and_releases_members() {
        let (fx, mut clients) = started_game(session_config()).await;
        match clients[0]
            .until(|e| matches!(e, ServerEvent::GameEnded(_)))
            .await
        {
            ServerEvent::GameEnded(end) => {
                assert_eq!(end.rankings.len(), 3);
                assert_eq!(end.winner_id, None);
                assert_eq!(end.rankings[0].user_id, "a");
            },
            _ => unreachable!(),
        }
        for user in ["a", "b", "c"] {
            assert!(fx.directory.membership(user).is_none());
        }
        assert!(
            fx.sink
                .states()
                .contains(&TransitionState::Room(RoomStatus::Finished))
        );
        // Linger, then the supervisor drops the room.
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(fx.handle.is_closed());
        assert!(fx.directory.summary(fx.room_id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn last_leaver_cancels_waiting_room() {
        let creator = Client::new("a", 1);
        let fx = spawn_room(session_config(), &creator);
        fx.handle.leave("a".into()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.handle.is_closed());
        assert!(
            fx.sink
                .states()
                .contains(&TransitionState::Room(RoomStatus::Cancelled))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_session_is_removed_from_directory() {
        let creator = Client::new("a", 1);
        let fx = spawn_room(session_config(), &creator);
        assert!(fx.directory.membership("a").is_some());
        fx.handle.crash().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(fx.directory.membership("a").is_none());
        assert_eq!(
            fx.handle.start_game("a".into()).await,
            Err(GameError::RoomClosed)
        );
        assert!(creator.conn.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicate_choices_record_one() {
        let (fx, _clients) = started_game(session_config()).await;
        let attempts = (0..8).map(|i| {
            let handle = fx.handle.clone();
            tokio::spawn(async move {
                handle
                    .submit_choice("a".into(), None, format!("card-{i}"))
                    .await
            })
        });
        let results = futures::future::join_all(attempts).await;
        let ok = results
            .into_iter()
            .filter(|r| matches!(r, Ok(Ok(()))))
            .count();
        assert_eq!(ok, 1);
        let snap = fx.handle.sync("a".into(), None).await.unwrap();
        assert_eq!(snap.round.unwrap().submitted, vec!["a".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn sync_snapshot_is_ordered_with_room_events() {
        let (fx, mut clients) = started_game(session_config()).await;
        for user in ["a", "b"] {
            fx.handle
                .submit_choice(user.into(), None, format!("card-{user}"))
                .await
                .unwrap();
        }
        clients[2].drain();
        let c_conn = clients[2].conn.clone();
        let (snap, submitted) = tokio::join!(
            fx.handle.sync("c".into(), Some(c_conn)),
            fx.handle.submit_choice("c".into(), None, "card-c".into()),
        );
        submitted.unwrap();
        assert_eq!(snap.unwrap().game.unwrap().status, GameStatus::CardSelection);

        let events = clients[2].drain();
        let kinds: Vec<_> = events.iter().map(ServerEvent::event_type).collect();
        assert_eq!(
            kinds,
            vec!["room_snapshot", "card_choice_submitted", "voting_started"]
        );
        match &events[0] {
            ServerEvent::RoomSnapshot(s) => {
                assert_eq!(s.game.as_ref().unwrap().status, GameStatus::CardSelection)
            },
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_duplicate_votes_record_one() {
        let sink = Arc::new(RecordingSink::default());
        let deps = SessionDeps {
            config: Arc::new(session_config()),
            directory: Arc::new(Directory::default()),
            prompts: Arc::new(StaticPrompts::new(vec!["prompt".into()])),
            sink: sink as Arc<dyn TransitionSink>,
        };
        let users = user_ids(3);
        let handle = spawn_session(make_room(5, 3), None, deps);
        handle.start_game(users[0].clone()).await.unwrap();
        for user in &users {
            handle
                .submit_choice(user.clone(), None, format!("card-{user}"))
                .await
                .unwrap();
        }
        let snap = handle.sync(users[0].clone(), None).await.unwrap();
        let targets: Vec<ChoiceId> = snap
            .round
            .unwrap()
            .choices
            .into_iter()
            .filter(|c| c.card_id != "card-u1")
            .map(|c| c.choice_id)
            .collect();
        assert_eq!(targets.len(), 2);

        let attempts = (0..8).map(|i| {
            let handle = handle.clone();
            let user = users[0].clone();
            let target = targets[i % targets.len()];
            tokio::spawn(async move { handle.submit_vote(user, None, target).await })
        });
        let results = futures::future::join_all(attempts).await;
        let ok = results
            .iter()
            .filter(|r| matches!(r, Ok(Ok(()))))
            .count();
        assert_eq!(ok, 1);
        assert!(
            results
                .iter()
                .filter(|r| !matches!(r, Ok(Ok(()))))
                .all(|r| matches!(r, Ok(Err(GameError::DuplicateVote))))
        );
        let round = handle.sync(users[1].clone(), None).await.unwrap().round.unwrap();
        assert_eq!(round.votes_cast, 1);
        assert_eq!(round.status, RoundStatus::Voting);
    }
}
