use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, Utf8Bytes, WebSocket};
use axum::extract::{FromRequest, Query, State, WebSocketUpgrade};
use axum::response::{IntoResponse, Response};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use memeroom_core::error::GameError;
use memeroom_core::net::messages::{ClientAction, ErrorMsg, PongMsg, ServerEvent};
use memeroom_core::net::protocol::{ProtocolError, decode_client_action};
use memeroom_core::participant::sanitize_nickname;

use crate::broadcaster::ConnectionHandle;
use crate::error::AppError;
use crate::registry::{JoinTarget, PlayerIdentity};
use crate::state::{AppState, ConnectionGuard};

const MAX_USER_ID_LEN: usize = 64;
const USER_ID_HEADER: &str = "x-user-id";

/// Identity supplied on the upgrade request. `user_id` may also come from
/// the `x-user-id` header.
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    pub user_id: Option<String>,
    pub nickname: Option<String>,
}

fn identify(params: ConnectParams, header: Option<&str>) -> Result<PlayerIdentity, AppError> {
    let user_id = params
        .user_id
        .as_deref()
        .or(header)
        .map(str::trim)
        .unwrap_or_default();
    if user_id.is_empty()
        || user_id.len() > MAX_USER_ID_LEN
        || user_id.chars().any(char::is_control)
    {
        return Err(AppError::Unauthorized(
            "missing or invalid user identity".to_string(),
        ));
    }
    Ok(PlayerIdentity {
        nickname: sanitize_nickname(params.nickname.as_deref(), user_id),
        user_id: user_id.to_string(),
    })
}

pub async fn ws_handler(
    State(state): State<AppState>,
    request: axum::extract::Request,
) -> Result<Response, AppError> {
    let params = Query::<ConnectParams>::try_from_uri(request.uri())
        .map(|Query(p)| p)
        .unwrap_or_default();
    let header = request
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok());
    let player = identify(params, header)?;

    let max_ws = state.config.limits.max_ws_connections;
    let Some(guard) = ConnectionGuard::try_acquire(Arc::clone(&state.ws_connection_count), max_ws)
    else {
        tracing::warn!(max = max_ws, "WS connection limit reached");
        return Err(AppError::ServiceUnavailable(
            "too many connections".to_string(),
        ));
    };

    let ws = WebSocketUpgrade::from_request(request, &state)
        .await
        .map_err(|e| AppError::BadRequest(e.to_string()))?;
    let max_frame = state.config.limits.max_message_size.saturating_mul(4);

    Ok(ws
        .max_message_size(max_frame)
        .on_upgrade(move |socket| handle_socket(socket, state, player, guard))
        .into_response())
}

async fn handle_socket(
    socket: WebSocket,
    state: AppState,
    player: PlayerIdentity,
    _guard: ConnectionGuard,
) {
    let conn_id = state.alloc_conn_id();
    let (conn, rx) = ConnectionHandle::new(conn_id, state.config.limits.player_message_buffer);
    let (ws_sender, mut ws_receiver) = socket.split();
    let ping_every = Duration::from_secs(state.config.keepalive.ping_interval_secs);
    let writer = spawn_writer(ws_sender, rx, conn.clone(), ping_every);

    let room_id = state.registry.connect(&player.user_id, conn.clone()).await;
    tracing::info!(conn_id, user_id = %player.user_id, ?room_id, "WebSocket connected");

    read_loop(&mut ws_receiver, &state, &player, &conn).await;

    state.registry.disconnect(&player.user_id, conn_id).await;
    conn.close();
    if let Err(e) = writer.await {
        tracing::warn!(conn_id, error = %e, "Writer task failed");
    }
    tracing::info!(conn_id, user_id = %player.user_id, "WebSocket disconnected");
}

/// Drain the outbound queue into the socket and send keepalive pings.
/// On close, flushes what is already queued before the close frame.
fn spawn_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Utf8Bytes>,
    conn: ConnectionHandle,
    ping_every: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ping = tokio::time::interval(ping_every);
        ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ping.tick().await;

        loop {
            tokio::select! {
                frame = rx.recv() => match frame {
                    Some(text) => {
                        if ws_sender.send(Message::Text(text)).await.is_err() {
                            return;
                        }
                    },
                    None => break,
                },
                _ = ping.tick() => {
                    if ws_sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        return;
                    }
                },
                () = conn.cancelled() => break,
            }
        }

        let flush = async {
            while let Ok(text) = rx.try_recv() {
                if ws_sender.send(Message::Text(text)).await.is_err() {
                    return;
                }
            }
            let _ = ws_sender.send(Message::Close(None)).await;
        };
        if tokio::time::timeout(Duration::from_secs(1), flush).await.is_err() {
            tracing::debug!(conn_id = conn.conn_id, "Flush on close timed out");
        }
    })
}

/// Per-connection rate limiter (token bucket).
struct RateLimiter {
    tokens: f64,
    last_refill: tokio::time::Instant,
    max_tokens: f64,
    refill_rate: f64, // tokens per second
}

impl RateLimiter {
    fn new(max_tokens: f64, refill_rate: f64) -> Self {
        Self {
            tokens: max_tokens,
            last_refill: tokio::time::Instant::now(),
            max_tokens,
            refill_rate,
        }
    }

    /// Returns true if the message is allowed; false if rate-limited.
    fn allow(&mut self) -> bool {
        let now = tokio::time::Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

async fn read_loop(
    ws_receiver: &mut SplitStream<WebSocket>,
    state: &AppState,
    player: &PlayerIdentity,
    conn: &ConnectionHandle,
) {
    let limits = &state.config.limits;
    let mut rate_limiter =
        RateLimiter::new(limits.ws_rate_limit_per_sec, limits.ws_rate_limit_per_sec);
    let idle_limit = state.config.keepalive.idle_limit();

    loop {
        let msg = tokio::select! {
            () = conn.cancelled() => {
                tracing::debug!(conn_id = conn.conn_id, "Connection closed by server");
                break;
            },
            next = tokio::time::timeout(idle_limit, ws_receiver.next()) => match next {
                Ok(Some(Ok(msg))) => msg,
                Ok(_) => break,
                Err(_) => {
                    tracing::info!(conn_id = conn.conn_id, user_id = %player.user_id, "Keepalive timeout");
                    break;
                },
            },
        };

        let text = match msg {
            Message::Text(text) => text,
            Message::Binary(_) => {
                send_protocol_error(
                    conn,
                    &ProtocolError::Malformed("binary frames are not supported".to_string()),
                );
                continue;
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !rate_limiter.allow() {
            tracing::warn!(conn_id = conn.conn_id, user_id = %player.user_id, "Rate limited");
            send_error(conn, "rate_limited", "too many messages".to_string(), None);
            continue;
        }
        if text.len() > limits.max_message_size {
            send_protocol_error(conn, &ProtocolError::PayloadTooLarge(text.len()));
            continue;
        }

        match decode_client_action(text.as_str()) {
            Ok(action) => dispatch(state, player, conn, action).await,
            Err(e) => {
                tracing::debug!(conn_id = conn.conn_id, error = %e, "Rejected frame");
                send_protocol_error(conn, &e);
            },
        }
    }
}

async fn dispatch(
    state: &AppState,
    player: &PlayerIdentity,
    conn: &ConnectionHandle,
    action: ClientAction,
) {
    let name = action.name();
    let registry = &state.registry;
    let user_id = player.user_id.clone();

    let result = match action {
        ClientAction::CreateRoom(msg) => {
            let capacity = msg.capacity.unwrap_or(state.config.game.default_capacity);
            registry
                .create_room(player, capacity, msg.visibility, Some(conn.clone()))
                .map(drop)
        },
        ClientAction::JoinRoom(msg) => {
            let target = match (msg.room_id, msg.join_code) {
                (Some(room_id), _) => Some(JoinTarget::Id(room_id)),
                (None, Some(code)) => Some(JoinTarget::Code(code)),
                (None, None) => None,
            };
            match target {
                Some(target) => registry
                    .join_room(player, target, Some(conn.clone()))
                    .await
                    .map(drop),
                None => Err(GameError::Validation(
                    "join_room needs room_id or join_code".to_string(),
                )),
            }
        },
        ClientAction::QuickMatch(msg) => registry
            .quick_match(player, msg.preferred_capacity, Some(conn.clone()))
            .await
            .map(drop),
        ClientAction::LeaveRoom(msg) => registry.leave_room(&user_id, msg.room_id).await,
        ClientAction::StartGame(_) => match registry.route(&user_id) {
            Ok(session) => session.start_game(user_id).await,
            Err(e) => Err(e),
        },
        ClientAction::SubmitCardChoice(msg) => match registry.route(&user_id) {
            Ok(session) => {
                session
                    .submit_choice(user_id, msg.round_id, msg.card_id)
                    .await
            },
            Err(e) => Err(e),
        },
        ClientAction::SubmitVote(msg) => match registry.route(&user_id) {
            Ok(session) => {
                session
                    .submit_vote(user_id, msg.round_id, msg.choice_id)
                    .await
            },
            Err(e) => Err(e),
        },
        ClientAction::Ping(_) => {
            conn.send_event(&ServerEvent::Pong(PongMsg {}));
            Ok(())
        },
        ClientAction::Sync(_) => match registry.route(&user_id) {
            Ok(session) => session.sync(user_id, Some(conn.clone())).await.map(drop),
            Err(e) => Err(e),
        },
    };

    if let Err(e) = result {
        tracing::debug!(
            conn_id = conn.conn_id,
            user_id = %player.user_id,
            action = name,
            error = %e,
            "Action rejected"
        );
        send_error(conn, e.code(), e.to_string(), Some(name));
    }
}

fn send_protocol_error(conn: &ConnectionHandle, e: &ProtocolError) {
    send_error(conn, e.code(), e.to_string(), e.action());
}

fn send_error(conn: &ConnectionHandle, code: &str, message: String, action: Option<&str>) {
    conn.send_event(&ServerEvent::Error(ErrorMsg {
        code: code.to_string(),
        message,
        action: action.map(str::to_string),
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_from_query_or_header() {
        let player = identify(
            ConnectParams {
                user_id: Some(" alice ".into()),
                nickname: None,
            },
            None,
        )
        .unwrap();
        assert_eq!(player.user_id, "alice");
        assert!(!player.nickname.is_empty());

        let player = identify(ConnectParams::default(), Some("bob")).unwrap();
        assert_eq!(player.user_id, "bob");
    }

    #[test]
    fn identity_rejects_empty_long_or_control() {
        assert!(identify(ConnectParams::default(), None).is_err());
        assert!(identify(ConnectParams::default(), Some("  ")).is_err());
        assert!(identify(ConnectParams::default(), Some(&"x".repeat(65))).is_err());
        assert!(identify(ConnectParams::default(), Some("a\u{7}b")).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limiter_refills_over_time() {
        let mut limiter = RateLimiter::new(2.0, 2.0);
        assert!(limiter.allow());
        assert!(limiter.allow());
        assert!(!limiter.allow());
        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.allow());
        assert!(!limiter.allow());
    }
}
