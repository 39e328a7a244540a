use std::net::SocketAddr;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use memeroom_core::ids::RoomId;
use memeroom_core::net::messages::{RoomSnapshotMsg, ServerEvent};
use memeroom_core::net::protocol::decode_server_envelope;

use memeroom_server::config::ServerConfig;
use memeroom_server::{build_app, spawn_background_tasks};

pub type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestServer {
    pub addr: SocketAddr,
    _handle: tokio::task::JoinHandle<()>,
    _shutdown: CancellationToken,
}

impl TestServer {
    /// Start a server with short phase timers.
    pub async fn new() -> Self {
        Self::from_config(fast_config()).await
    }

    pub async fn from_config(config: ServerConfig) -> Self {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let (app, state) = build_app(config);
        let shutdown = CancellationToken::new();
        spawn_background_tasks(&state, shutdown.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        // Give the server a moment to start accepting
        tokio::time::sleep(Duration::from_millis(20)).await;

        Self {
            addr,
            _handle: handle,
            _shutdown: shutdown,
        }
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    pub fn ws_url_as(&self, user_id: &str) -> String {
        format!("{}?user_id={user_id}&nickname={user_id}", self.ws_url())
    }
}

/// Defaults with phase timers short enough to run whole rounds in a test.
pub fn fast_config() -> ServerConfig {
    let mut config = ServerConfig::default();
    config.listen_addr = "127.0.0.1:0".to_string();
    config.game.choosing_secs = 2;
    config.game.voting_secs = 2;
    config.game.results_secs = 1;
    config.game.timeout_warning_secs = 1;
    config.game.reconnect_grace_secs = 2;
    config.game.max_rounds = 2;
    config.rooms.finished_linger_secs = 1;
    config
}

/// Long choosing and voting phases for tests that drive every action
/// themselves; results stay short.
pub fn patient_config() -> ServerConfig {
    let mut config = fast_config();
    config.game.choosing_secs = 30;
    config.game.voting_secs = 30;
    config.game.timeout_warning_secs = 5;
    config
}

/// Connect as `user_id`.
pub async fn connect(server: &TestServer, user_id: &str) -> Ws {
    let (stream, _) = tokio_tungstenite::connect_async(server.ws_url_as(user_id))
        .await
        .unwrap();
    stream
}

pub async fn send_action(ws: &mut Ws, action: &str, data: Value) {
    let frame = json!({ "action": action, "data": data }).to_string();
    ws.send(Message::Text(frame.into())).await.unwrap();
}

pub async fn send_raw(ws: &mut Ws, text: &str) {
    ws.send(Message::Text(text.to_string().into()))
        .await
        .unwrap();
}

/// Next server event, skipping control frames. Panics after 5 seconds.
pub async fn read_event(ws: &mut Ws) -> ServerEvent {
    tokio::time::timeout(READ_TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return decode_server_envelope(text.as_str()).unwrap().event;
                },
                Some(Ok(_)) => continue,
                other => panic!("socket ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for server event")
}

/// Skip events until one matches `pred`.
pub async fn read_until(ws: &mut Ws, pred: impl Fn(&ServerEvent) -> bool) -> ServerEvent {
    loop {
        let event = read_event(ws).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Skip events until an `error`; returns its code.
pub async fn read_error_code(ws: &mut Ws) -> String {
    match read_until(ws, |e| matches!(e, ServerEvent::Error(_))).await {
        ServerEvent::Error(err) => err.code,
        _ => unreachable!(),
    }
}

pub async fn read_snapshot(ws: &mut Ws) -> RoomSnapshotMsg {
    match read_until(ws, |e| matches!(e, ServerEvent::RoomSnapshot(_))).await {
        ServerEvent::RoomSnapshot(snap) => *snap,
        _ => unreachable!(),
    }
}

/// Create a public room and return its id.
pub async fn create_room(ws: &mut Ws, capacity: u8) -> RoomId {
    send_action(ws, "create_room", json!({ "capacity": capacity })).await;
    read_snapshot(ws).await.room.room_id
}

pub async fn join_room(ws: &mut Ws, room_id: RoomId) -> RoomSnapshotMsg {
    send_action(ws, "join_room", json!({ "room_id": room_id })).await;
    read_snapshot(ws).await
}

/// Connect `users`; the first creates a room the rest join.
pub async fn room_with(server: &TestServer, users: &[&str], capacity: u8) -> (RoomId, Vec<Ws>) {
    let mut sockets = Vec::new();
    let mut host = connect(server, users[0]).await;
    let room_id = create_room(&mut host, capacity).await;
    sockets.push(host);
    for user in &users[1..] {
        let mut ws = connect(server, user).await;
        join_room(&mut ws, room_id).await;
        sockets.push(ws);
    }
    (room_id, sockets)
}

/// Connect `users` into a room and start the game; every socket has seen
/// `round_started`.
pub async fn started_game(server: &TestServer, users: &[&str]) -> (RoomId, Vec<Ws>) {
    let (room_id, mut sockets) = room_with(server, users, 8).await;
    send_action(&mut sockets[0], "start_game", json!({})).await;
    for ws in &mut sockets {
        read_until(ws, |e| matches!(e, ServerEvent::RoundStarted(_))).await;
    }
    (room_id, sockets)
}
