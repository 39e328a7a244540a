use std::collections::HashMap;

use axum::extract::ws::Utf8Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use memeroom_core::ids::{RoomId, UserId};
use memeroom_core::net::messages::ServerEvent;
use memeroom_core::net::protocol::encode_server_event;
use memeroom_core::time::timestamp_now;

/// Process-unique id of one WebSocket connection.
pub type ConnId = u64;

/// Outbound side of one socket. The hub keeps one copy, the room the user
/// sits in keeps another.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    sender: mpsc::Sender<Utf8Bytes>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Create a handle with a bounded outbound queue of `buffer` frames.
    pub fn new(conn_id: ConnId, buffer: usize) -> (Self, mpsc::Receiver<Utf8Bytes>) {
        let (sender, rx) = mpsc::channel(buffer);
        let handle = Self {
            conn_id,
            sender,
            cancel: CancellationToken::new(),
        };
        (handle, rx)
    }

    /// Queue a pre-encoded frame without waiting. False when the queue is
    /// full or the socket is gone.
    pub fn try_send(&self, frame: Utf8Bytes) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::warn!(conn_id = self.conn_id, "Outbound queue full");
                false
            },
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Encode and queue a single event for this connection only.
    pub fn send_event(&self, event: &ServerEvent) -> bool {
        match encode_server_event(event, timestamp_now()) {
            Ok(text) => self.try_send(Utf8Bytes::from(text)),
            Err(e) => {
                tracing::error!(error = %e, event = event.event_type(), "Failed to encode event");
                false
            },
        }
    }

    /// Ask the hub to close this socket.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.sender.is_closed()
    }

    pub fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }
}

/// Per-room fan-out to subscribed connections.
///
/// Delivery never waits: a subscriber whose queue is full or closed is
/// dropped and its connection closed, while the participant stays in the
/// roster and may reconnect.
#[derive(Debug)]
pub struct Broadcaster {
    room_id: RoomId,
    subscribers: HashMap<UserId, ConnectionHandle>,
}

impl Broadcaster {
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            subscribers: HashMap::new(),
        }
    }

    /// Subscribe `user_id`, returning the connection it replaced (if any).
    pub fn subscribe(&mut self, user_id: UserId, conn: ConnectionHandle) -> Option<ConnectionHandle> {
        self.subscribers.insert(user_id, conn)
    }

    /// Stop delivering to `user_id` without closing their socket.
    pub fn unsubscribe(&mut self, user_id: &str) -> Option<ConnectionHandle> {
        self.subscribers.remove(user_id)
    }

    /// Unsubscribe only if `conn_id` is still the user's current connection.
    pub fn unsubscribe_conn(&mut self, user_id: &str, conn_id: ConnId) -> bool {
        if self.conn_id_of(user_id) == Some(conn_id) {
            self.subscribers.remove(user_id);
            true
        } else {
            false
        }
    }

    /// Drop every subscriber, leaving their sockets open.
    pub fn detach_all(&mut self) {
        self.subscribers.clear();
    }

    pub fn conn_id_of(&self, user_id: &str) -> Option<ConnId> {
        self.subscribers.get(user_id).map(|c| c.conn_id)
    }

    /// Serialize `event` once and deliver it to every subscriber. Returns
    /// the users whose connections were dropped.
    #[must_use]
    pub fn publish(&mut self, event: &ServerEvent) -> Vec<UserId> {
        let text = match encode_server_event(event, timestamp_now()) {
            Ok(text) => Utf8Bytes::from(text),
            Err(e) => {
                tracing::error!(
                    room_id = %self.room_id,
                    event = event.event_type(),
                    error = %e,
                    "Failed to encode event"
                );
                return Vec::new();
            },
        };
        let failed: Vec<UserId> = self
            .subscribers
            .iter()
            .filter(|(_, conn)| !conn.try_send(text.clone()))
            .map(|(user_id, _)| user_id.clone())
            .collect();
        for user_id in &failed {
            self.drop_subscriber(user_id);
        }
        failed
    }

    /// Deliver `event` to one subscriber. Returns the user if their
    /// connection was dropped.
    #[must_use]
    pub fn send_to(&mut self, user_id: &str, event: &ServerEvent) -> Option<UserId> {
        let conn = self.subscribers.get(user_id)?;
        if conn.send_event(event) {
            None
        } else {
            self.drop_subscriber(user_id);
            Some(user_id.to_string())
        }
    }

    fn drop_subscriber(&mut self, user_id: &str) {
        if let Some(conn) = self.subscribers.remove(user_id) {
            tracing::warn!(
                room_id = %self.room_id,
                user_id,
                conn_id = conn.conn_id,
                "Dropping slow or closed subscriber"
            );
            conn.close();
        }
    }
}

impl Drop for Broadcaster {
    /// A destroyed room closes whatever connections are still attached.
    fn drop(&mut self) {
        for conn in self.subscribers.values() {
            conn.close();
        }
    }
}
