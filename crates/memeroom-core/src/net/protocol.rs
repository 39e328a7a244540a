use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::messages::{ClientAction, ServerEvent};
use crate::error::GameError;
use crate::time::Timestamp;

/// Maximum inbound frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024; // 16 KiB

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    EmptyMessage,
    PayloadTooLarge(usize),
    Malformed(String),
    UnknownAction(String),
    InvalidPayload { action: String, reason: String },
    SerializeError(String),
}

impl ProtocolError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::EmptyMessage => "empty_message",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::Malformed(_) => "malformed",
            Self::UnknownAction(_) => "unknown_action",
            Self::InvalidPayload { .. } => "invalid_payload",
            Self::SerializeError(_) => "serialize_error",
        }
    }

    /// The action name, if decoding got far enough to read it.
    pub fn action(&self) -> Option<&str> {
        match self {
            Self::UnknownAction(a) | Self::InvalidPayload { action: a, .. } => Some(a),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "empty message"),
            Self::PayloadTooLarge(size) => {
                write!(f, "payload too large: {size} bytes (max {MAX_MESSAGE_SIZE})")
            },
            Self::Malformed(e) => write!(f, "malformed message: {e}"),
            Self::UnknownAction(a) => write!(f, "unknown action: {a}"),
            Self::InvalidPayload { action, reason } => {
                write!(f, "invalid payload for {action}: {reason}")
            },
            Self::SerializeError(e) => write!(f, "serialize error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<ProtocolError> for GameError {
    fn from(e: ProtocolError) -> Self {
        GameError::Validation(e.to_string())
    }
}

/// Inbound envelope before the payload is matched to an action.
#[derive(Deserialize)]
struct RawAction {
    action: String,
    #[serde(default)]
    data: Value,
}

fn payload<T: DeserializeOwned>(action: &str, data: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(data).map_err(|e| ProtocolError::InvalidPayload {
        action: action.to_string(),
        reason: e.to_string(),
    })
}

/// Decode one inbound text frame. A missing or null `data` is treated as `{}`.
pub fn decode_client_action(text: &str) -> Result<ClientAction, ProtocolError> {
    if text.trim().is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if text.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::PayloadTooLarge(text.len()));
    }
    let raw: RawAction =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let data = match raw.data {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    };
    let action = raw.action.as_str();
    match action {
        "create_room" => Ok(ClientAction::CreateRoom(payload(action, data)?)),
        "join_room" => Ok(ClientAction::JoinRoom(payload(action, data)?)),
        "quick_match" => Ok(ClientAction::QuickMatch(payload(action, data)?)),
        "leave_room" => Ok(ClientAction::LeaveRoom(payload(action, data)?)),
        "start_game" => Ok(ClientAction::StartGame(payload(action, data)?)),
        "submit_card_choice" => Ok(ClientAction::SubmitCardChoice(payload(action, data)?)),
        "submit_vote" => Ok(ClientAction::SubmitVote(payload(action, data)?)),
        "ping" => Ok(ClientAction::Ping(payload(action, data)?)),
        "sync" => Ok(ClientAction::Sync(payload(action, data)?)),
        _ => Err(ProtocolError::UnknownAction(raw.action)),
    }
}

pub fn encode_client_action(action: &ClientAction) -> Result<String, ProtocolError> {
    serde_json::to_string(action).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

/// Encode an event as `{ "type", "data", "timestamp" }`.
pub fn encode_server_event(
    event: &ServerEvent,
    timestamp: Timestamp,
) -> Result<String, ProtocolError> {
    let mut value =
        serde_json::to_value(event).map_err(|e| ProtocolError::SerializeError(e.to_string()))?;
    if let Value::Object(map) = &mut value {
        map.insert("timestamp".to_string(), Value::from(timestamp));
    }
    serde_json::to_string(&value).map_err(|e| ProtocolError::SerializeError(e.to_string()))
}

/// A decoded outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerEnvelope {
    pub event: ServerEvent,
    pub timestamp: Timestamp,
}

pub fn decode_server_envelope(text: &str) -> Result<ServerEnvelope, ProtocolError> {
    let mut value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    let timestamp = value
        .as_object_mut()
        .and_then(|m| m.remove("timestamp"))
        .and_then(|t| t.as_u64())
        .ok_or_else(|| ProtocolError::Malformed("missing timestamp".to_string()))?;
    let event =
        serde_json::from_value(value).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok(ServerEnvelope { event, timestamp })
}
