//! JSON wire protocol shared by browser and actuator peers.
//!
//! Every frame is a UTF-8 JSON object with a `type` discriminator:
//! ```text
//! {"type":"state","speed":42,"forward":false,"userId":"3f2a…"}
//! {"type":"cursor","id":"3f2a…","x":10,"y":20}
//! {"type":"users","count":2}
//! {"type":"user_disconnected","id":"3f2a…"}
//! {"type":"command","speed":42,"forward":false}   (client → server)
//! ```
//!
//! Inbound classification lives in [`crate::router`]; this module only
//! defines the message shapes and their encoding.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;
use crate::presence::PeerId;
use crate::state::SharedState;

/// Pointer position of one peer, relayed to everyone else.
///
/// Coordinates are passed through exactly as the sender wrote them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CursorEvent {
    pub id: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<Value>,
}

/// Requested state change; raw values, coerced by the state store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub forward: Option<Value>,
}

/// Full copy of the shared state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub speed: i64,
    pub forward: bool,
    /// Set only on the snapshot a peer receives when it connects.
    #[serde(rename = "userId", default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<PeerId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCount {
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserDisconnected {
    pub id: PeerId,
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    Cursor(CursorEvent),
    Command(CommandEvent),
    State(StateSnapshot),
    Users(UserCount),
    UserDisconnected(UserDisconnected),
}

impl Message {
    /// State snapshot, optionally tagged with the recipient's own id.
    pub fn snapshot(state: SharedState, user_id: Option<PeerId>) -> Self {
        Message::State(StateSnapshot {
            speed: state.speed,
            forward: state.forward,
            user_id,
        })
    }

    pub fn users(count: usize) -> Self {
        Message::Users(UserCount { count })
    }

    pub fn user_disconnected(id: PeerId) -> Self {
        Message::UserDisconnected(UserDisconnected { id })
    }

    /// The `type` discriminator this message is sent with.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Cursor(_) => "cursor",
            Message::Command(_) => "command",
            Message::State(_) => "state",
            Message::Users(_) => "users",
            Message::UserDisconnected(_) => "user_disconnected",
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Parse a server-produced frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}
