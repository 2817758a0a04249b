//! Inbound payload classification.
//!
//! Order matters:
//! 1. `type == "cursor"` → [`CursorEvent`] carrying the sender's id.
//! 2. `type == "command"`, or no `type` but a `speed` field → [`CommandEvent`].
//!    Older actuator firmware sends bare `{"speed": …}` objects.
//! 3. Anything else is accepted and ignored.
//!
//! A `type` of `null`, `false`, `0` or `""` counts as missing.

use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::presence::PeerId;
use crate::protocol::{CommandEvent, CursorEvent, Message};

enum Kind {
    Cursor,
    Command,
    Ignored,
}

/// Classify a raw frame from `sender`.
///
/// `Ok(None)` means the payload was valid JSON but calls for no action.
pub fn classify(raw: &[u8], sender: &PeerId) -> Result<Option<Message>, ProtocolError> {
    let value: Value = serde_json::from_slice(raw).map_err(ProtocolError::Decode)?;
    let Value::Object(mut fields) = value else {
        return Ok(None);
    };

    let routed = match kind(&fields) {
        Kind::Cursor => Some(Message::Cursor(CursorEvent {
            id: sender.clone(),
            x: fields.remove("x"),
            y: fields.remove("y"),
        })),
        Kind::Command => Some(Message::Command(CommandEvent {
            speed: fields.remove("speed"),
            forward: fields.remove("forward"),
        })),
        Kind::Ignored => None,
    };
    Ok(routed)
}

fn kind(fields: &Map<String, Value>) -> Kind {
    match fields.get("type") {
        Some(Value::String(tag)) if tag == "cursor" => Kind::Cursor,
        Some(Value::String(tag)) if tag == "command" => Kind::Command,
        tag if is_untyped(tag) && fields.contains_key("speed") => Kind::Command,
        _ => Kind::Ignored,
    }
}

fn is_untyped(tag: Option<&Value>) -> bool {
    match tag {
        None | Some(Value::Null) | Some(Value::Bool(false)) => true,
        Some(Value::String(s)) => s.is_empty(),
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        _ => false,
    }
}
