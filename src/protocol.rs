//! Wire protocol between dispatcher and listeners
//!
//! All envelopes travel as JSON text frames over the WebSocket channel:
//!
//! - `ListenerMessage` (listener → dispatcher): `{command, name, actions}`
//! - `RelayedAction` (dispatcher → listener): `{action, token}`
//! - `ResultMessage` (both directions): `{ok, message}`
//!
//! The protocol carries no correlation id, so a listener handles at most one
//! relayed action at a time.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Command name of the registration handshake
pub const REGISTER_COMMAND: &str = "register";

/// Reply to a duplicate `(name, remote address)` registration
pub const MSG_DUPLICATE_NAME: &str = "A service with the same name is already registered";
/// Reply to a command the dispatcher does not know
pub const MSG_UNRECOGNIZED_COMMAND: &str = "Unrecognized command";
/// Reply to a bad upgrade token
pub const MSG_UNAUTHORIZED: &str = "Unauthorized";
/// Reply to a frame that cannot be decoded
pub const MSG_MALFORMED: &str = "Malformed message";
/// Reply to a command sent before registering
pub const MSG_NOT_REGISTERED: &str = "The first command must be a registration";
/// Reply to a second registration on the same connection
pub const MSG_ALREADY_REGISTERED: &str = "Already registered";
/// Listener reply to an action name it does not host
pub const MSG_UNKNOWN_ACTION: &str = "Unknown action";
/// Listener reply to a token mismatch
pub const MSG_INVALID_TOKEN: &str = "Invalid token";

/// Raw command envelope sent by listeners
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerMessage {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub actions: Vec<String>,
}

impl ListenerMessage {
    /// Build a registration envelope
    pub fn register(name: impl Into<String>, actions: Vec<String>) -> Self {
        Self {
            command: REGISTER_COMMAND.to_string(),
            name: name.into(),
            actions,
        }
    }
}

/// Decoded listener command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Bind this connection to a named listener
    Register { name: String, actions: Vec<String> },
    /// Any command name the dispatcher does not handle
    Unrecognized(String),
}

impl From<ListenerMessage> for Command {
    fn from(message: ListenerMessage) -> Self {
        match message.command.as_str() {
            REGISTER_COMMAND => Command::Register {
                name: message.name,
                actions: message.actions,
            },
            _ => Command::Unrecognized(message.command),
        }
    }
}

/// Action relayed from the dispatcher to a listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedAction {
    pub action: String,
    pub token: String,
}

/// Outcome envelope: protocol acks and action results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultMessage {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ResultMessage {
    /// Positive result with no message
    pub fn success() -> Self {
        Self {
            ok: true,
            message: String::new(),
        }
    }

    /// Negative result with a reason
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// Frame received by the dispatcher on a listener connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Command(Command),
    Result(ResultMessage),
}

/// Frame received by a listener from the dispatcher
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerFrame {
    Relay(RelayedAction),
    Result(ResultMessage),
}

fn decode_object(text: &str) -> Result<serde_json::Value> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if !value.is_object() {
        return Err(Error::Protocol(format!(
            "Expected a JSON object, got: {}",
            preview(text)
        )));
    }
    Ok(value)
}

/// Decode a frame sent by a listener.
///
/// Objects carrying `ok` but no `command` are result envelopes; every other
/// object is a command envelope (missing fields default to empty, so an empty
/// object is an unrecognized command).
pub fn decode_inbound(text: &str) -> Result<InboundFrame> {
    let value = decode_object(text)?;
    if value.get("command").is_none() && value.get("ok").is_some() {
        let result: ResultMessage = serde_json::from_value(value)?;
        return Ok(InboundFrame::Result(result));
    }
    let message: ListenerMessage = serde_json::from_value(value)?;
    Ok(InboundFrame::Command(message.into()))
}

/// Decode a frame sent by the dispatcher
pub fn decode_listener_frame(text: &str) -> Result<ListenerFrame> {
    let value = decode_object(text)?;
    if value.get("action").is_some() {
        let relayed: RelayedAction = serde_json::from_value(value)?;
        return Ok(ListenerFrame::Relay(relayed));
    }
    let result: ResultMessage = serde_json::from_value(value)?;
    Ok(ListenerFrame::Result(result))
}

/// Serialize an envelope to a text frame payload
pub fn encode<T: Serialize>(envelope: &T) -> Result<String> {
    Ok(serde_json::to_string(envelope)?)
}

fn preview(text: &str) -> &str {
    let end = text
        .char_indices()
        .nth(120)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    &text[..end]
}
