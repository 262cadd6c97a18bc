#![forbid(unsafe_code)]

mod wire;

use serde::{Deserialize, Serialize};

pub use wire::{
    ConversationCreated, ConversationUpdated, ConversationWire, ErrorNotice, MessageLikeToggled,
    MessageSentAck, MessageWire, MessagesRead, PresenceChanged, SenderWire, TypingNotice,
};

/// Current gateway envelope version.
pub const PROTOCOL_VERSION: u16 = 1;
/// Maximum allowed gateway payload bytes.
pub const MAX_EVENT_BYTES: usize = 64 * 1024;

/// Client -> server command types.
pub const JOIN_CONVERSATION: &str = "join_conversation";
pub const LEAVE_CONVERSATION: &str = "leave_conversation";
pub const SEND_MESSAGE: &str = "send_message";
pub const TYPING: &str = "typing";
pub const MARK_READ: &str = "mark_read";
pub const TOGGLE_LIKE: &str = "toggle_like";

/// Server -> client event types.
pub const READY_EVENT: &str = "ready";
pub const NEW_MESSAGE_EVENT: &str = "new_message";
pub const MESSAGE_SENT_EVENT: &str = "message_sent";
pub const CONVERSATION_UPDATED_EVENT: &str = "conversation_updated";
pub const CONVERSATION_CREATED_EVENT: &str = "conversation_created";
pub const USER_ONLINE_EVENT: &str = "user_online";
pub const USER_OFFLINE_EVENT: &str = "user_offline";
pub const MESSAGES_READ_EVENT: &str = "messages_read";
pub const MESSAGE_LIKE_TOGGLED_EVENT: &str = "message_like_toggled";
pub const TYPING_EVENT: &str = "typing";
pub const ERROR_EVENT: &str = "error";

/// Versioned gateway envelope. All traffic in both directions uses
/// `{ v, t, d }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Envelope<T> {
    pub v: u16,
    pub t: EventType,
    pub d: T,
}

/// Event type identifier with a strict character allowlist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EventType(String);

impl EventType {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for EventType {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_event_type(&value)?;
        Ok(Self(value))
    }
}

impl From<EventType> for String {
    fn from(value: EventType) -> Self {
        value.0
    }
}

/// Parse and validate an incoming envelope at the network boundary.
///
/// # Errors
/// Returns [`ProtocolError`] if the payload exceeds limits, is malformed
/// JSON, carries an unsupported version, or has an invalid event type.
pub fn parse_envelope(input: &[u8]) -> Result<Envelope<serde_json::Value>, ProtocolError> {
    if input.len() > MAX_EVENT_BYTES {
        return Err(ProtocolError::OversizedPayload {
            max: MAX_EVENT_BYTES,
            actual: input.len(),
        });
    }

    let envelope: Envelope<serde_json::Value> = serde_json::from_slice(input)?;
    if envelope.v != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion {
            expected: PROTOCOL_VERSION,
            actual: envelope.v,
        });
    }

    Ok(envelope)
}

pub(crate) fn validate_event_type(value: &str) -> Result<(), ProtocolError> {
    const MAX_LEN: usize = 64;

    if value.is_empty() || value.len() > MAX_LEN {
        return Err(ProtocolError::InvalidEventType);
    }

    if value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '.')
    {
        return Ok(());
    }

    Err(ProtocolError::InvalidEventType)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("payload exceeds max size: max={max} bytes actual={actual} bytes")]
    OversizedPayload { max: usize, actual: usize },
    #[error("unsupported envelope version: expected={expected} actual={actual}")]
    UnsupportedVersion { expected: u16, actual: u16 },
    #[error("invalid event type")]
    InvalidEventType,
    #[error("invalid json payload")]
    InvalidJson,
}

impl From<serde_json::Error> for ProtocolError {
    fn from(_: serde_json::Error) -> Self {
        Self::InvalidJson
    }
}
