use serde::{Deserialize, Serialize};
use weft_core::MessagePayload;

/// Canonical resolved-sender shape. Producers normalize whatever sender
/// representation they hold (bare id or populated profile) into this before
/// anything crosses the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderWire {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_ref: Option<String>,
}

/// Display-ready shape of a message. Both the gateway and the fallback HTTP
/// path emit exactly this shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageWire {
    pub message_id: String,
    pub conversation_id: String,
    pub sender: SenderWire,
    #[serde(flatten)]
    pub payload: MessagePayload,
    pub read_by: Vec<String>,
    pub liked_by: Vec<String>,
    pub likes_count: usize,
    pub created_at_unix: i64,
}

/// Conversation list entry as seen by one participant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationWire {
    pub conversation_id: String,
    pub peer: SenderWire,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessageWire>,
    pub last_activity_unix: i64,
    pub unread_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSentAck {
    pub message_id: String,
    pub conversation_id: String,
    pub was_new_conversation: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationUpdated {
    pub conversation_id: String,
    pub preview: String,
    pub last_activity_unix: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationCreated {
    pub conversation_id: String,
    pub participants: Vec<SenderWire>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceChanged {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at_unix: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagesRead {
    pub conversation_id: String,
    pub reader_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageLikeToggled {
    pub conversation_id: String,
    pub message_id: String,
    pub user_id: String,
    pub is_liked: bool,
    pub likes_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingNotice {
    pub conversation_id: String,
    pub user_id: String,
    pub is_typing: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorNotice {
    pub message: String,
}
