mod conversations;
mod messages;
mod receipts;

pub(crate) use conversations::{
    conversation_last_activity, find_or_create_conversation, hide_conversation_for,
    list_conversations_for, load_conversation_for, participants_wire, resolve_send_destination,
    ConversationAccess,
};
pub(crate) use messages::{
    append_message, last_message_wire, list_messages, payload_from_parts, unread_count_for,
};
pub(crate) use receipts::{mark_conversation_read, toggle_message_like};
