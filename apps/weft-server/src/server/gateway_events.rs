use serde::Serialize;
use weft_core::UserId;
use weft_protocol::{
    ConversationCreated, ConversationUpdated, ErrorNotice, MessageLikeToggled, MessageSentAck,
    MessageWire, MessagesRead, PresenceChanged, TypingNotice, CONVERSATION_CREATED_EVENT,
    CONVERSATION_UPDATED_EVENT, ERROR_EVENT, MESSAGES_READ_EVENT, MESSAGE_LIKE_TOGGLED_EVENT,
    MESSAGE_SENT_EVENT, NEW_MESSAGE_EVENT, READY_EVENT, TYPING_EVENT, USER_OFFLINE_EVENT,
    USER_ONLINE_EVENT,
};

use super::auth::outbound_event;

pub(crate) struct GatewayEvent {
    pub(crate) event_type: &'static str,
    pub(crate) payload: String,
}

fn build_event<T: Serialize>(event_type: &'static str, payload: T) -> GatewayEvent {
    GatewayEvent {
        event_type,
        payload: outbound_event(event_type, payload),
    }
}

#[derive(Serialize)]
struct ReadyPayload {
    user_id: String,
}

pub(crate) fn ready(user_id: UserId) -> GatewayEvent {
    build_event(
        READY_EVENT,
        ReadyPayload {
            user_id: user_id.to_string(),
        },
    )
}

pub(crate) fn new_message(message: &MessageWire) -> GatewayEvent {
    build_event(NEW_MESSAGE_EVENT, message)
}

pub(crate) fn message_sent(ack: &MessageSentAck) -> GatewayEvent {
    build_event(MESSAGE_SENT_EVENT, ack)
}

pub(crate) fn conversation_updated(update: &ConversationUpdated) -> GatewayEvent {
    build_event(CONVERSATION_UPDATED_EVENT, update)
}

pub(crate) fn conversation_created(created: &ConversationCreated) -> GatewayEvent {
    build_event(CONVERSATION_CREATED_EVENT, created)
}

pub(crate) fn user_online(change: &PresenceChanged) -> GatewayEvent {
    build_event(USER_ONLINE_EVENT, change)
}

pub(crate) fn user_offline(change: &PresenceChanged) -> GatewayEvent {
    build_event(USER_OFFLINE_EVENT, change)
}

pub(crate) fn messages_read(receipt: &MessagesRead) -> GatewayEvent {
    build_event(MESSAGES_READ_EVENT, receipt)
}

pub(crate) fn message_like_toggled(toggle: &MessageLikeToggled) -> GatewayEvent {
    build_event(MESSAGE_LIKE_TOGGLED_EVENT, toggle)
}

pub(crate) fn typing(notice: &TypingNotice) -> GatewayEvent {
    build_event(TYPING_EVENT, notice)
}

pub(crate) fn error_notice(message: &str) -> GatewayEvent {
    build_event(
        ERROR_EVENT,
        ErrorNotice {
            message: message.to_owned(),
        },
    )
}
