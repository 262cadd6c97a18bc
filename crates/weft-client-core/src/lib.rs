#![forbid(unsafe_code)]

//! Client-side view of the conversation state.
//!
//! The store keeps an optimistic local projection of the server's
//! conversations and merges authoritative events into it. Sends are staged as
//! provisional entries under a locally generated temp id; the matching
//! authoritative message replaces the provisional entry instead of appending
//! a duplicate, and a failed send rolls the view back to its last confirmed
//! snapshot. The transport a send travels over never changes the merge.

use std::collections::HashMap;

use weft_core::MessagePayload;
use weft_protocol::{
    ConversationCreated, ConversationUpdated, ConversationWire, MessageLikeToggled,
    MessageSentAck, MessageWire, MessagesRead, SenderWire,
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("no pending send with this temp id")]
    UnknownPendingSend,
}

/// How a send left the device. Both routes land in [`ClientStore::apply_message`]
/// with the same payload shape, so the choice is bookkeeping only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendTransport {
    LiveChannel,
    HttpFallback,
}

/// One message as the client currently believes it to be. Provisional entries
/// carry a temp id and have not been confirmed by the server yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalMessage {
    pub message_id: String,
    pub sender_id: String,
    pub payload: MessagePayload,
    pub read_by: Vec<String>,
    pub liked_by: Vec<String>,
    pub likes_count: usize,
    pub created_at_unix: i64,
    pub provisional: bool,
}

/// One conversation list row. The key is the server conversation id once
/// known; before that, sends addressed to a counterpart are tracked under the
/// counterpart's user id until [`ClientStore::adopt_conversation_id`] rekeys
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub key: String,
    pub peer: SenderWire,
    pub preview: String,
    pub last_activity_unix: i64,
    pub unread_count: usize,
    pub provisional: bool,
}

#[derive(Debug, Clone)]
struct PendingSend {
    conversation_key: String,
    transport: SendTransport,
    optimistic_preview: String,
    prior_entry: PriorEntry,
}

#[derive(Debug, Clone)]
enum PriorEntry {
    Existing {
        preview: String,
        last_activity_unix: i64,
    },
    Absent,
}

#[derive(Debug)]
pub struct ClientStore {
    me: String,
    conversations: Vec<ConversationEntry>,
    messages: HashMap<String, Vec<LocalMessage>>,
    pending: HashMap<String, PendingSend>,
    temp_counter: u64,
}

impl ClientStore {
    #[must_use]
    pub fn new(me: impl Into<String>) -> Self {
        Self {
            me: me.into(),
            conversations: Vec::new(),
            messages: HashMap::new(),
            pending: HashMap::new(),
            temp_counter: 0,
        }
    }

    /// Conversation list, most recently active first.
    #[must_use]
    pub fn conversations(&self) -> &[ConversationEntry] {
        &self.conversations
    }

    /// Message list for one conversation key, oldest first.
    #[must_use]
    pub fn messages(&self, key: &str) -> &[LocalMessage] {
        self.messages.get(key).map_or(&[], Vec::as_slice)
    }

    #[must_use]
    pub fn pending_transport(&self, temp_id: &str) -> Option<SendTransport> {
        self.pending.get(temp_id).map(|send| send.transport)
    }

    /// Stages an outgoing message: inserts a provisional entry under a fresh
    /// temp id and optimistically bumps the conversation row. Returns the
    /// temp id the caller needs for [`Self::fail_send`].
    pub fn begin_send(
        &mut self,
        destination: &str,
        peer: SenderWire,
        payload: MessagePayload,
        local_clock_unix: i64,
        transport: SendTransport,
    ) -> String {
        self.temp_counter += 1;
        let temp_id = format!("temp-{}", self.temp_counter);
        let optimistic_preview = payload.preview();

        let prior_entry = match self.entry_index(destination) {
            Some(index) => {
                let entry = &self.conversations[index];
                PriorEntry::Existing {
                    preview: entry.preview.clone(),
                    last_activity_unix: entry.last_activity_unix,
                }
            }
            None => PriorEntry::Absent,
        };

        self.pending.insert(
            temp_id.clone(),
            PendingSend {
                conversation_key: destination.to_owned(),
                transport,
                optimistic_preview: optimistic_preview.clone(),
                prior_entry,
            },
        );

        self.messages
            .entry(destination.to_owned())
            .or_default()
            .push(LocalMessage {
                message_id: temp_id.clone(),
                sender_id: self.me.clone(),
                payload,
                read_by: vec![self.me.clone()],
                liked_by: Vec::new(),
                likes_count: 0,
                created_at_unix: local_clock_unix,
                provisional: true,
            });

        match self.entry_index(destination) {
            Some(index) => {
                let entry = &mut self.conversations[index];
                entry.preview = optimistic_preview;
                entry.last_activity_unix = local_clock_unix;
            }
            None => self.conversations.push(ConversationEntry {
                key: destination.to_owned(),
                peer,
                preview: optimistic_preview,
                last_activity_unix: local_clock_unix,
                unread_count: 0,
                provisional: true,
            }),
        }
        self.resort();

        temp_id
    }

    /// Applies a `message_sent` acknowledgement. When the server resolved the
    /// send to a different conversation id than the client addressed, staged
    /// state moves under the authoritative key so future operations land in
    /// the right room.
    pub fn apply_send_ack(&mut self, destination: &str, ack: &MessageSentAck) {
        self.adopt_conversation_id(destination, &ack.conversation_id);
    }

    /// Re-homes a provisionally keyed conversation (counterpart user id) under
    /// the server-resolved conversation id. Called when a `message_sent` ack
    /// reports a new conversation, or when `conversation_created` arrives for
    /// a peer the client has already staged messages for.
    pub fn adopt_conversation_id(&mut self, provisional_key: &str, conversation_id: &str) {
        if provisional_key == conversation_id {
            return;
        }
        if let Some(mut staged) = self.messages.remove(provisional_key) {
            self.messages
                .entry(conversation_id.to_owned())
                .or_default()
                .append(&mut staged);
        }
        if let Some(index) = self.entry_index(provisional_key) {
            if self.entry_index(conversation_id).is_some() {
                self.conversations.remove(index);
            } else {
                self.conversations[index].key = conversation_id.to_owned();
            }
        }
        for send in self.pending.values_mut() {
            if send.conversation_key == provisional_key {
                send.conversation_key = conversation_id.to_owned();
            }
        }
    }

    /// Merges an authoritative message. A provisional entry with the same
    /// payload from the same sender is replaced in place; an entry with the
    /// same message id is refreshed; anything else is appended in timestamp
    /// order.
    pub fn apply_message(&mut self, wire: &MessageWire) {
        let key = wire.conversation_id.clone();
        let list = self.messages.entry(key.clone()).or_default();
        let confirmed = local_from_wire(wire);

        if let Some(existing) = list
            .iter_mut()
            .find(|message| message.message_id == wire.message_id)
        {
            *existing = confirmed;
        } else if let Some(provisional) = list.iter_mut().find(|message| {
            message.provisional
                && message.sender_id == wire.sender.user_id
                && message.payload == wire.payload
        }) {
            let temp_id = provisional.message_id.clone();
            *provisional = confirmed;
            self.pending.remove(&temp_id);
        } else {
            list.push(confirmed);
        }
        list.sort_by(|a, b| {
            a.created_at_unix
                .cmp(&b.created_at_unix)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });

        let unread = self.unread_count(&key);
        match self.entry_index(&key) {
            Some(index) => {
                let entry = &mut self.conversations[index];
                entry.preview = wire.payload.preview();
                entry.last_activity_unix = wire.created_at_unix;
                entry.unread_count = unread;
                entry.provisional = false;
            }
            None => {
                let peer = if wire.sender.user_id == self.me {
                    // Own message echoed to a conversation this device has not
                    // materialized yet; peer details arrive with the next
                    // conversation refresh.
                    SenderWire {
                        user_id: String::new(),
                        username: String::new(),
                        avatar_ref: None,
                    }
                } else {
                    wire.sender.clone()
                };
                self.conversations.push(ConversationEntry {
                    key,
                    peer,
                    preview: wire.payload.preview(),
                    last_activity_unix: wire.created_at_unix,
                    unread_count: unread,
                    provisional: false,
                });
            }
        }
        self.resort();
    }

    /// Abandons a staged send: the provisional entry is removed and the
    /// conversation row reverts to its pre-send snapshot, unless an
    /// authoritative update has already replaced the optimistic preview.
    ///
    /// # Errors
    /// Returns [`SyncError::UnknownPendingSend`] for an unknown temp id.
    pub fn fail_send(&mut self, temp_id: &str) -> Result<(), SyncError> {
        let send = self
            .pending
            .remove(temp_id)
            .ok_or(SyncError::UnknownPendingSend)?;

        if let Some(list) = self.messages.get_mut(&send.conversation_key) {
            list.retain(|message| message.message_id != temp_id);
            if list.is_empty() {
                self.messages.remove(&send.conversation_key);
            }
        }

        let Some(index) = self.entry_index(&send.conversation_key) else {
            return Ok(());
        };
        if self.conversations[index].preview != send.optimistic_preview {
            // An authoritative event updated the row after this send was
            // staged; that state wins over the stale snapshot.
            return Ok(());
        }
        match send.prior_entry {
            PriorEntry::Existing {
                preview,
                last_activity_unix,
            } => {
                let entry = &mut self.conversations[index];
                entry.preview = preview;
                entry.last_activity_unix = last_activity_unix;
            }
            PriorEntry::Absent => {
                self.conversations.remove(index);
            }
        }
        self.resort();
        Ok(())
    }

    /// Applies a read receipt: the reader joins the `read_by` set of every
    /// message they did not send. Repeated receipts are no-ops.
    pub fn apply_read_receipt(&mut self, event: &MessagesRead) {
        if let Some(list) = self.messages.get_mut(&event.conversation_id) {
            for message in list.iter_mut() {
                if message.sender_id != event.reader_id
                    && !message.read_by.contains(&event.reader_id)
                {
                    message.read_by.push(event.reader_id.clone());
                }
            }
        }
        let unread = self.unread_count(&event.conversation_id);
        if let Some(index) = self.entry_index(&event.conversation_id) {
            self.conversations[index].unread_count = unread;
        }
    }

    /// Applies an authoritative like toggle to the targeted message.
    pub fn apply_like(&mut self, event: &MessageLikeToggled) {
        let Some(list) = self.messages.get_mut(&event.conversation_id) else {
            return;
        };
        let Some(message) = list
            .iter_mut()
            .find(|message| message.message_id == event.message_id)
        else {
            return;
        };
        if event.is_liked {
            if !message.liked_by.contains(&event.user_id) {
                message.liked_by.push(event.user_id.clone());
            }
        } else {
            message.liked_by.retain(|user| user != &event.user_id);
        }
        message.likes_count = event.likes_count;
    }

    /// Applies a conversation preview update. Authoritative, so it overwrites
    /// whatever optimistic guess is currently displayed.
    pub fn apply_conversation_updated(&mut self, event: &ConversationUpdated) {
        match self.entry_index(&event.conversation_id) {
            Some(index) => {
                let entry = &mut self.conversations[index];
                entry.preview = event.preview.clone();
                entry.last_activity_unix = event.last_activity_unix;
                entry.provisional = false;
            }
            None => self.conversations.push(ConversationEntry {
                key: event.conversation_id.clone(),
                peer: SenderWire {
                    user_id: String::new(),
                    username: String::new(),
                    avatar_ref: None,
                },
                preview: event.preview.clone(),
                last_activity_unix: event.last_activity_unix,
                unread_count: 0,
                provisional: false,
            }),
        }
        self.resort();
    }

    /// Materializes a conversation the server just created, adopting any
    /// messages staged under the counterpart's user id.
    pub fn apply_conversation_created(&mut self, event: &ConversationCreated) {
        let peer = event
            .participants
            .iter()
            .find(|participant| participant.user_id != self.me)
            .cloned();
        let Some(peer) = peer else {
            return;
        };
        let staging_key = peer.user_id.clone();
        self.adopt_conversation_id(&staging_key, &event.conversation_id);
        match self.entry_index(&event.conversation_id) {
            Some(index) => {
                let entry = &mut self.conversations[index];
                entry.peer = peer;
                entry.provisional = false;
            }
            None => {
                self.conversations.push(ConversationEntry {
                    key: event.conversation_id.clone(),
                    peer,
                    preview: String::new(),
                    last_activity_unix: 0,
                    unread_count: 0,
                    provisional: false,
                });
                self.resort();
            }
        }
    }

    /// Replaces the conversation list with the server's view. Message lists
    /// and in-flight sends survive a refresh; list rows do not.
    pub fn refresh_conversations(&mut self, list: Vec<ConversationWire>) {
        self.conversations = list
            .into_iter()
            .map(|wire| ConversationEntry {
                key: wire.conversation_id,
                peer: wire.peer,
                preview: wire
                    .last_message
                    .as_ref()
                    .map(|message| message.payload.preview())
                    .unwrap_or_default(),
                last_activity_unix: wire.last_activity_unix,
                unread_count: wire.unread_count,
                provisional: false,
            })
            .collect();
        self.resort();
    }

    fn entry_index(&self, key: &str) -> Option<usize> {
        self.conversations.iter().position(|entry| entry.key == key)
    }

    fn unread_count(&self, key: &str) -> usize {
        self.messages.get(key).map_or(0, |list| {
            list.iter()
                .filter(|message| {
                    message.sender_id != self.me && !message.read_by.contains(&self.me)
                })
                .count()
        })
    }

    fn resort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_activity_unix.cmp(&a.last_activity_unix));
    }
}

fn local_from_wire(wire: &MessageWire) -> LocalMessage {
    LocalMessage {
        message_id: wire.message_id.clone(),
        sender_id: wire.sender.user_id.clone(),
        payload: wire.payload.clone(),
        read_by: wire.read_by.clone(),
        liked_by: wire.liked_by.clone(),
        likes_count: wire.likes_count,
        created_at_unix: wire.created_at_unix,
        provisional: false,
    }
}
