use std::collections::HashMap;

use sqlx::Row;
use weft_core::{MessagePayload, UserId, VoiceNote};
use weft_protocol::{MessageWire, SenderWire};

use crate::server::{
    auth::now_unix,
    core::{fetch_sender, AppState, MessageRecord},
    db::ensure_db_schema,
    domain::conversations::ConversationAccess,
    errors::ServiceError,
};

/// Normalizes the four optional wire fields of a send request into a
/// validated payload. A voice reference and its duration travel together or
/// not at all.
pub(crate) fn payload_from_parts(
    text: Option<String>,
    image_ref: Option<String>,
    voice_ref: Option<String>,
    voice_duration_secs: Option<u32>,
) -> Result<MessagePayload, ServiceError> {
    let voice = match (voice_ref, voice_duration_secs) {
        (Some(media_ref), Some(duration_secs)) => Some(VoiceNote {
            media_ref,
            duration_secs,
        }),
        (None, None) => None,
        _ => return Err(ServiceError::InvalidRequest),
    };
    let payload = MessagePayload {
        text,
        image_ref,
        voice,
    };
    payload.validate()?;
    Ok(payload)
}

/// Appends a message to a conversation the caller has already been admitted
/// to: persists it with the sender pre-seeded in `read_by`, bumps the
/// conversation's last activity, and clears soft-delete marks so the thread
/// reappears for a participant who had hidden it. Returns the display-ready
/// wire shape both transports emit verbatim.
pub(crate) async fn append_message(
    state: &AppState,
    access: &ConversationAccess,
    sender_id: UserId,
    payload: MessagePayload,
) -> Result<MessageWire, ServiceError> {
    payload.validate()?;
    let sender = fetch_sender(state, sender_id).await?;
    let record = MessageRecord::new(sender_id, payload, now_unix());

    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let mut tx = pool
            .begin()
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
        sqlx::query(
            "INSERT INTO messages (message_id, conversation_id, sender_id, text_content,
                                   image_ref, voice_ref, voice_duration_secs, created_at_unix)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
        )
        .bind(&record.id)
        .bind(&access.id)
        .bind(sender_id.to_string())
        .bind(record.payload.text.as_deref())
        .bind(record.payload.image_ref.as_deref())
        .bind(record.payload.voice.as_ref().map(|voice| voice.media_ref.as_str()))
        .bind(
            record
                .payload
                .voice
                .as_ref()
                .map(|voice| i32::try_from(voice.duration_secs).unwrap_or(i32::MAX)),
        )
        .bind(record.created_at_unix)
        .execute(&mut *tx)
        .await
        .map_err(|_| ServiceError::TransientStorage)?;
        sqlx::query("INSERT INTO message_reads (message_id, user_id) VALUES ($1, $2)")
            .bind(&record.id)
            .bind(sender_id.to_string())
            .execute(&mut *tx)
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
        sqlx::query("UPDATE conversations SET last_activity_unix = $2 WHERE conversation_id = $1")
            .bind(&access.id)
            .bind(record.created_at_unix)
            .execute(&mut *tx)
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
        sqlx::query("DELETE FROM conversation_hides WHERE conversation_id = $1")
            .bind(&access.id)
            .execute(&mut *tx)
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
        tx.commit()
            .await
            .map_err(|_| ServiceError::TransientStorage)?;

        return Ok(wire_from_record(&record, &access.id, sender));
    }

    let mut conversations = state.conversations.write().await;
    let conversation = conversations
        .get_mut(&access.id)
        .ok_or(ServiceError::NotFound)?;
    conversation.messages.push(record.clone());
    conversation.last_activity_unix = record.created_at_unix;
    conversation.hidden_by.clear();
    drop(conversations);

    Ok(wire_from_record(&record, &access.id, sender))
}

/// One page of messages, newest-first internally, returned oldest-first.
/// `before` is an exclusive message-id cursor; ULID ids are time-ordered so
/// id order and timestamp order agree.
pub(crate) async fn list_messages(
    state: &AppState,
    access: &ConversationAccess,
    limit: usize,
    before: Option<String>,
) -> Result<(Vec<MessageWire>, Option<String>), ServiceError> {
    let senders = participant_senders(state, access).await?;

    if let Some(pool) = &state.db_pool {
        let limit_i64 = i64::try_from(limit).map_err(|_| ServiceError::InvalidRequest)?;
        let rows = sqlx::query(
            "SELECT message_id, sender_id, text_content, image_ref, voice_ref,
                    voice_duration_secs, created_at_unix
             FROM messages
             WHERE conversation_id = $1 AND ($2::text IS NULL OR message_id < $2)
             ORDER BY message_id DESC
             LIMIT $3",
        )
        .bind(&access.id)
        .bind(before.clone())
        .bind(limit_i64)
        .fetch_all(pool)
        .await
        .map_err(|_| ServiceError::TransientStorage)?;

        let mut newest_first = Vec::with_capacity(rows.len());
        for row in rows {
            newest_first.push(stored_message_from_row(&row)?);
        }
        let message_ids: Vec<String> = newest_first
            .iter()
            .map(|message| message.id.clone())
            .collect();
        let read_map = member_map(pool, "message_reads", &message_ids).await?;
        let like_map = member_map(pool, "message_likes", &message_ids).await?;

        let next_before = if newest_first.len() == limit {
            newest_first.last().map(|message| message.id.clone())
        } else {
            None
        };
        let mut page = Vec::with_capacity(newest_first.len());
        for message in newest_first.into_iter().rev() {
            let sender = sender_for(&senders, &message.sender_id)?;
            let read_by = read_map.get(&message.id).cloned().unwrap_or_default();
            let liked_by = like_map.get(&message.id).cloned().unwrap_or_default();
            page.push(MessageWire {
                message_id: message.id,
                conversation_id: access.id.clone(),
                sender,
                payload: message.payload,
                likes_count: liked_by.len(),
                read_by,
                liked_by,
                created_at_unix: message.created_at_unix,
            });
        }
        return Ok((page, next_before));
    }

    let conversations = state.conversations.read().await;
    let conversation = conversations
        .get(&access.id)
        .ok_or(ServiceError::NotFound)?;

    let mut newest_first = Vec::with_capacity(limit);
    let mut collecting = before.is_none();
    for message in conversation.messages.iter().rev() {
        if !collecting {
            if Some(message.id.as_str()) == before.as_deref() {
                collecting = true;
            }
            continue;
        }
        if newest_first.len() == limit {
            break;
        }
        newest_first.push(message.clone());
    }
    drop(conversations);

    let next_before = if newest_first.len() == limit {
        newest_first.last().map(|message| message.id.clone())
    } else {
        None
    };
    let mut page = Vec::with_capacity(newest_first.len());
    for record in newest_first.into_iter().rev() {
        let sender = sender_for(&senders, &record.sender_id.to_string())?;
        page.push(wire_from_record(&record, &access.id, sender));
    }
    Ok((page, next_before))
}

/// The newest message of a conversation in wire shape, if any.
pub(crate) async fn last_message_wire(
    state: &AppState,
    access: &ConversationAccess,
) -> Result<Option<MessageWire>, ServiceError> {
    let (mut page, _) = list_messages(state, access, 1, None).await?;
    Ok(page.pop())
}

/// Messages the user has not read and did not send.
pub(crate) async fn unread_count_for(
    state: &AppState,
    conversation_id: &str,
    me: UserId,
) -> Result<usize, ServiceError> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT COUNT(*) AS unread
             FROM messages m
             WHERE m.conversation_id = $1 AND m.sender_id <> $2
               AND NOT EXISTS (
                 SELECT 1 FROM message_reads r
                 WHERE r.message_id = m.message_id AND r.user_id = $2
               )",
        )
        .bind(conversation_id)
        .bind(me.to_string())
        .fetch_one(pool)
        .await
        .map_err(|_| ServiceError::TransientStorage)?;
        let unread: i64 = row.try_get("unread").map_err(|_| ServiceError::Internal)?;
        return usize::try_from(unread).map_err(|_| ServiceError::Internal);
    }

    let conversations = state.conversations.read().await;
    let conversation = conversations
        .get(conversation_id)
        .ok_or(ServiceError::NotFound)?;
    Ok(conversation
        .messages
        .iter()
        .filter(|message| message.sender_id != me && !message.read_by.contains(&me))
        .count())
}

pub(crate) fn wire_from_record(
    record: &MessageRecord,
    conversation_id: &str,
    sender: SenderWire,
) -> MessageWire {
    let mut read_by: Vec<String> = record.read_by.iter().map(ToString::to_string).collect();
    read_by.sort_unstable();
    let mut liked_by: Vec<String> = record.liked_by.iter().map(ToString::to_string).collect();
    liked_by.sort_unstable();
    MessageWire {
        message_id: record.id.clone(),
        conversation_id: conversation_id.to_owned(),
        sender,
        payload: record.payload.clone(),
        likes_count: liked_by.len(),
        read_by,
        liked_by,
        created_at_unix: record.created_at_unix,
    }
}

struct StoredMessage {
    id: String,
    sender_id: String,
    payload: MessagePayload,
    created_at_unix: i64,
}

fn stored_message_from_row(row: &sqlx::postgres::PgRow) -> Result<StoredMessage, ServiceError> {
    let voice_ref: Option<String> = row
        .try_get("voice_ref")
        .map_err(|_| ServiceError::Internal)?;
    let voice_duration_secs: Option<i32> = row
        .try_get("voice_duration_secs")
        .map_err(|_| ServiceError::Internal)?;
    let voice = match (voice_ref, voice_duration_secs) {
        (Some(media_ref), Some(duration_secs)) => Some(VoiceNote {
            media_ref,
            duration_secs: u32::try_from(duration_secs).map_err(|_| ServiceError::Internal)?,
        }),
        _ => None,
    };
    Ok(StoredMessage {
        id: row
            .try_get("message_id")
            .map_err(|_| ServiceError::Internal)?,
        sender_id: row
            .try_get("sender_id")
            .map_err(|_| ServiceError::Internal)?,
        payload: MessagePayload {
            text: row
                .try_get("text_content")
                .map_err(|_| ServiceError::Internal)?,
            image_ref: row
                .try_get("image_ref")
                .map_err(|_| ServiceError::Internal)?,
            voice,
        },
        created_at_unix: row
            .try_get("created_at_unix")
            .map_err(|_| ServiceError::Internal)?,
    })
}

async fn participant_senders(
    state: &AppState,
    access: &ConversationAccess,
) -> Result<HashMap<String, SenderWire>, ServiceError> {
    let mut senders = HashMap::with_capacity(2);
    for user_id in [access.pair.lo(), access.pair.hi()] {
        senders.insert(user_id.to_string(), fetch_sender(state, user_id).await?);
    }
    Ok(senders)
}

fn sender_for(
    senders: &HashMap<String, SenderWire>,
    sender_id: &str,
) -> Result<SenderWire, ServiceError> {
    senders
        .get(sender_id)
        .cloned()
        .ok_or(ServiceError::Internal)
}

async fn member_map(
    pool: &sqlx::PgPool,
    table: &str,
    message_ids: &[String],
) -> Result<HashMap<String, Vec<String>>, ServiceError> {
    if message_ids.is_empty() {
        return Ok(HashMap::new());
    }
    // `table` is one of two compile-time constants, never caller input.
    let rows = sqlx::query(&format!(
        "SELECT message_id, user_id FROM {table} WHERE message_id = ANY($1::text[])"
    ))
    .bind(message_ids)
    .fetch_all(pool)
    .await
    .map_err(|_| ServiceError::TransientStorage)?;

    let mut members: HashMap<String, Vec<String>> = HashMap::new();
    for row in rows {
        let message_id: String = row
            .try_get("message_id")
            .map_err(|_| ServiceError::Internal)?;
        let user_id: String = row.try_get("user_id").map_err(|_| ServiceError::Internal)?;
        members.entry(message_id).or_default().push(user_id);
    }
    for list in members.values_mut() {
        list.sort_unstable();
    }
    Ok(members)
}
