use sqlx::Row;
use weft_core::UserId;

use crate::server::{
    core::AppState, domain::conversations::ConversationAccess, errors::ServiceError,
};

/// Adds the reader to the read-by set of every message in the conversation
/// they did not send. Idempotent: the second call changes nothing and
/// reports zero updates, which callers use to suppress duplicate receipts.
pub(crate) async fn mark_conversation_read(
    state: &AppState,
    access: &ConversationAccess,
    reader: UserId,
) -> Result<usize, ServiceError> {
    if let Some(pool) = &state.db_pool {
        let result = sqlx::query(
            "INSERT INTO message_reads (message_id, user_id)
             SELECT m.message_id, $2 FROM messages m
             WHERE m.conversation_id = $1 AND m.sender_id <> $2
             ON CONFLICT (message_id, user_id) DO NOTHING",
        )
        .bind(&access.id)
        .bind(reader.to_string())
        .execute(pool)
        .await
        .map_err(|_| ServiceError::TransientStorage)?;
        return usize::try_from(result.rows_affected()).map_err(|_| ServiceError::Internal);
    }

    let mut conversations = state.conversations.write().await;
    let conversation = conversations
        .get_mut(&access.id)
        .ok_or(ServiceError::NotFound)?;
    let mut updated = 0;
    for message in &mut conversation.messages {
        if message.sender_id != reader && message.read_by.insert(reader) {
            updated += 1;
        }
    }
    Ok(updated)
}

/// Flips one user's like on one message. An involution: toggling twice lands
/// back on the original state. Returns the new liked flag and total count;
/// NotFound when the message is not part of this conversation.
pub(crate) async fn toggle_message_like(
    state: &AppState,
    access: &ConversationAccess,
    message_id: &str,
    user_id: UserId,
) -> Result<(bool, usize), ServiceError> {
    if let Some(pool) = &state.db_pool {
        sqlx::query("SELECT 1 AS present FROM messages WHERE message_id = $1 AND conversation_id = $2")
            .bind(message_id)
            .bind(&access.id)
            .fetch_optional(pool)
            .await
            .map_err(|_| ServiceError::TransientStorage)?
            .ok_or(ServiceError::NotFound)?;

        let removed = sqlx::query("DELETE FROM message_likes WHERE message_id = $1 AND user_id = $2")
            .bind(message_id)
            .bind(user_id.to_string())
            .execute(pool)
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
        let is_liked = if removed.rows_affected() == 0 {
            sqlx::query(
                "INSERT INTO message_likes (message_id, user_id) VALUES ($1, $2)
                 ON CONFLICT (message_id, user_id) DO NOTHING",
            )
            .bind(message_id)
            .bind(user_id.to_string())
            .execute(pool)
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
            true
        } else {
            false
        };

        let row = sqlx::query("SELECT COUNT(*) AS likes FROM message_likes WHERE message_id = $1")
            .bind(message_id)
            .fetch_one(pool)
            .await
            .map_err(|_| ServiceError::TransientStorage)?;
        let likes: i64 = row.try_get("likes").map_err(|_| ServiceError::Internal)?;
        let likes_count = usize::try_from(likes).map_err(|_| ServiceError::Internal)?;
        return Ok((is_liked, likes_count));
    }

    let mut conversations = state.conversations.write().await;
    let conversation = conversations
        .get_mut(&access.id)
        .ok_or(ServiceError::NotFound)?;
    let message = conversation
        .messages
        .iter_mut()
        .find(|message| message.id == message_id)
        .ok_or(ServiceError::NotFound)?;

    let is_liked = if message.liked_by.remove(&user_id) {
        false
    } else {
        message.liked_by.insert(user_id);
        true
    };
    Ok((is_liked, message.liked_by.len()))
}
