use sqlx::Row;
use ulid::Ulid;
use weft_core::{ParticipantPair, UserId};
use weft_protocol::{ConversationWire, SenderWire};

use crate::server::{
    auth::now_unix,
    core::{fetch_sender, user_exists, AppState, ConversationRecord},
    db::ensure_db_schema,
    domain::messages::{last_message_wire, unread_count_for},
    errors::ServiceError,
};

/// Authorization gate output: proof that a user may touch a conversation.
/// Every read/write path starts by obtaining one of these.
#[derive(Debug, Clone)]
pub(crate) struct ConversationAccess {
    pub(crate) id: String,
    pub(crate) pair: ParticipantPair,
}

/// What a live-channel send destination turned out to be. Resolved exactly
/// once, instead of trial-and-error branching in every handler.
#[derive(Debug)]
pub(crate) enum SendDestination {
    ExistingConversation(ConversationAccess),
    CandidatePeer(UserId),
}

#[derive(Debug)]
pub(crate) struct ResolvedSend {
    pub(crate) access: ConversationAccess,
    pub(crate) was_new: bool,
    /// True when the destination was a counterpart user id, meaning the
    /// sending session still needs to be pointed at the real conversation.
    pub(crate) redirected: bool,
}

/// Loads a conversation and checks the user is one of its two participants.
/// NotFound for missing ids, Forbidden for outsiders. No side effects.
pub(crate) async fn load_conversation_for(
    state: &AppState,
    conversation_id: &str,
    user_id: UserId,
) -> Result<ConversationAccess, ServiceError> {
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let row =
            sqlx::query("SELECT user_lo, user_hi FROM conversations WHERE conversation_id = $1")
                .bind(conversation_id)
                .fetch_optional(pool)
                .await
                .map_err(|_| ServiceError::TransientStorage)?
                .ok_or(ServiceError::NotFound)?;
        let pair = pair_from_columns(
            row.try_get("user_lo").map_err(|_| ServiceError::Internal)?,
            row.try_get("user_hi").map_err(|_| ServiceError::Internal)?,
        )?;
        if !pair.contains(user_id) {
            return Err(ServiceError::Forbidden);
        }
        return Ok(ConversationAccess {
            id: conversation_id.to_owned(),
            pair,
        });
    }

    let conversations = state.conversations.read().await;
    let conversation = conversations
        .get(conversation_id)
        .ok_or(ServiceError::NotFound)?;
    if !conversation.pair.contains(user_id) {
        return Err(ServiceError::Forbidden);
    }
    Ok(ConversationAccess {
        id: conversation.id.clone(),
        pair: conversation.pair,
    })
}

/// Finds the unique conversation for the (me, peer) pair, creating it when
/// absent. Concurrent callers for the same pair converge on one row: the
/// insert goes through the unique pair constraint and a racing loser simply
/// reads the winner's row back.
pub(crate) async fn find_or_create_conversation(
    state: &AppState,
    me: UserId,
    peer: UserId,
) -> Result<(ConversationAccess, bool), ServiceError> {
    let pair = ParticipantPair::new(me, peer)?;
    if !user_exists(state, peer).await? {
        return Err(ServiceError::NotFound);
    }

    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        if let Some(existing) = fetch_pair_row(state, pair).await? {
            return Ok((existing, false));
        }

        let conversation_id = Ulid::new().to_string();
        let inserted = sqlx::query(
            "INSERT INTO conversations (conversation_id, user_lo, user_hi, last_activity_unix)
             VALUES ($1, $2, $3, $4)
             ON CONFLICT (user_lo, user_hi) DO NOTHING",
        )
        .bind(&conversation_id)
        .bind(pair.lo().to_string())
        .bind(pair.hi().to_string())
        .bind(now_unix())
        .execute(pool)
        .await
        .map_err(|_| ServiceError::TransientStorage)?;
        if inserted.rows_affected() == 1 {
            return Ok((
                ConversationAccess {
                    id: conversation_id,
                    pair,
                },
                true,
            ));
        }

        // Lost the race: the winner's row is committed and visible now.
        let winner = fetch_pair_row(state, pair)
            .await?
            .ok_or(ServiceError::TransientStorage)?;
        return Ok((winner, false));
    }

    let mut conversations = state.conversations.write().await;
    if let Some(existing) = conversations
        .values()
        .find(|conversation| conversation.pair == pair)
    {
        return Ok((
            ConversationAccess {
                id: existing.id.clone(),
                pair,
            },
            false,
        ));
    }
    let conversation_id = Ulid::new().to_string();
    conversations.insert(
        conversation_id.clone(),
        ConversationRecord {
            id: conversation_id.clone(),
            pair,
            messages: Vec::new(),
            last_activity_unix: now_unix(),
            hidden_by: std::collections::HashSet::new(),
        },
    );
    Ok((
        ConversationAccess {
            id: conversation_id,
            pair,
        },
        true,
    ))
}

/// Classifies a live-channel destination: an id the access gate admits is an
/// existing conversation; a NotFound id is reinterpreted as a counterpart
/// user id. Forbidden propagates as-is.
pub(crate) async fn classify_destination(
    state: &AppState,
    me: UserId,
    destination: &str,
) -> Result<SendDestination, ServiceError> {
    match load_conversation_for(state, destination, me).await {
        Ok(access) => Ok(SendDestination::ExistingConversation(access)),
        Err(ServiceError::NotFound) => {
            let peer = UserId::try_from(destination.to_owned())
                .map_err(|_| ServiceError::NotFound)?;
            Ok(SendDestination::CandidatePeer(peer))
        }
        Err(other) => Err(other),
    }
}

pub(crate) async fn resolve_send_destination(
    state: &AppState,
    me: UserId,
    destination: &str,
) -> Result<ResolvedSend, ServiceError> {
    match classify_destination(state, me, destination).await? {
        SendDestination::ExistingConversation(access) => Ok(ResolvedSend {
            access,
            was_new: false,
            redirected: false,
        }),
        SendDestination::CandidatePeer(peer) => {
            let (access, was_new) = find_or_create_conversation(state, me, peer).await?;
            Ok(ResolvedSend {
                access,
                was_new,
                redirected: true,
            })
        }
    }
}

/// Soft-deletes the conversation from one participant's view. The row is
/// physically removed only once both participants have hidden it.
pub(crate) async fn hide_conversation_for(
    state: &AppState,
    access: &ConversationAccess,
    user_id: UserId,
) -> Result<(), ServiceError> {
    if let Some(pool) = &state.db_pool {
        sqlx::query(
            "INSERT INTO conversation_hides (conversation_id, user_id, hidden_at_unix)
             VALUES ($1, $2, $3)
             ON CONFLICT (conversation_id, user_id) DO NOTHING",
        )
        .bind(&access.id)
        .bind(user_id.to_string())
        .bind(now_unix())
        .execute(pool)
        .await
        .map_err(|_| ServiceError::TransientStorage)?;

        let row = sqlx::query(
            "SELECT COUNT(*) AS hidden_count FROM conversation_hides WHERE conversation_id = $1",
        )
        .bind(&access.id)
        .fetch_one(pool)
        .await
        .map_err(|_| ServiceError::TransientStorage)?;
        let hidden_count: i64 = row
            .try_get("hidden_count")
            .map_err(|_| ServiceError::Internal)?;
        if hidden_count >= 2 {
            sqlx::query("DELETE FROM conversations WHERE conversation_id = $1")
                .bind(&access.id)
                .execute(pool)
                .await
                .map_err(|_| ServiceError::TransientStorage)?;
        }
        return Ok(());
    }

    let mut conversations = state.conversations.write().await;
    let Some(conversation) = conversations.get_mut(&access.id) else {
        return Err(ServiceError::NotFound);
    };
    conversation.hidden_by.insert(user_id);
    let both_hidden = conversation.hidden_by.contains(&conversation.pair.lo())
        && conversation.hidden_by.contains(&conversation.pair.hi());
    if both_hidden {
        conversations.remove(&access.id);
    }
    Ok(())
}

/// Conversation list for one user, most recently active first, soft-deleted
/// rows excluded.
pub(crate) async fn list_conversations_for(
    state: &AppState,
    me: UserId,
) -> Result<Vec<ConversationWire>, ServiceError> {
    let mut summaries = Vec::new();
    if let Some(pool) = &state.db_pool {
        ensure_db_schema(state).await?;
        let rows = sqlx::query(
            "SELECT conversation_id, user_lo, user_hi, last_activity_unix
             FROM conversations c
             WHERE (user_lo = $1 OR user_hi = $1)
               AND NOT EXISTS (
                 SELECT 1 FROM conversation_hides h
                 WHERE h.conversation_id = c.conversation_id AND h.user_id = $1
               )
             ORDER BY last_activity_unix DESC",
        )
        .bind(me.to_string())
        .fetch_all(pool)
        .await
        .map_err(|_| ServiceError::TransientStorage)?;

        for row in rows {
            let conversation_id: String = row
                .try_get("conversation_id")
                .map_err(|_| ServiceError::Internal)?;
            let pair = pair_from_columns(
                row.try_get("user_lo").map_err(|_| ServiceError::Internal)?,
                row.try_get("user_hi").map_err(|_| ServiceError::Internal)?,
            )?;
            let last_activity_unix: i64 = row
                .try_get("last_activity_unix")
                .map_err(|_| ServiceError::Internal)?;
            summaries.push((conversation_id, pair, last_activity_unix));
        }
    } else {
        let conversations = state.conversations.read().await;
        let mut visible: Vec<_> = conversations
            .values()
            .filter(|conversation| {
                conversation.pair.contains(me) && !conversation.hidden_by.contains(&me)
            })
            .map(|conversation| {
                (
                    conversation.id.clone(),
                    conversation.pair,
                    conversation.last_activity_unix,
                )
            })
            .collect();
        visible.sort_by(|a, b| b.2.cmp(&a.2));
        summaries = visible;
    }

    let mut list = Vec::with_capacity(summaries.len());
    for (conversation_id, pair, last_activity_unix) in summaries {
        let access = ConversationAccess {
            id: conversation_id,
            pair,
        };
        let peer = pair.counterpart_of(me).ok_or(ServiceError::Internal)?;
        list.push(ConversationWire {
            peer: fetch_sender(state, peer).await?,
            last_message: last_message_wire(state, &access).await?,
            unread_count: unread_count_for(state, &access.id, me).await?,
            last_activity_unix,
            conversation_id: access.id,
        });
    }
    Ok(list)
}

/// Both participants in resolved-sender shape, for conversation_created
/// payloads.
pub(crate) async fn participants_wire(
    state: &AppState,
    pair: ParticipantPair,
) -> Result<Vec<SenderWire>, ServiceError> {
    Ok(vec![
        fetch_sender(state, pair.lo()).await?,
        fetch_sender(state, pair.hi()).await?,
    ])
}

pub(crate) async fn conversation_last_activity(
    state: &AppState,
    conversation_id: &str,
) -> Result<i64, ServiceError> {
    if let Some(pool) = &state.db_pool {
        let row = sqlx::query(
            "SELECT last_activity_unix FROM conversations WHERE conversation_id = $1",
        )
        .bind(conversation_id)
        .fetch_optional(pool)
        .await
        .map_err(|_| ServiceError::TransientStorage)?
        .ok_or(ServiceError::NotFound)?;
        return row
            .try_get("last_activity_unix")
            .map_err(|_| ServiceError::Internal);
    }

    let conversations = state.conversations.read().await;
    conversations
        .get(conversation_id)
        .map(|conversation| conversation.last_activity_unix)
        .ok_or(ServiceError::NotFound)
}

async fn fetch_pair_row(
    state: &AppState,
    pair: ParticipantPair,
) -> Result<Option<ConversationAccess>, ServiceError> {
    let Some(pool) = &state.db_pool else {
        return Ok(None);
    };
    let row = sqlx::query(
        "SELECT conversation_id FROM conversations WHERE user_lo = $1 AND user_hi = $2",
    )
    .bind(pair.lo().to_string())
    .bind(pair.hi().to_string())
    .fetch_optional(pool)
    .await
    .map_err(|_| ServiceError::TransientStorage)?;
    match row {
        Some(row) => Ok(Some(ConversationAccess {
            id: row
                .try_get("conversation_id")
                .map_err(|_| ServiceError::Internal)?,
            pair,
        })),
        None => Ok(None),
    }
}

fn pair_from_columns(user_lo: String, user_hi: String) -> Result<ParticipantPair, ServiceError> {
    let lo = UserId::try_from(user_lo).map_err(|_| ServiceError::Internal)?;
    let hi = UserId::try_from(user_hi).map_err(|_| ServiceError::Internal)?;
    ParticipantPair::new(lo, hi).map_err(|_| ServiceError::Internal)
}
