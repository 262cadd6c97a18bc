use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use weft_core::UserId;
use weft_protocol::{ConversationCreated, MessageLikeToggled, MessageWire};

use super::{
    auth::authenticate,
    core::{AppState, DEFAULT_HISTORY_LIMIT, MAX_HISTORY_LIMIT},
    domain::{
        append_message, conversation_last_activity, find_or_create_conversation,
        hide_conversation_for, last_message_wire, list_conversations_for, list_messages,
        load_conversation_for, mark_conversation_read, participants_wire, payload_from_parts,
        toggle_message_like, unread_count_for, ConversationAccess,
    },
    errors::ServiceError,
    gateway_events,
    realtime::{broadcast_user_event, fanout_like_toggled, fanout_messages_read, fanout_new_message},
    types::{
        ConversationListResponse, ConversationPath, CreateMessageRequest,
        GetOrCreateConversationRequest, GetOrCreateConversationResponse, HistoryQuery,
        MarkReadResponse, MessageHistoryResponse, MessagePath, ToggleLikeResponse,
    },
};

pub(crate) async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ConversationListResponse>, ServiceError> {
    let auth = authenticate(&state, &headers).await?;
    let conversations = list_conversations_for(&state, auth.user_id).await?;
    Ok(Json(ConversationListResponse { conversations }))
}

/// Fallback-path twin of the gateway's destination resolution: get or create
/// the conversation with a counterpart. A freshly created conversation is
/// announced on both participants' personal channels before the response
/// returns, so live devices materialize it the same way in both paths.
pub(crate) async fn get_or_create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<GetOrCreateConversationRequest>,
) -> Result<Json<GetOrCreateConversationResponse>, ServiceError> {
    let auth = authenticate(&state, &headers).await?;
    let peer =
        UserId::try_from(payload.peer_user_id).map_err(|_| ServiceError::InvalidRequest)?;
    let (access, was_new) = find_or_create_conversation(&state, auth.user_id, peer).await?;

    if was_new {
        let participants = participants_wire(&state, access.pair).await?;
        let created_event = gateway_events::conversation_created(&ConversationCreated {
            conversation_id: access.id.clone(),
            participants,
        });
        for user_id in [access.pair.lo(), access.pair.hi()] {
            broadcast_user_event(&state, user_id, &created_event).await;
        }
    }

    let conversation = conversation_wire_for(&state, &access, auth.user_id).await?;
    Ok(Json(GetOrCreateConversationResponse {
        conversation,
        was_new_conversation: was_new,
    }))
}

pub(crate) async fn get_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ConversationPath>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<MessageHistoryResponse>, ServiceError> {
    let auth = authenticate(&state, &headers).await?;
    let limit = query.limit.unwrap_or(DEFAULT_HISTORY_LIMIT);
    if limit == 0 || limit > MAX_HISTORY_LIMIT {
        return Err(ServiceError::InvalidRequest);
    }
    let access = load_conversation_for(&state, &path.conversation_id, auth.user_id).await?;
    let (messages, next_before) = list_messages(&state, &access, limit, query.before).await?;
    Ok(Json(MessageHistoryResponse {
        messages,
        next_before,
    }))
}

pub(crate) async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ConversationPath>,
    Json(payload): Json<CreateMessageRequest>,
) -> Result<Json<MessageWire>, ServiceError> {
    let auth = authenticate(&state, &headers).await?;
    let access = load_conversation_for(&state, &path.conversation_id, auth.user_id).await?;
    let payload = payload_from_parts(
        payload.text,
        payload.image_ref,
        payload.voice_ref,
        payload.voice_duration_secs,
    )?;
    let wire = append_message(&state, &access, auth.user_id, payload).await?;
    fanout_new_message(&state, &access, &wire, false).await;
    Ok(Json(wire))
}

pub(crate) async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ConversationPath>,
) -> Result<Json<MarkReadResponse>, ServiceError> {
    let auth = authenticate(&state, &headers).await?;
    let access = load_conversation_for(&state, &path.conversation_id, auth.user_id).await?;
    let updated_count = mark_conversation_read(&state, &access, auth.user_id).await?;
    if updated_count > 0 {
        fanout_messages_read(&state, &access, auth.user_id).await;
    }
    Ok(Json(MarkReadResponse { updated_count }))
}

pub(crate) async fn toggle_like(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<MessagePath>,
) -> Result<Json<ToggleLikeResponse>, ServiceError> {
    let auth = authenticate(&state, &headers).await?;
    let access = load_conversation_for(&state, &path.conversation_id, auth.user_id).await?;
    let (is_liked, likes_count) =
        toggle_message_like(&state, &access, &path.message_id, auth.user_id).await?;
    fanout_like_toggled(
        &state,
        &access,
        &MessageLikeToggled {
            conversation_id: access.id.clone(),
            message_id: path.message_id.clone(),
            user_id: auth.user_id.to_string(),
            is_liked,
            likes_count,
        },
    )
    .await;
    Ok(Json(ToggleLikeResponse {
        message_id: path.message_id,
        is_liked,
        likes_count,
    }))
}

pub(crate) async fn delete_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(path): Path<ConversationPath>,
) -> Result<StatusCode, ServiceError> {
    let auth = authenticate(&state, &headers).await?;
    let access = load_conversation_for(&state, &path.conversation_id, auth.user_id).await?;
    hide_conversation_for(&state, &access, auth.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn conversation_wire_for(
    state: &AppState,
    access: &ConversationAccess,
    me: UserId,
) -> Result<weft_protocol::ConversationWire, ServiceError> {
    let peer = access.pair.counterpart_of(me).ok_or(ServiceError::Internal)?;
    Ok(weft_protocol::ConversationWire {
        conversation_id: access.id.clone(),
        peer: super::core::fetch_sender(state, peer).await?,
        last_message: last_message_wire(state, access).await?,
        last_activity_unix: conversation_last_activity(state, &access.id).await?,
        unread_count: unread_count_for(state, &access.id, me).await?,
    })
}
