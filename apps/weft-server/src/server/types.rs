use axum::{
    http::header::CONTENT_TYPE,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use weft_protocol::ConversationWire;

use super::{core::METRICS_TEXT_CONTENT_TYPE, metrics::render_metrics};

#[derive(Debug, Serialize)]
pub(crate) struct HealthResponse {
    pub(crate) status: &'static str,
}

pub(crate) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

pub(crate) async fn metrics() -> Response {
    (
        [(CONTENT_TYPE, METRICS_TEXT_CONTENT_TYPE)],
        render_metrics(),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
pub(crate) struct ErrorBody {
    pub(crate) error: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GetOrCreateConversationRequest {
    pub(crate) peer_user_id: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct GetOrCreateConversationResponse {
    pub(crate) conversation: ConversationWire,
    pub(crate) was_new_conversation: bool,
}

#[derive(Debug, Serialize)]
pub(crate) struct ConversationListResponse {
    pub(crate) conversations: Vec<ConversationWire>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct CreateMessageRequest {
    pub(crate) text: Option<String>,
    pub(crate) image_ref: Option<String>,
    pub(crate) voice_ref: Option<String>,
    pub(crate) voice_duration_secs: Option<u32>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MessageHistoryResponse {
    pub(crate) messages: Vec<weft_protocol::MessageWire>,
    pub(crate) next_before: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct MarkReadResponse {
    pub(crate) updated_count: usize,
}

#[derive(Debug, Serialize)]
pub(crate) struct ToggleLikeResponse {
    pub(crate) message_id: String,
    pub(crate) is_liked: bool,
    pub(crate) likes_count: usize,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConversationPath {
    pub(crate) conversation_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MessagePath {
    pub(crate) conversation_id: String,
    pub(crate) message_id: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct HistoryQuery {
    pub(crate) limit: Option<usize>,
    pub(crate) before: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayAuthQuery {
    pub(crate) access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewayJoinConversation {
    pub(crate) conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewaySendMessage {
    pub(crate) destination: String,
    pub(crate) text: Option<String>,
    pub(crate) image_ref: Option<String>,
    pub(crate) voice_ref: Option<String>,
    pub(crate) voice_duration_secs: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewayTyping {
    pub(crate) conversation_id: String,
    pub(crate) is_typing: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewayMarkRead {
    pub(crate) conversation_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(crate) struct GatewayToggleLike {
    pub(crate) conversation_id: String,
    pub(crate) message_id: String,
}
