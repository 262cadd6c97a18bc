use std::{sync::Arc, time::Duration};

use anyhow::anyhow;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderName, StatusCode},
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

use super::{
    core::{AppConfig, AppState},
    handlers::{
        create_message, delete_conversation, get_messages, get_or_create_conversation,
        list_conversations, mark_read, toggle_like,
    },
    realtime::gateway_ws,
    types::{health, metrics},
};

/// Build the axum router with global security middleware.
///
/// # Errors
/// Returns an error if configured security limits are invalid.
pub fn build_router(config: &AppConfig) -> anyhow::Result<Router> {
    let (router, _) = build_router_with_state(config)?;
    Ok(router)
}

/// Like [`build_router`], but also hands back the state so embedders and
/// tests can reach the user-provisioning and token-minting seams.
///
/// # Errors
/// Returns an error if configured security limits are invalid.
pub fn build_router_with_state(config: &AppConfig) -> anyhow::Result<(Router, AppState)> {
    if config.max_gateway_event_bytes > weft_protocol::MAX_EVENT_BYTES {
        return Err(anyhow!(
            "gateway event limit cannot exceed protocol max of {} bytes",
            weft_protocol::MAX_EVENT_BYTES
        ));
    }
    if config.gateway_outbound_queue == 0 {
        return Err(anyhow!("gateway outbound queue must hold at least 1 event"));
    }
    if config.gateway_ingress_events_per_window == 0 {
        return Err(anyhow!(
            "gateway ingress rate limit must allow at least 1 event per window"
        ));
    }

    let governor_config = Arc::new(
        GovernorConfigBuilder::default()
            .period(Duration::from_secs(60))
            .burst_size(config.rate_limit_requests_per_minute)
            .key_extractor(SmartIpKeyExtractor)
            .finish()
            .ok_or_else(|| anyhow!("invalid governor configuration"))?,
    );
    let app_state = AppState::new(config)?;
    let request_id_header = HeaderName::from_static("x-request-id");
    let governor_layer = GovernorLayer::new(governor_config);

    let router = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route(
            "/conversations",
            get(list_conversations).post(get_or_create_conversation),
        )
        .route("/conversations/{conversation_id}", delete(delete_conversation))
        .route(
            "/conversations/{conversation_id}/messages",
            post(create_message).get(get_messages),
        )
        .route("/conversations/{conversation_id}/read", post(mark_read))
        .route(
            "/conversations/{conversation_id}/messages/{message_id}/like",
            post(toggle_like),
        )
        .route("/gateway/ws", get(gateway_ws))
        .with_state(app_state.clone())
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
                .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    config.request_timeout,
                ))
                .layer(governor_layer),
        );

    Ok((router, app_state))
}
