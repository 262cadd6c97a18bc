use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use uuid::Uuid;
use weft_core::UserId;
use weft_protocol::{
    parse_envelope, ConversationCreated, ConversationUpdated, MessageLikeToggled, MessageSentAck,
    MessageWire, MessagesRead, PresenceChanged, TypingNotice, JOIN_CONVERSATION,
    LEAVE_CONVERSATION, MARK_READ, SEND_MESSAGE, TOGGLE_LIKE, TYPING,
};

use super::{
    auth::{authenticate_with_token, bearer_token, now_unix},
    core::{record_last_seen, AppState, AuthContext, ConnectionControl, ConversationListeners},
    domain::{
        append_message, load_conversation_for, mark_conversation_read, participants_wire,
        payload_from_parts, resolve_send_destination, toggle_message_like, ConversationAccess,
    },
    errors::ServiceError,
    gateway_events::{self, GatewayEvent},
    metrics::{record_gateway_event_dropped, record_gateway_event_emitted, record_ws_disconnect},
    presence::PresenceChange,
    types::{
        GatewayAuthQuery, GatewayJoinConversation, GatewayMarkRead, GatewaySendMessage,
        GatewayToggleLike, GatewayTyping,
    },
};

pub(crate) async fn gateway_ws(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    Query(query): Query<GatewayAuthQuery>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ServiceError> {
    let token = query
        .access_token
        .or_else(|| bearer_token(&headers).map(ToOwned::to_owned))
        .ok_or(ServiceError::Unauthorized)?;
    let auth = authenticate_with_token(&state, &token).await?;

    Ok(ws.on_upgrade(move |socket| async move {
        handle_gateway_connection(state, socket, auth).await;
    }))
}

#[allow(clippy::too_many_lines)]
pub(crate) async fn handle_gateway_connection(state: AppState, socket: WebSocket, auth: AuthContext) {
    let connection_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let slow_consumer_disconnect = Arc::new(AtomicBool::new(false));

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<String>(state.runtime.gateway_outbound_queue);
    state
        .connection_senders
        .write()
        .await
        .insert(connection_id, outbound_tx.clone());
    let (control_tx, mut control_rx) = tokio::sync::watch::channel(ConnectionControl::Open);
    state
        .connection_controls
        .write()
        .await
        .insert(connection_id, control_tx);

    if state.presence.register(auth.user_id, connection_id).await == PresenceChange::CameOnline {
        let online_event = gateway_events::user_online(&PresenceChanged {
            user_id: auth.user_id.to_string(),
            last_seen_at_unix: None,
        });
        broadcast_presence_event(&state, &online_event).await;
    }

    let ready_event = gateway_events::ready(auth.user_id);
    let _ = outbound_tx.send(ready_event.payload).await;
    record_gateway_event_emitted("connection", ready_event.event_type);

    let slow_consumer_disconnect_send = Arc::clone(&slow_consumer_disconnect);
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(30));
        ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ping_interval.tick() => {
                    if sink.send(Message::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                }
                control_change = control_rx.changed() => {
                    if control_change.is_ok() && *control_rx.borrow() == ConnectionControl::Close {
                        slow_consumer_disconnect_send.store(true, Ordering::Relaxed);
                        record_ws_disconnect("slow_consumer");
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1008,
                                reason: "slow_consumer".into(),
                            })))
                            .await;
                        break;
                    }
                }
                maybe_payload = outbound_rx.recv() => {
                    match maybe_payload {
                        Some(payload) => {
                            if sink.send(Message::Text(payload.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    let mut ingress = VecDeque::new();
    let mut disconnect_reason = "connection_closed";
    while let Some(incoming) = stream.next().await {
        let Ok(message) = incoming else {
            disconnect_reason = "socket_error";
            break;
        };

        let payload: Vec<u8> = match message {
            Message::Text(text) => {
                if text.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                text.as_bytes().to_vec()
            }
            Message::Binary(bytes) => {
                if bytes.len() > state.runtime.max_gateway_event_bytes {
                    disconnect_reason = "event_too_large";
                    break;
                }
                bytes.to_vec()
            }
            Message::Close(_) => {
                disconnect_reason = "client_close";
                break;
            }
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        if !allow_gateway_ingress(
            &mut ingress,
            state.runtime.gateway_ingress_events_per_window,
            state.runtime.gateway_ingress_window,
        ) {
            disconnect_reason = "ingress_rate_limited";
            break;
        }

        // Frame-level violations end the connection; anything past parsing is
        // a domain error and only produces a scoped `error` event.
        let Ok(envelope) = parse_envelope(&payload) else {
            disconnect_reason = "invalid_envelope";
            break;
        };

        if let Err(error) = handle_gateway_command(
            &state,
            &auth,
            connection_id,
            &outbound_tx,
            envelope.t.as_str(),
            envelope.d,
        )
        .await
        {
            tracing::debug!(
                event = "gateway.command.rejected",
                command = envelope.t.as_str(),
                error = %error
            );
            send_direct(&outbound_tx, &gateway_events::error_notice(error.user_message()));
        }
    }

    if !slow_consumer_disconnect.load(Ordering::Relaxed) {
        record_ws_disconnect(disconnect_reason);
    }
    remove_connection(&state, connection_id, auth.user_id).await;
    send_task.abort();
}

async fn handle_gateway_command(
    state: &AppState,
    auth: &AuthContext,
    connection_id: Uuid,
    outbound_tx: &mpsc::Sender<String>,
    event_type: &str,
    data: serde_json::Value,
) -> Result<(), ServiceError> {
    match event_type {
        JOIN_CONVERSATION => {
            let request: GatewayJoinConversation =
                serde_json::from_value(data).map_err(|_| ServiceError::InvalidRequest)?;
            let access =
                load_conversation_for(state, &request.conversation_id, auth.user_id).await?;
            add_subscription(state, connection_id, access.id, outbound_tx.clone()).await;
            Ok(())
        }
        LEAVE_CONVERSATION => {
            let request: GatewayJoinConversation =
                serde_json::from_value(data).map_err(|_| ServiceError::InvalidRequest)?;
            remove_subscription(state, connection_id, &request.conversation_id).await;
            Ok(())
        }
        SEND_MESSAGE => {
            let request: GatewaySendMessage =
                serde_json::from_value(data).map_err(|_| ServiceError::InvalidRequest)?;
            let payload = payload_from_parts(
                request.text,
                request.image_ref,
                request.voice_ref,
                request.voice_duration_secs,
            )?;
            let resolved = resolve_send_destination(state, auth.user_id, &request.destination).await?;
            let wire = append_message(state, &resolved.access, auth.user_id, payload).await?;
            if resolved.redirected {
                // The client addressed a user, not a conversation; its future
                // operations belong to the resolved room.
                add_subscription(
                    state,
                    connection_id,
                    resolved.access.id.clone(),
                    outbound_tx.clone(),
                )
                .await;
            }
            fanout_new_message(state, &resolved.access, &wire, resolved.was_new).await;
            let ack = gateway_events::message_sent(&MessageSentAck {
                message_id: wire.message_id.clone(),
                conversation_id: resolved.access.id.clone(),
                was_new_conversation: resolved.was_new,
            });
            send_direct(outbound_tx, &ack);
            Ok(())
        }
        TYPING => {
            let request: GatewayTyping =
                serde_json::from_value(data).map_err(|_| ServiceError::InvalidRequest)?;
            let access =
                load_conversation_for(state, &request.conversation_id, auth.user_id).await?;
            let event = gateway_events::typing(&TypingNotice {
                conversation_id: access.id.clone(),
                user_id: auth.user_id.to_string(),
                is_typing: request.is_typing,
            });
            broadcast_conversation_event(state, &access.id, &event, Some(connection_id)).await;
            Ok(())
        }
        MARK_READ => {
            let request: GatewayMarkRead =
                serde_json::from_value(data).map_err(|_| ServiceError::InvalidRequest)?;
            let access =
                load_conversation_for(state, &request.conversation_id, auth.user_id).await?;
            let updated = mark_conversation_read(state, &access, auth.user_id).await?;
            if updated > 0 {
                fanout_messages_read(state, &access, auth.user_id).await;
            }
            Ok(())
        }
        TOGGLE_LIKE => {
            let request: GatewayToggleLike =
                serde_json::from_value(data).map_err(|_| ServiceError::InvalidRequest)?;
            let access =
                load_conversation_for(state, &request.conversation_id, auth.user_id).await?;
            let (is_liked, likes_count) =
                toggle_message_like(state, &access, &request.message_id, auth.user_id).await?;
            fanout_like_toggled(
                state,
                &access,
                &MessageLikeToggled {
                    conversation_id: access.id.clone(),
                    message_id: request.message_id,
                    user_id: auth.user_id.to_string(),
                    is_liked,
                    likes_count,
                },
            )
            .await;
            Ok(())
        }
        _ => Err(ServiceError::InvalidRequest),
    }
}

/// Delivery order for a freshly appended message: conversation-created (when
/// the resolver just made the room) to both personal channels first, so
/// clients can materialize the entry, then the message to the conversation
/// channel, then message + list-preview update to each personal channel.
pub(crate) async fn fanout_new_message(
    state: &AppState,
    access: &ConversationAccess,
    wire: &MessageWire,
    was_new: bool,
) {
    if was_new {
        match participants_wire(state, access.pair).await {
            Ok(participants) => {
                let created_event = gateway_events::conversation_created(&ConversationCreated {
                    conversation_id: access.id.clone(),
                    participants,
                });
                for user_id in [access.pair.lo(), access.pair.hi()] {
                    broadcast_user_event(state, user_id, &created_event).await;
                }
            }
            Err(error) => {
                tracing::error!(event = "gateway.fanout.participants", error = %error);
            }
        }
    }

    let message_event = gateway_events::new_message(wire);
    broadcast_conversation_event(state, &access.id, &message_event, None).await;

    let update_event = gateway_events::conversation_updated(&ConversationUpdated {
        conversation_id: access.id.clone(),
        preview: wire.payload.preview(),
        last_activity_unix: wire.created_at_unix,
    });
    for user_id in [access.pair.lo(), access.pair.hi()] {
        broadcast_user_event(state, user_id, &message_event).await;
        broadcast_user_event(state, user_id, &update_event).await;
    }
}

pub(crate) async fn fanout_messages_read(
    state: &AppState,
    access: &ConversationAccess,
    reader: UserId,
) {
    let event = gateway_events::messages_read(&MessagesRead {
        conversation_id: access.id.clone(),
        reader_id: reader.to_string(),
    });
    if let Some(counterpart) = access.pair.counterpart_of(reader) {
        broadcast_user_event(state, counterpart, &event).await;
    }
}

pub(crate) async fn fanout_like_toggled(
    state: &AppState,
    access: &ConversationAccess,
    toggle: &MessageLikeToggled,
) {
    let event = gateway_events::message_like_toggled(toggle);
    broadcast_conversation_event(state, &access.id, &event, None).await;
    for user_id in [access.pair.lo(), access.pair.hi()] {
        broadcast_user_event(state, user_id, &event).await;
    }
}

fn send_direct(outbound_tx: &mpsc::Sender<String>, event: &GatewayEvent) {
    match outbound_tx.try_send(event.payload.clone()) {
        Ok(()) => record_gateway_event_emitted("connection", event.event_type),
        Err(mpsc::error::TrySendError::Closed(_)) => {
            record_gateway_event_dropped("connection", event.event_type, "closed");
        }
        Err(mpsc::error::TrySendError::Full(_)) => {
            record_gateway_event_dropped("connection", event.event_type, "full_queue");
        }
    }
}

fn dispatch_gateway_payload(
    listeners: &mut ConversationListeners,
    payload: &str,
    event_type: &'static str,
    scope: &'static str,
    except: Option<Uuid>,
    slow_connections: &mut Vec<Uuid>,
) -> usize {
    let mut delivered = 0usize;
    listeners.retain(|connection_id, sender| {
        if Some(*connection_id) == except {
            return true;
        }
        match sender.try_send(payload.to_owned()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped(scope, event_type, "closed");
                false
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped(scope, event_type, "full_queue");
                slow_connections.push(*connection_id);
                false
            }
        }
    });
    delivered
}

async fn close_slow_connections(state: &AppState, slow_connections: Vec<Uuid>) {
    if slow_connections.is_empty() {
        return;
    }

    let controls = state.connection_controls.read().await;
    for connection_id in slow_connections {
        if let Some(control) = controls.get(&connection_id) {
            let _ = control.send(ConnectionControl::Close);
        }
    }
}

/// Delivers an event to every live connection currently subscribed to the
/// conversation's channel.
pub(crate) async fn broadcast_conversation_event(
    state: &AppState,
    conversation_id: &str,
    event: &GatewayEvent,
    except: Option<Uuid>,
) {
    let mut slow_connections = Vec::new();
    let mut delivered = 0usize;
    let mut subscriptions = state.subscriptions.write().await;
    if let Some(listeners) = subscriptions.get_mut(conversation_id) {
        delivered = dispatch_gateway_payload(
            listeners,
            &event.payload,
            event.event_type,
            "conversation",
            except,
            &mut slow_connections,
        );
        if listeners.is_empty() {
            subscriptions.remove(conversation_id);
        }
    }
    drop(subscriptions);

    close_slow_connections(state, slow_connections).await;
    if delivered > 0 {
        tracing::debug!(
            event = "gateway.event.emit",
            scope = "conversation",
            event_type = event.event_type,
            delivered
        );
        for _ in 0..delivered {
            record_gateway_event_emitted("conversation", event.event_type);
        }
    }
}

/// Delivers an event to every live connection a user currently holds — the
/// user's personal channel.
pub(crate) async fn broadcast_user_event(state: &AppState, user_id: UserId, event: &GatewayEvent) {
    let connection_ids = state.presence.connections_of(user_id).await;
    if connection_ids.is_empty() {
        return;
    }

    let mut slow_connections = Vec::new();
    let mut delivered = 0usize;
    let mut senders = state.connection_senders.write().await;
    for connection_id in connection_ids {
        let Some(sender) = senders.get(&connection_id) else {
            continue;
        };
        match sender.try_send(event.payload.clone()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped("user", event.event_type, "closed");
                senders.remove(&connection_id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped("user", event.event_type, "full_queue");
                slow_connections.push(connection_id);
                senders.remove(&connection_id);
            }
        }
    }
    drop(senders);

    close_slow_connections(state, slow_connections).await;
    if delivered > 0 {
        tracing::debug!(
            event = "gateway.event.emit",
            scope = "user",
            event_type = event.event_type,
            delivered
        );
        for _ in 0..delivered {
            record_gateway_event_emitted("user", event.event_type);
        }
    }
}

/// Presence edges go to every live connection; a conversation-independent
/// broadcast.
pub(crate) async fn broadcast_presence_event(state: &AppState, event: &GatewayEvent) {
    let mut slow_connections = Vec::new();
    let mut delivered = 0usize;
    let mut senders = state.connection_senders.write().await;
    let connection_ids: Vec<Uuid> = senders.keys().copied().collect();
    for connection_id in connection_ids {
        let Some(sender) = senders.get(&connection_id) else {
            continue;
        };
        match sender.try_send(event.payload.clone()) {
            Ok(()) => delivered += 1,
            Err(mpsc::error::TrySendError::Closed(_)) => {
                record_gateway_event_dropped("presence", event.event_type, "closed");
                senders.remove(&connection_id);
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                record_gateway_event_dropped("presence", event.event_type, "full_queue");
                slow_connections.push(connection_id);
                senders.remove(&connection_id);
            }
        }
    }
    drop(senders);

    close_slow_connections(state, slow_connections).await;
    for _ in 0..delivered {
        record_gateway_event_emitted("presence", event.event_type);
    }
}

pub(crate) async fn add_subscription(
    state: &AppState,
    connection_id: Uuid,
    conversation_id: String,
    outbound_tx: mpsc::Sender<String>,
) {
    let mut subscriptions = state.subscriptions.write().await;
    subscriptions
        .entry(conversation_id)
        .or_default()
        .insert(connection_id, outbound_tx);
}

pub(crate) async fn remove_subscription(
    state: &AppState,
    connection_id: Uuid,
    conversation_id: &str,
) {
    let mut subscriptions = state.subscriptions.write().await;
    if let Some(listeners) = subscriptions.get_mut(conversation_id) {
        listeners.remove(&connection_id);
        if listeners.is_empty() {
            subscriptions.remove(conversation_id);
        }
    }
}

pub(crate) async fn remove_connection(state: &AppState, connection_id: Uuid, user_id: UserId) {
    state
        .connection_controls
        .write()
        .await
        .remove(&connection_id);
    state
        .connection_senders
        .write()
        .await
        .remove(&connection_id);

    let mut subscriptions = state.subscriptions.write().await;
    subscriptions.retain(|_, listeners| {
        listeners.remove(&connection_id);
        !listeners.is_empty()
    });
    drop(subscriptions);

    if state.presence.unregister(user_id, connection_id).await == PresenceChange::WentOffline {
        let seen_at_unix = now_unix();
        if let Err(error) = record_last_seen(state, user_id, seen_at_unix).await {
            tracing::error!(event = "presence.last_seen", error = %error);
        }
        let offline_event = gateway_events::user_offline(&PresenceChanged {
            user_id: user_id.to_string(),
            last_seen_at_unix: Some(seen_at_unix),
        });
        broadcast_presence_event(state, &offline_event).await;
    }
}

pub(crate) fn allow_gateway_ingress(
    ingress: &mut VecDeque<Instant>,
    limit: u32,
    window: Duration,
) -> bool {
    let now = Instant::now();
    while ingress
        .front()
        .is_some_and(|oldest| now.duration_since(*oldest) > window)
    {
        let _ = ingress.pop_front();
    }

    if ingress.len() >= limit as usize {
        return false;
    }

    ingress.push_back(now);
    true
}
