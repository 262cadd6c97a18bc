use std::{net::SocketAddr, time::Duration};

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message, MaybeTlsStream, WebSocketStream};
use tower::ServiceExt;
use weft_core::{UserId, Username};
use weft_server::{build_router_with_state, issue_access_token, AppConfig, AppState};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const TEST_IP: &str = "203.0.113.40";

struct TestServer {
    app: Router,
    state: AppState,
    addr: SocketAddr,
}

async fn start_server() -> TestServer {
    let (app, state) = build_router_with_state(&AppConfig {
        request_timeout: Duration::from_secs(2),
        rate_limit_requests_per_minute: 1000,
        ..AppConfig::default()
    })
    .expect("router should build");

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should expose addr");
    let serve_app = app.clone();
    tokio::spawn(async move {
        axum::serve(
            listener,
            serve_app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .expect("server should run");
    });

    TestServer { app, state, addr }
}

async fn provision_user(state: &AppState, name: &str) -> (UserId, String) {
    let user_id = state
        .create_user(
            Username::try_from(String::from(name)).expect("valid username"),
            None,
        )
        .await
        .expect("user should provision");
    let token = issue_access_token(state, user_id).expect("token should mint");
    (user_id, token)
}

async fn connect_gateway(addr: SocketAddr, token: &str) -> Socket {
    let url = format!("ws://{addr}/gateway/ws?access_token={token}");
    let (socket, _) = connect_async(url).await.expect("gateway should upgrade");
    socket
}

fn command(event_type: &str, data: Value) -> Message {
    Message::Text(json!({"v": 1, "t": event_type, "d": data}).to_string().into())
}

/// Reads the next data event, skipping transport frames.
async fn next_event(socket: &mut Socket) -> (String, Value) {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("gateway should emit an event in time")
            .expect("gateway stream should stay open")
            .expect("gateway frame should be readable");
        match frame {
            Message::Text(text) => {
                let envelope: Value =
                    serde_json::from_str(text.as_str()).expect("event should be valid json");
                return (
                    envelope["t"].as_str().expect("event type").to_owned(),
                    envelope["d"].clone(),
                );
            }
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected gateway frame: {other:?}"),
        }
    }
}

/// Collects events until `target` arrives, returning the full trace with the
/// target event last.
async fn collect_until(socket: &mut Socket, target: &str) -> Vec<(String, Value)> {
    let mut trace = Vec::new();
    loop {
        let (event_type, data) = next_event(socket).await;
        let done = event_type == target;
        trace.push((event_type, data));
        if done {
            return trace;
        }
    }
}

async fn wait_for(socket: &mut Socket, target: &str) -> Value {
    collect_until(socket, target)
        .await
        .pop()
        .expect("trace should contain the target event")
        .1
}

fn rest_request(method: &str, uri: &str, token: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", TEST_IP)
        .header("authorization", format!("Bearer {token}"));
    let body = body.map_or_else(Body::empty, |value| Body::from(value.to_string()));
    builder.body(body).expect("request should build")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&bytes).expect("response body should be valid json")
}

#[tokio::test]
async fn send_addressed_by_user_id_creates_room_and_orders_events() {
    let server = start_server().await;
    let (_alice_id, alice_token) = provision_user(&server.state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&server.state, "bob_2").await;

    let mut alice = connect_gateway(server.addr, &alice_token).await;
    let mut bob = connect_gateway(server.addr, &bob_token).await;
    wait_for(&mut alice, "ready").await;
    wait_for(&mut bob, "ready").await;

    alice
        .send(command(
            "send_message",
            json!({"destination": bob_id.to_string(), "text": "hello over there"}),
        ))
        .await
        .expect("send_message should transmit");

    let ack = wait_for(&mut alice, "message_sent").await;
    assert_eq!(ack["was_new_conversation"], true);
    let conversation_id = ack["conversation_id"].as_str().expect("resolved id");

    let bob_trace = collect_until(&mut bob, "new_message").await;
    let created_position = bob_trace
        .iter()
        .position(|(event_type, _)| event_type == "conversation_created")
        .expect("bob should see conversation_created");
    let message_position = bob_trace.len() - 1;
    assert!(created_position < message_position);
    let (_, created) = &bob_trace[created_position];
    assert_eq!(created["conversation_id"].as_str().unwrap(), conversation_id);
    let (_, message) = &bob_trace[message_position];
    assert_eq!(message["conversation_id"].as_str().unwrap(), conversation_id);
    assert_eq!(message["text"], "hello over there");

    // Exactly one conversation exists even though none existed when the send
    // was addressed.
    let list = json_body(
        server
            .app
            .clone()
            .oneshot(rest_request("GET", "/conversations", &alice_token, None))
            .await
            .expect("list should execute"),
    )
    .await;
    assert_eq!(list["conversations"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn presence_goes_offline_only_after_the_last_device_disconnects() {
    let server = start_server().await;
    let (alice_id, alice_token) = provision_user(&server.state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&server.state, "bob_2").await;

    let mut observer = connect_gateway(server.addr, &bob_token).await;
    wait_for(&mut observer, "ready").await;

    let mut device_one = connect_gateway(server.addr, &alice_token).await;
    wait_for(&mut device_one, "ready").await;
    let online = wait_for(&mut observer, "user_online").await;
    assert_eq!(online["user_id"].as_str().unwrap(), alice_id.to_string());

    let mut device_two = connect_gateway(server.addr, &alice_token).await;
    wait_for(&mut device_two, "ready").await;

    device_one.close(None).await.expect("close should send");

    // A marker event proves no user_offline slipped in while one device is
    // still connected.
    device_two
        .send(command(
            "send_message",
            json!({"destination": bob_id.to_string(), "text": "still here"}),
        ))
        .await
        .expect("send_message should transmit");
    let trace = collect_until(&mut observer, "new_message").await;
    assert!(trace
        .iter()
        .all(|(event_type, _)| event_type != "user_offline"));

    device_two.close(None).await.expect("close should send");
    let offline = wait_for(&mut observer, "user_offline").await;
    assert_eq!(offline["user_id"].as_str().unwrap(), alice_id.to_string());
    assert!(offline["last_seen_at_unix"].as_i64().is_some());
    assert_eq!(
        server.state.last_seen_of(alice_id).await,
        offline["last_seen_at_unix"].as_i64()
    );
}

#[tokio::test]
async fn domain_errors_emit_scoped_events_without_dropping_the_connection() {
    let server = start_server().await;
    let (_, alice_token) = provision_user(&server.state, "alice_1").await;
    let (bob_id, _) = provision_user(&server.state, "bob_2").await;

    let mut alice = connect_gateway(server.addr, &alice_token).await;
    wait_for(&mut alice, "ready").await;

    alice
        .send(command(
            "join_conversation",
            json!({"conversation_id": "01J00000000000000000000000"}),
        ))
        .await
        .expect("join should transmit");
    let error = wait_for(&mut alice, "error").await;
    assert_eq!(error["message"], "not found");

    // The connection keeps serving after the error.
    alice
        .send(command(
            "send_message",
            json!({"destination": bob_id.to_string(), "text": "still alive"}),
        ))
        .await
        .expect("send_message should transmit");
    let ack = wait_for(&mut alice, "message_sent").await;
    assert_eq!(ack["was_new_conversation"], true);
}

#[tokio::test]
async fn both_transports_emit_the_same_wire_shape() {
    let server = start_server().await;
    let (_, alice_token) = provision_user(&server.state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&server.state, "bob_2").await;

    let created = json_body(
        server
            .app
            .clone()
            .oneshot(rest_request(
                "POST",
                "/conversations",
                &alice_token,
                Some(json!({"peer_user_id": bob_id.to_string()})),
            ))
            .await
            .expect("get-or-create should execute"),
    )
    .await;
    let conversation_id = created["conversation"]["conversation_id"]
        .as_str()
        .expect("conversation id")
        .to_owned();

    let mut bob = connect_gateway(server.addr, &bob_token).await;
    wait_for(&mut bob, "ready").await;
    bob.send(command(
        "join_conversation",
        json!({"conversation_id": conversation_id}),
    ))
    .await
    .expect("join should transmit");

    let response = server
        .app
        .clone()
        .oneshot(rest_request(
            "POST",
            &format!("/conversations/{conversation_id}/messages"),
            &alice_token,
            Some(json!({"text": "same shape"})),
        ))
        .await
        .expect("message post should execute");
    assert_eq!(response.status(), StatusCode::OK);
    let rest_wire = json_body(response).await;

    let gateway_wire = wait_for(&mut bob, "new_message").await;
    assert_eq!(rest_wire, gateway_wire);
}

#[tokio::test]
async fn read_like_and_typing_events_reach_the_counterpart() {
    let server = start_server().await;
    let (_, alice_token) = provision_user(&server.state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&server.state, "bob_2").await;

    let mut alice = connect_gateway(server.addr, &alice_token).await;
    let mut bob = connect_gateway(server.addr, &bob_token).await;
    wait_for(&mut alice, "ready").await;
    wait_for(&mut bob, "ready").await;

    alice
        .send(command(
            "send_message",
            json!({"destination": bob_id.to_string(), "text": "read me"}),
        ))
        .await
        .expect("send_message should transmit");
    let ack = wait_for(&mut alice, "message_sent").await;
    let conversation_id = ack["conversation_id"].as_str().expect("resolved id").to_owned();
    let message = wait_for(&mut bob, "new_message").await;
    let message_id = message["message_id"].as_str().expect("message id").to_owned();

    for socket in [&mut alice, &mut bob] {
        socket
            .send(command(
                "join_conversation",
                json!({"conversation_id": conversation_id}),
            ))
            .await
            .expect("join should transmit");
    }
    // Commands on one connection are handled in order, so an acked send from
    // alice proves her join above has been applied before bob starts typing.
    alice
        .send(command(
            "send_message",
            json!({"destination": conversation_id, "text": "joined"}),
        ))
        .await
        .expect("send_message should transmit");
    let sync_ack = wait_for(&mut alice, "message_sent").await;
    assert_eq!(sync_ack["was_new_conversation"], false);

    bob.send(command(
        "typing",
        json!({"conversation_id": conversation_id, "is_typing": true}),
    ))
    .await
    .expect("typing should transmit");
    let typing = wait_for(&mut alice, "typing").await;
    assert_eq!(typing["user_id"].as_str().unwrap(), bob_id.to_string());
    assert_eq!(typing["is_typing"], true);

    bob.send(command(
        "mark_read",
        json!({"conversation_id": conversation_id}),
    ))
    .await
    .expect("mark_read should transmit");
    let receipt = wait_for(&mut alice, "messages_read").await;
    assert_eq!(receipt["reader_id"].as_str().unwrap(), bob_id.to_string());
    assert_eq!(
        receipt["conversation_id"].as_str().unwrap(),
        conversation_id
    );

    bob.send(command(
        "toggle_like",
        json!({"conversation_id": conversation_id, "message_id": message_id}),
    ))
    .await
    .expect("toggle_like should transmit");
    let toggled = wait_for(&mut alice, "message_like_toggled").await;
    assert_eq!(toggled["message_id"].as_str().unwrap(), message_id);
    assert_eq!(toggled["is_liked"], true);
    assert_eq!(toggled["likes_count"], 1);
    assert_eq!(toggled["user_id"].as_str().unwrap(), bob_id.to_string());

    // Repeat like returns to the original state.
    bob.send(command(
        "toggle_like",
        json!({"conversation_id": conversation_id, "message_id": message_id}),
    ))
    .await
    .expect("toggle_like should transmit");
    let reverted = wait_for(&mut alice, "message_like_toggled").await;
    assert_eq!(reverted["is_liked"], false);
    assert_eq!(reverted["likes_count"], 0);
}
