use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;
use weft_core::{UserId, Username};

use super::{
    auth::issue_access_token,
    core::{AppConfig, AppState},
    router::build_router_with_state,
};

const TEST_IP: &str = "203.0.113.10";

fn test_app() -> (Router, AppState) {
    build_router_with_state(&AppConfig {
        request_timeout: Duration::from_secs(2),
        rate_limit_requests_per_minute: 1000,
        ..AppConfig::default()
    })
    .expect("router should build")
}

async fn provision_user(state: &AppState, name: &str) -> (UserId, String) {
    let user_id = state
        .create_user(Username::try_from(String::from(name)).expect("valid username"), None)
        .await
        .expect("user should provision");
    let token = issue_access_token(state, user_id).expect("token should mint");
    (user_id, token)
}

fn api_request(method: &str, uri: &str, token: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", TEST_IP);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    let body = body.map_or_else(Body::empty, |value| Body::from(value.to_string()));
    builder.body(body).expect("request should build")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body should be readable");
    serde_json::from_slice(&bytes).expect("response body should be valid json")
}

async fn start_conversation(app: &Router, token: &str, peer: UserId) -> String {
    let response = app
        .clone()
        .oneshot(api_request(
            "POST",
            "/conversations",
            Some(token),
            Some(json!({"peer_user_id": peer.to_string()})),
        ))
        .await
        .expect("get-or-create should execute");
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await["conversation"]["conversation_id"]
        .as_str()
        .expect("conversation id should exist")
        .to_owned()
}

async fn send_text(app: &Router, token: &str, conversation_id: &str, text: &str) -> Value {
    let response = app
        .clone()
        .oneshot(api_request(
            "POST",
            &format!("/conversations/{conversation_id}/messages"),
            Some(token),
            Some(json!({"text": text})),
        ))
        .await
        .expect("message post should execute");
    assert_eq!(response.status(), StatusCode::OK);
    json_body(response).await
}

#[tokio::test]
async fn concurrent_get_or_create_from_both_directions_yields_one_conversation() {
    let (app, state) = test_app();
    let (alice_id, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&state, "bob_2").await;

    let from_alice = app.clone().oneshot(api_request(
        "POST",
        "/conversations",
        Some(&alice_token),
        Some(json!({"peer_user_id": bob_id.to_string()})),
    ));
    let from_bob = app.clone().oneshot(api_request(
        "POST",
        "/conversations",
        Some(&bob_token),
        Some(json!({"peer_user_id": alice_id.to_string()})),
    ));
    let (alice_response, bob_response) = tokio::join!(from_alice, from_bob);

    let alice_json = json_body(alice_response.expect("alice request should execute")).await;
    let bob_json = json_body(bob_response.expect("bob request should execute")).await;
    assert_eq!(
        alice_json["conversation"]["conversation_id"],
        bob_json["conversation"]["conversation_id"]
    );
    let created_flags = [
        alice_json["was_new_conversation"].as_bool().unwrap(),
        bob_json["was_new_conversation"].as_bool().unwrap(),
    ];
    assert_eq!(created_flags.iter().filter(|flag| **flag).count(), 1);

    let list = app
        .clone()
        .oneshot(api_request("GET", "/conversations", Some(&alice_token), None))
        .await
        .unwrap();
    let list_json = json_body(list).await;
    assert_eq!(list_json["conversations"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn get_or_create_rejects_unknown_and_self_counterparts() {
    let (app, state) = test_app();
    let (alice_id, alice_token) = provision_user(&state, "alice_1").await;

    let unknown = app
        .clone()
        .oneshot(api_request(
            "POST",
            "/conversations",
            Some(&alice_token),
            Some(json!({"peer_user_id": UserId::new().to_string()})),
        ))
        .await
        .unwrap();
    assert_eq!(unknown.status(), StatusCode::NOT_FOUND);

    let with_self = app
        .clone()
        .oneshot(api_request(
            "POST",
            "/conversations",
            Some(&alice_token),
            Some(json!({"peer_user_id": alice_id.to_string()})),
        ))
        .await
        .unwrap();
    assert_eq!(with_self.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn message_payload_must_carry_at_least_one_part() {
    let (app, state) = test_app();
    let (_, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, _) = provision_user(&state, "bob_2").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;

    let empty = app
        .clone()
        .oneshot(api_request(
            "POST",
            &format!("/conversations/{conversation_id}/messages"),
            Some(&alice_token),
            Some(json!({})),
        ))
        .await
        .unwrap();
    assert_eq!(empty.status(), StatusCode::BAD_REQUEST);

    let voice_without_duration = app
        .clone()
        .oneshot(api_request(
            "POST",
            &format!("/conversations/{conversation_id}/messages"),
            Some(&alice_token),
            Some(json!({"voice_ref": "voice/1.ogg"})),
        ))
        .await
        .unwrap();
    assert_eq!(voice_without_duration.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn voice_messages_round_trip_as_one_sub_object() {
    let (app, state) = test_app();
    let (_, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, _) = provision_user(&state, "bob_2").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;

    let response = app
        .clone()
        .oneshot(api_request(
            "POST",
            &format!("/conversations/{conversation_id}/messages"),
            Some(&alice_token),
            Some(json!({"voice_ref": "voice/1.ogg", "voice_duration_secs": 7})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let message = json_body(response).await;
    assert_eq!(message["voice"]["media_ref"], "voice/1.ogg");
    assert_eq!(message["voice"]["duration_secs"], 7);
    assert!(message.get("text").is_none());
}

#[tokio::test]
async fn history_pages_newest_first_internally_but_returns_oldest_first() {
    let (app, state) = test_app();
    let (_, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, _) = provision_user(&state, "bob_2").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;

    for index in 1..=5 {
        send_text(&app, &alice_token, &conversation_id, &format!("msg-{index}")).await;
    }

    let mut collected = Vec::new();
    let mut before: Option<String> = None;
    loop {
        let uri = match &before {
            Some(cursor) => format!(
                "/conversations/{conversation_id}/messages?limit=2&before={cursor}"
            ),
            None => format!("/conversations/{conversation_id}/messages?limit=2"),
        };
        let response = app
            .clone()
            .oneshot(api_request("GET", &uri, Some(&alice_token), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let page = json_body(response).await;
        let texts: Vec<String> = page["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|message| message["text"].as_str().unwrap().to_owned())
            .collect();
        // Every page is oldest-first within itself.
        let mut sorted = texts.clone();
        sorted.sort();
        assert_eq!(texts, sorted);
        collected.splice(0..0, texts);
        match page["next_before"].as_str() {
            Some(cursor) => before = Some(cursor.to_owned()),
            None => break,
        }
    }
    assert_eq!(
        collected,
        vec!["msg-1", "msg-2", "msg-3", "msg-4", "msg-5"]
    );
}

#[tokio::test]
async fn mark_read_is_idempotent() {
    let (app, state) = test_app();
    let (alice_id, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&state, "bob_2").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;
    send_text(&app, &alice_token, &conversation_id, "one").await;
    send_text(&app, &alice_token, &conversation_id, "two").await;

    let first = app
        .clone()
        .oneshot(api_request(
            "POST",
            &format!("/conversations/{conversation_id}/read"),
            Some(&bob_token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(json_body(first).await["updated_count"], 2);

    let second = app
        .clone()
        .oneshot(api_request(
            "POST",
            &format!("/conversations/{conversation_id}/read"),
            Some(&bob_token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(json_body(second).await["updated_count"], 0);

    let history = app
        .clone()
        .oneshot(api_request(
            "GET",
            &format!("/conversations/{conversation_id}/messages"),
            Some(&alice_token),
            None,
        ))
        .await
        .unwrap();
    let history_json = json_body(history).await;
    for message in history_json["messages"].as_array().unwrap() {
        let read_by: Vec<&str> = message["read_by"]
            .as_array()
            .unwrap()
            .iter()
            .map(|value| value.as_str().unwrap())
            .collect();
        let bob = bob_id.to_string();
        let alice = alice_id.to_string();
        assert_eq!(read_by.iter().filter(|id| **id == bob).count(), 1);
        assert!(read_by.contains(&alice.as_str()));
    }
}

#[tokio::test]
async fn toggle_like_is_an_involution() {
    let (app, state) = test_app();
    let (_, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&state, "bob_2").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;
    let message = send_text(&app, &alice_token, &conversation_id, "like me").await;
    let message_id = message["message_id"].as_str().unwrap();

    let like_uri = format!("/conversations/{conversation_id}/messages/{message_id}/like");
    let first = app
        .clone()
        .oneshot(api_request("POST", &like_uri, Some(&bob_token), None))
        .await
        .unwrap();
    let first_json = json_body(first).await;
    assert_eq!(first_json["is_liked"], true);
    assert_eq!(first_json["likes_count"], 1);

    let second = app
        .clone()
        .oneshot(api_request("POST", &like_uri, Some(&bob_token), None))
        .await
        .unwrap();
    let second_json = json_body(second).await;
    assert_eq!(second_json["is_liked"], false);
    assert_eq!(second_json["likes_count"], 0);
}

#[tokio::test]
async fn liking_an_unknown_message_is_not_found() {
    let (app, state) = test_app();
    let (_, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, _) = provision_user(&state, "bob_2").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;

    let response = app
        .clone()
        .oneshot(api_request(
            "POST",
            &format!("/conversations/{conversation_id}/messages/01J00000000000000000000000/like"),
            Some(&alice_token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn access_gate_rejects_outsiders_and_missing_credentials() {
    let (app, state) = test_app();
    let (_, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, _) = provision_user(&state, "bob_2").await;
    let (_, mallory_token) = provision_user(&state, "mallory_3").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;

    let no_token = app
        .clone()
        .oneshot(api_request(
            "GET",
            &format!("/conversations/{conversation_id}/messages"),
            None,
            None,
        ))
        .await
        .unwrap();
    assert_eq!(no_token.status(), StatusCode::UNAUTHORIZED);

    let outsider = app
        .clone()
        .oneshot(api_request(
            "GET",
            &format!("/conversations/{conversation_id}/messages"),
            Some(&mallory_token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(outsider.status(), StatusCode::FORBIDDEN);

    let missing = app
        .clone()
        .oneshot(api_request(
            "GET",
            "/conversations/01J00000000000000000000000/messages",
            Some(&alice_token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn soft_delete_is_per_user_and_cleared_by_new_messages() {
    let (app, state) = test_app();
    let (_, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&state, "bob_2").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;
    send_text(&app, &alice_token, &conversation_id, "hello").await;

    let delete = app
        .clone()
        .oneshot(api_request(
            "DELETE",
            &format!("/conversations/{conversation_id}"),
            Some(&bob_token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(delete.status(), StatusCode::NO_CONTENT);

    let bob_list = json_body(
        app.clone()
            .oneshot(api_request("GET", "/conversations", Some(&bob_token), None))
            .await
            .unwrap(),
    )
    .await;
    assert!(bob_list["conversations"].as_array().unwrap().is_empty());

    let alice_list = json_body(
        app.clone()
            .oneshot(api_request("GET", "/conversations", Some(&alice_token), None))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(alice_list["conversations"].as_array().unwrap().len(), 1);

    // A new message resurfaces the thread for the participant who hid it.
    send_text(&app, &alice_token, &conversation_id, "are you there?").await;
    let bob_list = json_body(
        app.clone()
            .oneshot(api_request("GET", "/conversations", Some(&bob_token), None))
            .await
            .unwrap(),
    )
    .await;
    assert_eq!(bob_list["conversations"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn conversation_is_removed_once_both_participants_delete_it() {
    let (app, state) = test_app();
    let (_, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&state, "bob_2").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;
    send_text(&app, &alice_token, &conversation_id, "short-lived").await;

    for token in [&bob_token, &alice_token] {
        let delete = app
            .clone()
            .oneshot(api_request(
                "DELETE",
                &format!("/conversations/{conversation_id}"),
                Some(token),
                None,
            ))
            .await
            .unwrap();
        assert_eq!(delete.status(), StatusCode::NO_CONTENT);
    }

    let history = app
        .clone()
        .oneshot(api_request(
            "GET",
            &format!("/conversations/{conversation_id}/messages"),
            Some(&alice_token),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(history.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn conversation_list_carries_preview_and_unread_count() {
    let (app, state) = test_app();
    let (_, alice_token) = provision_user(&state, "alice_1").await;
    let (bob_id, bob_token) = provision_user(&state, "bob_2").await;
    let conversation_id = start_conversation(&app, &alice_token, bob_id).await;
    send_text(&app, &alice_token, &conversation_id, "first").await;
    send_text(&app, &alice_token, &conversation_id, "second").await;

    let bob_list = json_body(
        app.clone()
            .oneshot(api_request("GET", "/conversations", Some(&bob_token), None))
            .await
            .unwrap(),
    )
    .await;
    let entry = &bob_list["conversations"][0];
    assert_eq!(entry["conversation_id"].as_str().unwrap(), conversation_id);
    assert_eq!(entry["peer"]["username"], "alice_1");
    assert_eq!(entry["last_message"]["text"], "second");
    assert_eq!(entry["unread_count"], 2);
}
