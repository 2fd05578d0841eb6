//! End-to-end tests for the WebSocket session: connect, event handling,
//! error reporting and reauthentication over a real socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use parley_server::gateway::SqliteGateway;
use parley_server::{build_router, AppState, ServerConfig};
use parley_shared::{RoomId, UserId};

type Ws = WebSocketStream<MaybeTlsStream<TcpStream>>;

const READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Start the server on a random port. The temp dir must outlive the test.
async fn start_test_server() -> (AppState, SocketAddr, TempDir) {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let config = ServerConfig {
        blob_storage_path: dir.path().join("uploads"),
        public_base_url: "http://chat.test".to_string(),
        jwt_secret: "ws-test-secret".to_string(),
        ..ServerConfig::default()
    };
    let gateway = Arc::new(SqliteGateway::in_memory().expect("Failed to open database"));
    let state = AppState::new(config, gateway)
        .await
        .expect("Failed to build state");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = build_router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (state, addr, dir)
}

fn token_for(state: &AppState, user: UserId, ttl: chrono::Duration) -> String {
    state.verifier.issue(user, ttl).unwrap()
}

fn valid_token(state: &AppState, user: UserId) -> String {
    token_for(state, user, chrono::Duration::minutes(5))
}

async fn connect(addr: SocketAddr, token: &str) -> Ws {
    let url = format!("ws://{addr}/ws?token={token}");
    let (ws, _) = connect_async(&url)
        .await
        .expect("Failed to connect to WebSocket");
    ws
}

async fn send(ws: &mut Ws, event: Value) {
    ws.send(Message::Text(event.to_string().into()))
        .await
        .expect("Failed to send frame");
}

/// Next JSON event, skipping pings. Panics on close or timeout.
async fn next_event(ws: &mut Ws) -> Value {
    loop {
        let frame = timeout(READ_TIMEOUT, ws.next())
            .await
            .expect("Timed out waiting for an event")
            .expect("Stream ended")
            .expect("Receive error");
        match frame {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected a text frame, got {other:?}"),
        }
    }
}

/// Next event that is not a presence snapshot.
async fn next_non_presence(ws: &mut Ws) -> Value {
    loop {
        let event = next_event(ws).await;
        if event["event"] != "presence-snapshot" {
            return event;
        }
    }
}

/// Assert nothing but presence snapshots arrive for a short while.
async fn assert_quiet(ws: &mut Ws) {
    let result = timeout(Duration::from_millis(300), next_non_presence(ws)).await;
    if let Ok(event) = result {
        panic!("Expected no events, got {event}");
    }
}

/// Read until the server closes. Returns the events seen and the close code.
async fn read_until_close(ws: &mut Ws) -> (Vec<Value>, Option<u16>) {
    let mut events = Vec::new();
    loop {
        let frame = timeout(READ_TIMEOUT, ws.next())
            .await
            .expect("Timed out waiting for close");
        match frame {
            Some(Ok(Message::Text(text))) => {
                events.push(serde_json::from_str(text.as_str()).unwrap())
            }
            Some(Ok(Message::Close(frame))) => {
                return (events, frame.map(|f| u16::from(f.code)))
            }
            Some(Ok(_)) => continue,
            Some(Err(_)) | None => return (events, None),
        }
    }
}

async fn wait_until_offline(state: &AppState) {
    for _ in 0..50 {
        if state.dispatcher.registry().is_empty().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("Registry still has connections");
}

#[tokio::test]
async fn test_connect_snapshot_includes_self() {
    let (state, addr, _dir) = start_test_server().await;
    let user = UserId::new();
    let mut ws = connect(addr, &valid_token(&state, user)).await;

    let event = next_event(&mut ws).await;
    assert_eq!(event["event"], "presence-snapshot");
    let entries = event["data"].as_array().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["userId"], user.to_string());

    let registered = state.dispatcher.registry().lookup(user).await.unwrap();
    assert_eq!(entries[0]["connectionId"], registered.id().to_string());
}

#[tokio::test]
async fn test_expired_token_closes_with_4001() {
    let (state, addr, _dir) = start_test_server().await;
    let token = token_for(&state, UserId::new(), chrono::Duration::seconds(-60));
    let mut ws = connect(addr, &token).await;

    let (events, code) = read_until_close(&mut ws).await;
    assert!(events.is_empty());
    assert_eq!(code, Some(4001));
    assert!(state.dispatcher.registry().is_empty().await);
}

#[tokio::test]
async fn test_invalid_token_closes_with_4002() {
    let (state, addr, _dir) = start_test_server().await;
    let mut ws = connect(addr, "not-a-jwt").await;

    let (events, code) = read_until_close(&mut ws).await;
    assert!(events.is_empty());
    assert_eq!(code, Some(4002));
    assert!(state.dispatcher.registry().is_empty().await);
}

#[tokio::test]
async fn test_malformed_frames_keep_the_session_open() {
    let (state, addr, _dir) = start_test_server().await;
    let mut ws = connect(addr, &valid_token(&state, UserId::new())).await;

    ws.send(Message::Text("not json".into())).await.unwrap();
    let event = next_non_presence(&mut ws).await;
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["code"], "BAD_REQUEST");

    send(&mut ws, json!({ "event": "no-such-event", "data": {} })).await;
    let event = next_non_presence(&mut ws).await;
    assert_eq!(event["data"]["code"], "BAD_REQUEST");

    ws.send(Message::Binary(vec![1u8, 2, 3].into())).await.unwrap();
    let event = next_non_presence(&mut ws).await;
    assert_eq!(event["data"]["code"], "BAD_REQUEST");

    // Still usable afterwards.
    send(&mut ws, json!({ "event": "list-friends" })).await;
    let event = next_non_presence(&mut ws).await;
    assert_eq!(event["event"], "friends");
    assert_eq!(event["data"], json!([]));
}

#[tokio::test]
async fn test_direct_message_acked_and_delivered() {
    let (state, addr, _dir) = start_test_server().await;
    let (alice, bob) = (UserId::new(), UserId::new());
    let mut ws_alice = connect(addr, &valid_token(&state, alice)).await;
    let mut ws_bob = connect(addr, &valid_token(&state, bob)).await;
    next_event(&mut ws_bob).await;

    send(
        &mut ws_alice,
        json!({
            "event": "send-direct",
            "data": { "recipientId": bob.to_string(), "text": "hi bob" }
        }),
    )
    .await;

    let ack = next_non_presence(&mut ws_alice).await;
    assert_eq!(ack["event"], "ack");
    assert_eq!(ack["data"]["delivered"], true);

    let message = next_non_presence(&mut ws_bob).await;
    assert_eq!(message["event"], "message");
    assert_eq!(message["data"]["id"], ack["data"]["messageId"]);
    assert_eq!(message["data"]["text"], "hi bob");
    assert_eq!(message["data"]["senderId"], alice.to_string());
}

#[tokio::test]
async fn test_errors_reach_only_the_sender() {
    let (state, addr, _dir) = start_test_server().await;
    let (alice, bob) = (UserId::new(), UserId::new());
    let mut ws_alice = connect(addr, &valid_token(&state, alice)).await;
    let mut ws_bob = connect(addr, &valid_token(&state, bob)).await;

    send(
        &mut ws_alice,
        json!({
            "event": "message",
            "data": {
                "text": "both targets",
                "roomId": RoomId::new().to_string(),
                "recipientId": bob.to_string()
            }
        }),
    )
    .await;

    let event = next_non_presence(&mut ws_alice).await;
    assert_eq!(event["event"], "error");
    assert_eq!(event["data"]["code"], "MALFORMED_ADDRESSING");
    assert_quiet(&mut ws_bob).await;
}

#[tokio::test]
async fn test_reauthenticate_same_user_keeps_session() {
    let (state, addr, _dir) = start_test_server().await;
    let user = UserId::new();
    let mut ws = connect(addr, &valid_token(&state, user)).await;

    send(
        &mut ws,
        json!({ "event": "reauthenticate", "data": { "token": valid_token(&state, user) } }),
    )
    .await;
    send(&mut ws, json!({ "event": "list-pending-requests" })).await;

    let event = next_non_presence(&mut ws).await;
    assert_eq!(event["event"], "pending-requests");
    assert!(state.dispatcher.registry().lookup(user).await.is_some());
}

#[tokio::test]
async fn test_reauthenticate_failures_report_then_close() {
    let (state, addr, _dir) = start_test_server().await;
    let user = UserId::new();

    let cases = [
        ("garbage".to_string(), 4002),
        (valid_token(&state, UserId::new()), 4002),
        (token_for(&state, user, chrono::Duration::seconds(-60)), 4001),
    ];

    for (token, expected) in cases {
        let mut ws = connect(addr, &valid_token(&state, user)).await;
        send(&mut ws, json!({ "event": "reauthenticate", "data": { "token": token } })).await;

        let (events, code) = read_until_close(&mut ws).await;
        assert_eq!(code, Some(expected));
        assert!(events
            .iter()
            .any(|e| e["event"] == "error" && e["data"]["code"] == "INVALID_CREDENTIAL"));
        wait_until_offline(&state).await;
    }
}

#[tokio::test]
async fn test_reauthenticate_error_always_precedes_close() {
    let (state, addr, _dir) = start_test_server().await;

    for _ in 0..40 {
        let user = UserId::new();
        let mut ws = connect(addr, &valid_token(&state, user)).await;
        send(&mut ws, json!({ "event": "reauthenticate", "data": { "token": "garbage" } })).await;

        let (events, code) = read_until_close(&mut ws).await;
        assert_eq!(code, Some(4002));
        let last = events
            .iter()
            .filter(|e| e["event"] != "presence-snapshot")
            .last()
            .expect("No error before close");
        assert_eq!(last["event"], "error");
        assert_eq!(last["data"]["code"], "INVALID_CREDENTIAL");
        wait_until_offline(&state).await;
    }
}
