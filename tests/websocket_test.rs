// End-to-end tests: the warp routes bound on an ephemeral port, driven with
// a real WebSocket client and HTTP client

use futures_util::{SinkExt, StreamExt};
use pulse_live::auth::StaticIdentityVerifier;
use pulse_live::config::ServerConfig;
use pulse_live::core::collectible::Tier;
use pulse_live::core::position::Coordinates;
use pulse_live::core::ServerState;
use pulse_live::handlers::routes;
use pulse_live::storage::{MemoryStorage, RoomStorage, StorageProvider, StoredRoom};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    state: ServerState,
    store: Arc<MemoryStorage>,
}

fn start_server(allow_anonymous: bool) -> TestServer {
    let mut config = ServerConfig::for_testing();
    config.allow_anonymous = allow_anonymous;

    let mut tokens = HashMap::new();
    tokens.insert("tok-alice".to_string(), "alice".to_string());

    let store = Arc::new(MemoryStorage::new());
    let storage: Arc<dyn StorageProvider> = store.clone();
    let state = ServerState::new(config, storage, Arc::new(StaticIdentityVerifier::new(tokens)));

    let (addr, server) = warp::serve(routes(state.clone())).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    TestServer { addr, state, store }
}

async fn connect(server: &TestServer, path: &str) -> Client {
    let url = format!("ws://{}/ws/{}", server.addr, path);
    let (ws, _) = connect_async(url).await.expect("handshake failed");
    ws
}

/// Read frames until one of the given type arrives
async fn next_of_type(ws: &mut Client, kind: &str) -> Value {
    let deadline = Duration::from_secs(5);
    loop {
        let frame = tokio::time::timeout(deadline, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("websocket error");
        if let Message::Text(text) = frame {
            let value: Value = serde_json::from_str(&text).unwrap();
            if value["type"] == kind {
                return value;
            }
        }
    }
}

async fn send(ws: &mut Client, value: Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

async fn handshake_status(server: &TestServer, path: &str) -> Option<u16> {
    let url = format!("ws://{}/ws/{}", server.addr, path);
    match connect_async(url).await {
        Ok(_) => None,
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => Some(response.status().as_u16()),
        Err(e) => panic!("unexpected handshake error: {}", e),
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let server = start_server(true);
    let body: Value = reqwest::get(format!("http://{}/health", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["registry"]["connections"], 0);
}

#[tokio::test]
async fn test_room_chat_and_claim_flow() {
    let server = start_server(true);
    server
        .store
        .upsert_room(StoredRoom::public(
            "r1",
            "Plaza",
            "host",
            Coordinates::new(-74.08, 4.6).unwrap(),
        ))
        .await
        .unwrap();

    let mut alice = connect(&server, "alice?token=tok-alice").await;
    let hello = next_of_type(&mut alice, "connected").await;
    assert_eq!(hello["session_key"], "alice");
    assert_eq!(hello["authenticated"], true);

    let mut bob = connect(&server, "bob").await;
    let hello = next_of_type(&mut bob, "connected").await;
    assert_eq!(hello["authenticated"], false);

    send(&mut alice, json!({"type": "join_event", "event_id": "r1"})).await;
    next_of_type(&mut alice, "user_joined").await;
    send(&mut bob, json!({"type": "join_event", "event_id": "r1"})).await;
    let joined = next_of_type(&mut alice, "user_joined").await;
    assert_eq!(joined["user_id"], "bob");

    send(&mut alice, json!({"type": "chat_message", "event_id": "r1", "message": "hola"})).await;
    let chat = next_of_type(&mut bob, "chat_message").await;
    assert_eq!(chat["user_id"], "alice");
    assert_eq!(chat["message"], "hola");

    let collectible = server
        .state
        .engine
        .create("r1", Tier::Legendary, Coordinates::new(-74.08, 4.6).unwrap())
        .await
        .unwrap();

    send(&mut alice, json!({"type": "claim_collectible", "collectible_id": collectible.id})).await;
    let result = next_of_type(&mut alice, "claim_result").await;
    assert_eq!(result["result"]["success"], true);
    let announced = next_of_type(&mut bob, "collectible_claimed").await;
    assert_eq!(announced["winner_id"], "alice");

    // the HTTP claim endpoint goes through the same atomic path
    let http = reqwest::Client::new();
    let report: Value = http
        .post(format!("http://{}/api/collectibles/claim", server.addr))
        .json(&json!({"collectible_id": collectible.id, "user_id": "bob"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(report["success"], false);
    assert_eq!(report["claimed_by"], "alice");

    let inventory: Value = reqwest::get(format!("http://{}/api/users/alice/collectibles", server.addr))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(inventory["count"], 1);

    // bob leaves; alice sees the presence notice
    bob.close(None).await.unwrap();
    let gone = next_of_type(&mut alice, "user_disconnected").await;
    assert_eq!(gone["user_id"], "bob");
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let server = start_server(true);
    let mut ws = connect(&server, "carol").await;
    next_of_type(&mut ws, "connected").await;

    ws.send(Message::Text("{not json".to_string())).await.unwrap();
    let error = next_of_type(&mut ws, "error").await;
    assert_eq!(error["code"], "invalid_message");

    send(&mut ws, json!({"type": "location_update", "coordinates": [-74.08, 4.6]})).await;
    let nearby = next_of_type(&mut ws, "nearby_users").await;
    assert_eq!(nearby["users"].as_array().unwrap().len(), 0);
}

#[tokio::test]
async fn test_failed_handshakes_get_blocked() {
    let server = start_server(false);

    assert_eq!(handshake_status(&server, "mallory").await, Some(401));
    for _ in 0..3 {
        assert_eq!(handshake_status(&server, "mallory?token=guess").await, Some(401));
    }
    // fifth failure trips the block, later attempts are refused outright
    assert_eq!(handshake_status(&server, "mallory?token=guess").await, Some(429));
    assert_eq!(handshake_status(&server, "alice?token=tok-alice").await, Some(429));
}

#[tokio::test]
async fn test_anonymous_handshake_cannot_take_authenticated_key() {
    let server = start_server(true);
    let mut alice = connect(&server, "alice?token=tok-alice").await;
    next_of_type(&mut alice, "connected").await;

    assert_eq!(handshake_status(&server, "alice").await, Some(409));

    let live = server.state.registry.session("alice").await.unwrap();
    assert!(live.authenticated);

    // the authenticated session is still served
    send(&mut alice, json!({"type": "location_update", "coordinates": [-74.08, 4.6]})).await;
    next_of_type(&mut alice, "nearby_users").await;
}

#[tokio::test]
async fn test_repeated_http_joins_count_once() {
    let server = start_server(true);
    server
        .store
        .upsert_room(StoredRoom::public(
            "r1",
            "Plaza",
            "host",
            Coordinates::new(-74.08, 4.6).unwrap(),
        ))
        .await
        .unwrap();

    let http = reqwest::Client::new();
    let url = format!("http://{}/api/events/r1/join", server.addr);
    for expected in [true, false, false] {
        let body: Value = http
            .post(&url)
            .json(&json!({"user_id": "dana"}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["live"], false);
        assert_eq!(body["newly_joined"], expected);
    }

    let left: Value = http
        .post(format!("http://{}/api/events/r1/leave", server.addr))
        .json(&json!({"user_id": "erin"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(left["success"], true);

    let room = server.store.get_room("r1").await.unwrap().unwrap();
    assert_eq!(room.current_participants, 1);
    assert_eq!(room.participants, vec!["dana".to_string()]);
}
