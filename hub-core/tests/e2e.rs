//! End-to-end scenarios against a real bound hub server, mirroring the six
//! concrete scenarios in the collaboration hub specification.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hub_core::services::AuthenticatedUser;
use hub_core::testing::TestServer;
use hub_core::Role;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite;

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(server: &TestServer, token: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(server.ws_url(token)).await.unwrap();
    ws
}

async fn send_json(ws: &mut WsStream, value: Value) {
    ws.send(tungstenite::Message::Text(value.to_string().into())).await.unwrap();
}

async fn recv_json(ws: &mut WsStream) -> Value {
    let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("timed out waiting for frame")
        .expect("stream ended")
        .unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

fn user(user_id: &str, tenant_id: Option<&str>, role: Role) -> AuthenticatedUser {
    AuthenticatedUser {
        user_id: user_id.to_string(),
        tenant_id: tenant_id.map(str::to_string),
        role,
    }
}

/// Scenario 1: admin and tenant member exchange a chat message.
#[tokio::test]
async fn two_clients_chat_fan_out() {
    let server = TestServer::start(vec![
        ("alice-token", user("alice", Some("T"), Role::Admin)),
        ("bob-token", user("bob", Some("T"), Role::User)),
    ])
    .await;

    let mut a = connect(&server, "alice-token").await;
    let mut b = connect(&server, "bob-token").await;

    send_json(
        &mut a,
        json!({"type": "chat.send", "op_id": "1", "data": {"scope": "tenant:T", "body": "hi"}}),
    )
    .await;

    let ack = recv_json(&mut a).await;
    assert_eq!(ack["type"], "ack");
    assert_eq!(ack["op_id"], "1");
    assert_eq!(ack["data"]["status"], "sent");
    let message_id = ack["data"]["message_id"].clone();

    let a_message = recv_json(&mut a).await;
    assert_eq!(a_message["type"], "chat.message");
    assert_eq!(a_message["data"]["id"], message_id);
    assert_eq!(a_message["data"]["user_id"], "alice");

    let b_message = recv_json(&mut b).await;
    assert_eq!(b_message["type"], "chat.message");
    assert_eq!(b_message["data"]["body"], "hi");
}

/// Scenario 2: joining an unapproved network is forbidden and has no effect.
#[tokio::test]
async fn unapproved_network_join_is_forbidden() {
    let server = TestServer::start(vec![("carol-token", user("carol", None, Role::User))]).await;
    let mut c = connect(&server, "carol-token").await;

    send_json(&mut c, json!({"type": "room.join", "op_id": "1", "data": {"room": "network:N"}})).await;

    let reply = recv_json(&mut c).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"]["code"], "ERR_FORBIDDEN");

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(server.hub.room_clients("network:N").is_empty());
}

/// Scenario 3: a slow consumer is evicted once its send buffer overflows,
/// without stalling the broadcaster.
#[tokio::test]
async fn slow_consumer_is_evicted_on_overflow() {
    let server = TestServer::start(vec![
        ("dora-token", user("dora", None, Role::User)),
        ("erin-token", user("erin", None, Role::User)),
    ])
    .await;

    let mut d = connect(&server, "dora-token").await;
    let _e = connect(&server, "erin-token").await;

    // Join a shared room but never drain Dora's stream afterward.
    send_json(&mut d, json!({"type": "room.join", "op_id": "1", "data": {"room": "tenant:shared"}})).await;
    let _ack = recv_json(&mut d).await;

    tokio::time::sleep(Duration::from_millis(20)).await;
    let before = server.hub.client_count();

    for n in 0..300 {
        server.hub.broadcast(
            Some("tenant:shared".to_string()),
            hub_proto::envelope::Frame::event("chat.message", json!({"n": n})),
            None,
        );
    }

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(server.hub.client_count() < before, "overloaded connection should have been evicted");
}

/// Scenario 4: bursts beyond the token bucket are rejected, connection stays open.
#[tokio::test]
async fn rate_limit_rejects_excess_frames() {
    let server = TestServer::start(vec![("erin-token", user("erin", None, Role::User))]).await;
    let mut ws = connect(&server, "erin-token").await;

    for i in 0..25 {
        send_json(&mut ws, json!({"type": "chat.typing", "data": {"scope": "user:erin", "typing": true}, "op_id": i.to_string()})).await;
    }

    // chat.typing has no ack, so count rate-limit errors only.
    let mut rate_limited = 0;
    loop {
        let Ok(Some(Ok(msg))) = tokio::time::timeout(Duration::from_millis(200), ws.next()).await else {
            break;
        };
        let value: Value = serde_json::from_str(&msg.into_text().unwrap()).unwrap();
        if value["error"]["code"] == "ERR_RATE_LIMIT" {
            rate_limited += 1;
        }
    }
    assert!(rate_limited >= 1, "expected at least one rate-limit rejection");
}

/// Scenario 6: call signaling is point-to-point; offline target errors.
#[tokio::test]
async fn call_offer_point_to_point_and_offline_error() {
    let server = TestServer::start(vec![
        ("frank-token", user("frank", None, Role::User)),
        ("george-token", user("george", None, Role::User)),
    ])
    .await;

    let mut f = connect(&server, "frank-token").await;
    let mut g = connect(&server, "george-token").await;

    send_json(&mut f, json!({"type": "call.offer", "op_id": "1", "data": {"target_id": "george", "sdp": "v=0"}})).await;

    let g_offer = recv_json(&mut g).await;
    assert_eq!(g_offer["type"], "call.offer");
    assert_eq!(g_offer["data"]["from_user"], "frank");

    let f_ack = recv_json(&mut f).await;
    assert_eq!(f_ack["type"], "ack");

    send_json(&mut f, json!({"type": "call.offer", "op_id": "2", "data": {"target_id": "nobody"}})).await;
    let f_err = recv_json(&mut f).await;
    assert_eq!(f_err["type"], "error");
    assert_eq!(f_err["error"]["code"], "ERR_TARGET_OFFLINE");
}

/// DM room names are order-insensitive.
#[tokio::test]
async fn dm_room_join_is_canonicalized() {
    let server = TestServer::start(vec![
        ("henry-token", user("henry", None, Role::User)),
        ("iris-token", user("iris", None, Role::User)),
    ])
    .await;

    let mut h = connect(&server, "henry-token").await;
    send_json(&mut h, json!({"type": "room.join", "op_id": "1", "data": {"room": "dm:iris"}})).await;
    let ack = recv_json(&mut h).await;
    assert_eq!(ack["data"]["room"], "dm:henry:iris");
}

/// Frames broadcast back-to-back, faster than the write pump can drain and
/// send them one at a time, are still delivered in full and in order even
/// though the write pump batches its queued sends into one flush per drain.
#[tokio::test]
async fn rapid_broadcasts_are_delivered_in_order() {
    let server = TestServer::start(vec![("kay-token", user("kay", None, Role::User))]).await;
    let mut ws = connect(&server, "kay-token").await;

    send_json(&mut ws, json!({"type": "room.join", "op_id": "1", "data": {"room": "tenant:shared"}})).await;
    let _ack = recv_json(&mut ws).await;

    for n in 0..20 {
        server.hub.broadcast(
            Some("tenant:shared".to_string()),
            hub_proto::envelope::Frame::event("chat.message", json!({"n": n})),
            None,
        );
    }

    for n in 0..20 {
        let value = recv_json(&mut ws).await;
        assert_eq!(value["type"], "chat.message");
        assert_eq!(value["data"]["n"], n);
    }
}

/// Unknown types are rejected without touching dispatch logic.
#[tokio::test]
async fn unknown_type_produces_error_reply() {
    let server = TestServer::start(vec![("jack-token", user("jack", None, Role::User))]).await;
    let mut ws = connect(&server, "jack-token").await;

    send_json(&mut ws, json!({"type": "not.a.type", "op_id": "1"})).await;
    let reply = recv_json(&mut ws).await;
    assert_eq!(reply["type"], "error");
    assert_eq!(reply["error"]["code"], "ERR_UNKNOWN_TYPE");
}

/// Unauthenticated upgrade attempts are rejected with HTTP 401.
#[tokio::test]
async fn unauthenticated_upgrade_is_rejected() {
    let server = TestServer::start(vec![]).await;
    let url = format!("ws://{}/v1/ws", server.addr);
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_err());
}
