//! Per-message-type handling: authorization, domain service calls, and
//! broadcast emission.
//!
//! The hub hands every inbound frame to [`Dispatcher::dispatch`] on its own
//! ephemeral task (§5: "handler tasks are ephemeral"). A dispatch task may
//! call into domain services (which may block on I/O) but must never hold
//! the hub's internal lock while doing so — it only ever talks to the hub
//! through [`Hub`]'s mailbox and query methods, both of which release their
//! lock before returning.

use std::sync::Arc;

use hub_proto::envelope::{self, CodecError, InboundMessage};
use hub_proto::error_code::ErrorCode;
use hub_proto::presence::PresenceStatus;
use hub_proto::room::{self, RoomRef};
use serde_json::json;

use crate::connection::Role;
use crate::hub::{ClientSnapshot, ConnectionId, Hub};
use crate::services::{AuthService, ChatError, ChatService, DeviceService, MembershipService};

/// Holds the domain service seams the dispatcher calls into. Constructed
/// once at startup and shared (via `Arc`) across every dispatch task.
pub struct Dispatcher {
    auth: Arc<dyn AuthService>,
    membership: Arc<dyn MembershipService>,
    chat: Arc<dyn ChatService>,
    device: Arc<dyn DeviceService>,
}

impl Dispatcher {
    #[must_use]
    pub fn new(
        auth: Arc<dyn AuthService>,
        membership: Arc<dyn MembershipService>,
        chat: Arc<dyn ChatService>,
        device: Arc<dyn DeviceService>,
    ) -> Self {
        Self { auth, membership, chat, device }
    }

    /// Handles one inbound frame for connection `id`. Never panics across
    /// the task boundary that spawned it: any handler error is converted to
    /// an `ERR_HANDLER_FAILED` reply to the sender rather than propagated
    /// (a panic inside a service call is caught at the `tokio::spawn` call
    /// site in `hub::run_mutator`'s join, not here).
    pub async fn dispatch(&self, id: ConnectionId, frame: hub_proto::envelope::Frame, hub: Hub) {
        let op_id = frame.op_id.clone();

        let Some(snapshot) = hub.client_snapshot(id) else {
            // Connection vanished between enqueue and dispatch; nothing to
            // reply to.
            return;
        };

        let message = match envelope::decode_inbound(&frame) {
            Ok(message) => message,
            Err(CodecError::UnknownType(type_name)) => {
                hub.reply_direct(
                    id,
                    hub_proto::envelope::Frame::error(
                        op_id,
                        ErrorCode::UnknownType,
                        format!("unrecognized message type: {type_name}"),
                    ),
                );
                return;
            }
            Err(err) => {
                hub.reply_direct(
                    id,
                    hub_proto::envelope::Frame::error(op_id, ErrorCode::InvalidMessage, err.to_string()),
                );
                return;
            }
        };

        self.handle(id, op_id, message, &snapshot, &hub).await;
    }

    #[allow(clippy::too_many_lines)]
    async fn handle(
        &self,
        id: ConnectionId,
        op_id: Option<String>,
        message: InboundMessage,
        snapshot: &ClientSnapshot,
        hub: &Hub,
    ) {
        match message {
            InboundMessage::AuthRefresh { token } => match self.auth.refresh(&token).await {
                Ok(refreshed) if refreshed.user_id == snapshot.user_id => {
                    hub.reply_direct(id, ack(op_id, None));
                }
                Ok(_) => {
                    // Identity is immutable over a live connection (§4.4
                    // decision): a refresh that resolves to a different
                    // user is rejected, not silently adopted.
                    hub.reply_direct(id, error(op_id, ErrorCode::Unauthorized, "refresh identity mismatch"));
                }
                Err(_) => hub.reply_direct(id, error(op_id, ErrorCode::Unauthorized, "refresh rejected")),
            },

            InboundMessage::RoomJoin { room: requested } => {
                self.handle_room_join(id, op_id, &requested, snapshot, hub).await;
            }

            InboundMessage::RoomLeave { room } => {
                hub.leave_room(id, room);
                hub.reply_direct(id, ack(op_id, None));
            }

            InboundMessage::ChatSend { scope, body, .. } => {
                if scope.is_empty() || body.is_empty() {
                    hub.reply_direct(id, error(op_id, ErrorCode::InvalidMessage, "scope and body are required"));
                    return;
                }
                match self.chat.send(&snapshot.user_id, &scope, &body).await {
                    Ok(stored) => {
                        let target = dm_aware_target(&scope, &snapshot.user_id);
                        hub.broadcast(
                            Some(target),
                            hub_proto::envelope::Frame::event(
                                "chat.message",
                                json!({
                                    "id": stored.message_id,
                                    "scope": stored.scope,
                                    "user_id": stored.user_id,
                                    "body": stored.body,
                                }),
                            ),
                            None,
                        );
                        hub.reply_direct(id, ack(op_id, Some(json!({"status": "sent", "message_id": stored.message_id}))));
                    }
                    Err(err) => self.reply_chat_error(hub, id, op_id, err),
                }
            }

            InboundMessage::ChatEdit { message_id, new_body } => {
                match self
                    .chat
                    .edit(&snapshot.user_id, snapshot.role.is_admin(), &message_id, &new_body)
                    .await
                {
                    Ok(scope) => {
                        hub.broadcast(
                            Some(dm_aware_target(&scope, &snapshot.user_id)),
                            hub_proto::envelope::Frame::event(
                                "chat.edited",
                                json!({"message_id": message_id, "new_body": new_body}),
                            ),
                            None,
                        );
                        hub.reply_direct(id, ack(op_id, None));
                    }
                    Err(err) => self.reply_chat_error(hub, id, op_id, err),
                }
            }

            InboundMessage::ChatDelete { message_id, mode } => {
                let hard = matches!(mode, envelope::DeleteMode::Hard);
                match self
                    .chat
                    .delete(
                        &snapshot.user_id,
                        snapshot.role.is_admin(),
                        snapshot.role.is_moderator(),
                        &message_id,
                        hard,
                    )
                    .await
                {
                    Ok(scope) => {
                        hub.broadcast(
                            Some(dm_aware_target(&scope, &snapshot.user_id)),
                            hub_proto::envelope::Frame::event(
                                "chat.deleted",
                                json!({"message_id": message_id, "mode": if hard { "hard" } else { "soft" }}),
                            ),
                            None,
                        );
                        hub.reply_direct(id, ack(op_id, None));
                    }
                    Err(err) => self.reply_chat_error(hub, id, op_id, err),
                }
            }

            InboundMessage::ChatRedact { message_id, mask } => {
                match self
                    .chat
                    .redact(snapshot.role.is_moderator(), snapshot.role.is_admin(), &message_id, &mask)
                    .await
                {
                    Ok(scope) => {
                        hub.broadcast(
                            Some(dm_aware_target(&scope, &snapshot.user_id)),
                            hub_proto::envelope::Frame::event("chat.redacted", json!({"message_id": message_id})),
                            None,
                        );
                        hub.reply_direct(id, ack(op_id, None));
                    }
                    Err(err) => self.reply_chat_error(hub, id, op_id, err),
                }
            }

            InboundMessage::ChatTyping { scope, typing } => {
                hub.broadcast(
                    Some(dm_aware_target(&scope, &snapshot.user_id)),
                    hub_proto::envelope::Frame::event(
                        "chat.typing.user",
                        json!({"user_id": snapshot.user_id, "scope": scope, "typing": typing}),
                    ),
                    Some(id),
                );
            }

            InboundMessage::ChatRead { room, message_id } => {
                hub.broadcast(
                    Some(room.clone()),
                    hub_proto::envelope::Frame::event(
                        "chat.read.update",
                        json!({"user_id": snapshot.user_id, "room": room, "message_id": message_id}),
                    ),
                    None,
                );
            }

            InboundMessage::ChatReaction { message_id, scope, reaction, action } => {
                hub.broadcast(
                    Some(dm_aware_target(&scope, &snapshot.user_id)),
                    hub_proto::envelope::Frame::event(
                        "chat.reaction.update",
                        json!({
                            "user_id": snapshot.user_id,
                            "message_id": message_id,
                            "reaction": reaction,
                            "action": action,
                        }),
                    ),
                    None,
                );
            }

            InboundMessage::PresencePing => {
                self.device.record_heartbeat(&snapshot.user_id).await;
                let now = now_unix();
                hub.reply_direct(
                    id,
                    hub_proto::envelope::Frame::event("presence.pong", json!({"timestamp": now})),
                );
            }

            InboundMessage::PresenceSet { status } => {
                hub.set_presence(id, status);
                for room in &snapshot.rooms {
                    hub.broadcast(
                        Some(room.clone()),
                        hub_proto::envelope::Frame::event(
                            "presence.update",
                            json!({"user_id": snapshot.user_id, "status": status_str(status), "since": now_unix()}),
                        ),
                        None,
                    );
                }
            }

            InboundMessage::CallOffer { target_id, call_type, sdp } => {
                self.forward_call(hub, id, op_id, &target_id, "call.offer", json!({
                    "from_user": snapshot.user_id,
                    "call_type": call_type,
                    "sdp": sdp,
                }));
            }
            InboundMessage::CallAnswer { target_id, sdp } => {
                self.forward_call(hub, id, op_id, &target_id, "call.answer", json!({
                    "from_user": snapshot.user_id,
                    "sdp": sdp,
                }));
            }
            InboundMessage::CallIce { target_id, candidate } => {
                self.forward_call(hub, id, op_id, &target_id, "call.ice", json!({
                    "from_user": snapshot.user_id,
                    "candidate": candidate,
                }));
            }
            InboundMessage::CallEnd { target_id, reason } => {
                self.forward_call(hub, id, op_id, &target_id, "call.end", json!({
                    "from_user": snapshot.user_id,
                    "reason": reason,
                }));
            }
        }
    }

    async fn handle_room_join(
        &self,
        id: ConnectionId,
        op_id: Option<String>,
        requested: &str,
        snapshot: &ClientSnapshot,
        hub: &Hub,
    ) {
        let canonical = match room::parse(requested) {
            RoomRef::Host => {
                if !snapshot.role.is_admin() {
                    hub.reply_direct(id, error(op_id, ErrorCode::Forbidden, "host room requires admin"));
                    return;
                }
                room::host()
            }
            RoomRef::Tenant(tenant_id) => {
                if snapshot.tenant_id.as_deref() != Some(tenant_id) {
                    hub.reply_direct(id, error(op_id, ErrorCode::Forbidden, "not a member of this tenant"));
                    return;
                }
                room::tenant(tenant_id)
            }
            RoomRef::Network(network_id) => {
                if !self.membership.is_approved_member(&snapshot.user_id, network_id).await {
                    hub.reply_direct(id, error(op_id, ErrorCode::Forbidden, "not an approved network member"));
                    return;
                }
                room::network(network_id)
            }
            RoomRef::User(_) | RoomRef::Other(_) => requested.to_string(),
            RoomRef::Dm(a, b) => {
                if snapshot.user_id != a && snapshot.user_id != b {
                    hub.reply_direct(id, error(op_id, ErrorCode::Forbidden, "not a participant in this dm"));
                    return;
                }
                room::canonical_dm(a, b)
            }
            RoomRef::DmTarget(target) => room::canonical_dm(&snapshot.user_id, target),
        };

        hub.join_room(id, canonical.clone());
        hub.reply_direct(id, ack(op_id, Some(json!({"room": canonical}))));
    }

    fn forward_call(
        &self,
        hub: &Hub,
        id: ConnectionId,
        op_id: Option<String>,
        target_id: &str,
        event_type: &str,
        mut data: serde_json::Value,
    ) {
        let targets = hub.connections_for_user(target_id);
        if targets.is_empty() {
            hub.reply_direct(id, error(op_id, ErrorCode::TargetOffline, "target is offline"));
            return;
        }
        if let Some(map) = data.as_object_mut() {
            map.retain(|_, v| !v.is_null());
        }
        for target in targets {
            hub.reply_direct(target, hub_proto::envelope::Frame::event(event_type, data.clone()));
        }
        hub.reply_direct(id, ack(op_id, None));
    }

    fn reply_chat_error(&self, hub: &Hub, id: ConnectionId, op_id: Option<String>, err: ChatError) {
        let code = match err {
            ChatError::Forbidden => ErrorCode::Forbidden,
            ChatError::NotFound(_) => ErrorCode::NotFound,
            ChatError::Invalid(_) => ErrorCode::InvalidMessage,
        };
        hub.reply_direct(id, error(op_id, code, err.to_string()));
    }
}

/// Canonicalizes a chat scope that names a DM room before broadcasting. A
/// two-id `dm:a:b` scope is re-sorted (§3: "ids sorted ascending") so
/// `dm:iris:henry` and `dm:henry:iris` always resolve to the same room
/// regardless of which party's client produced the scope string; the
/// single-id `dm:<target>` shorthand is combined with `user_id` the same
/// way `room.join` does it. Any other scope broadcasts as-is.
fn dm_aware_target(scope: &str, user_id: &str) -> String {
    match room::parse(scope) {
        RoomRef::Dm(a, b) => room::canonical_dm(a, b),
        RoomRef::DmTarget(target) => room::canonical_dm(user_id, target),
        _ => scope.to_string(),
    }
}

fn ack(op_id: Option<String>, data: Option<serde_json::Value>) -> hub_proto::envelope::Frame {
    match op_id {
        Some(op_id) => hub_proto::envelope::Frame::ack(op_id, data),
        None => hub_proto::envelope::Frame { r#type: "ack".to_string(), op_id: None, data, error: None },
    }
}

fn error(op_id: Option<String>, code: ErrorCode, message: impl Into<String>) -> hub_proto::envelope::Frame {
    hub_proto::envelope::Frame::error(op_id, code, message)
}

fn status_str(status: PresenceStatus) -> &'static str {
    match status {
        PresenceStatus::Online => "online",
        PresenceStatus::Away => "away",
        PresenceStatus::Busy => "busy",
        PresenceStatus::Offline => "offline",
    }
}

fn now_unix() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::Hub;
    use crate::services::{InMemoryAuthService, InMemoryChatService, InMemoryDeviceService, InMemoryMembershipService};
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn test_dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(InMemoryAuthService::new()),
            Arc::new(InMemoryMembershipService::new()),
            Arc::new(InMemoryChatService::new()),
            Arc::new(InMemoryDeviceService::new()),
        ))
    }

    async fn register_test_connection(
        hub: &Hub,
        user_id: &str,
        tenant_id: Option<&str>,
        role: Role,
        rooms: Vec<String>,
    ) -> (ConnectionId, mpsc::Receiver<axum::extract::ws::Message>) {
        let (tx, rx) = mpsc::channel(crate::hub::SEND_BUFFER_CAPACITY);
        let id = Uuid::new_v4();
        hub.register(id, tx, user_id.to_string(), tenant_id.map(str::to_string), role, rooms);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        (id, rx)
    }

    #[tokio::test]
    async fn joining_network_without_approval_is_forbidden() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (id, mut rx) = register_test_connection(&hub, "carol", None, Role::User, vec![]).await;

        hub.inbound(
            id,
            hub_proto::envelope::Frame {
                r#type: "room.join".to_string(),
                op_id: Some("1".to_string()),
                data: Some(json!({"room": "network:N"})),
                error: None,
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let axum::extract::ws::Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        assert!(text.contains("ERR_FORBIDDEN"));
        assert!(hub.room_clients("network:N").is_empty());
    }

    #[tokio::test]
    async fn chat_send_broadcasts_and_acks() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (a, mut rx_a) = register_test_connection(&hub, "alice", Some("acme"), Role::Admin, vec!["tenant:acme".to_string()]).await;
        let (_b, mut rx_b) = register_test_connection(&hub, "bob", Some("acme"), Role::User, vec!["tenant:acme".to_string()]).await;

        hub.inbound(
            a,
            hub_proto::envelope::Frame {
                r#type: "chat.send".to_string(),
                op_id: Some("1".to_string()),
                data: Some(json!({"scope": "tenant:acme", "body": "hi"})),
                error: None,
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let mut saw_ack = false;
        let mut saw_message = false;
        while let Ok(axum::extract::ws::Message::Text(text)) = rx_a.try_recv() {
            if text.contains("\"ack\"") {
                saw_ack = true;
            }
            if text.contains("chat.message") {
                saw_message = true;
            }
        }
        assert!(saw_ack && saw_message);

        let axum::extract::ws::Message::Text(bob_text) = rx_b.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        assert!(bob_text.contains("chat.message"));
    }

    #[tokio::test]
    async fn joining_two_id_dm_room_requires_being_a_participant() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (mallory, mut rx) = register_test_connection(&hub, "mallory", None, Role::User, vec![]).await;

        hub.inbound(
            mallory,
            hub_proto::envelope::Frame {
                r#type: "room.join".to_string(),
                op_id: Some("1".to_string()),
                data: Some(json!({"room": "dm:henry:iris"})),
                error: None,
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let reply = recv_text(&mut rx).expect("reply expected");
        assert!(reply.contains("ERR_FORBIDDEN"));
        assert!(hub.room_clients("dm:henry:iris").is_empty());
    }

    #[tokio::test]
    async fn joining_own_two_id_dm_room_canonicalizes_and_succeeds() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (henry, mut rx) = register_test_connection(&hub, "henry", None, Role::User, vec![]).await;

        hub.inbound(
            henry,
            hub_proto::envelope::Frame {
                r#type: "room.join".to_string(),
                op_id: Some("1".to_string()),
                data: Some(json!({"room": "dm:iris:henry"})),
                error: None,
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let reply = recv_text(&mut rx).expect("ack expected");
        assert!(reply.contains("\"room\":\"dm:henry:iris\""));
        assert!(hub.room_clients("dm:henry:iris").contains(&henry));
    }

    #[tokio::test]
    async fn chat_send_canonicalizes_reversed_dm_scope() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (_henry, mut rx_henry) =
            register_test_connection(&hub, "henry", None, Role::User, vec!["dm:henry:iris".to_string()]).await;
        let (iris, mut rx_iris) =
            register_test_connection(&hub, "iris", None, Role::User, vec!["dm:henry:iris".to_string()]).await;

        // Iris sends with the scope reversed relative to the canonical join
        // room; the broadcast target must still resolve to the same room.
        hub.inbound(
            iris,
            hub_proto::envelope::Frame {
                r#type: "chat.send".to_string(),
                op_id: Some("1".to_string()),
                data: Some(json!({"scope": "dm:iris:henry", "body": "hey"})),
                error: None,
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let henry_message = recv_text(&mut rx_henry).expect("henry should receive the DM");
        assert!(henry_message.contains("chat.message"));

        let mut saw_ack = false;
        while let Some(text) = recv_text(&mut rx_iris) {
            if text.contains("\"ack\"") {
                saw_ack = true;
            }
        }
        assert!(saw_ack);
    }

    fn recv_text(rx: &mut mpsc::Receiver<axum::extract::ws::Message>) -> Option<String> {
        match rx.try_recv().ok()? {
            axum::extract::ws::Message::Text(text) => Some(text.to_string()),
            _ => None,
        }
    }

    #[tokio::test]
    async fn call_offer_to_offline_target_errors() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (id, mut rx) = register_test_connection(&hub, "frank", None, Role::User, vec![]).await;

        hub.inbound(
            id,
            hub_proto::envelope::Frame {
                r#type: "call.offer".to_string(),
                op_id: Some("1".to_string()),
                data: Some(json!({"target_id": "george"})),
                error: None,
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let axum::extract::ws::Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        assert!(text.contains("ERR_TARGET_OFFLINE"));
    }
}
