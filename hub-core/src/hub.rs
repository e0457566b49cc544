//! The hub: registry of connections and rooms, and the single mutator task
//! that serializes every mutation against them.
//!
//! `register`, `unregister`, room join/leave, and broadcast all arrive as
//! [`HubCommand`]s on one unbounded channel, so the mutator processes them
//! in a single total order — this is what gives the hub its linearizability
//! guarantee between registration and broadcast (§5 of the design notes).
//! Queries (`room_clients`, `room_count`, `client_count`) bypass the mailbox
//! entirely and read the shared state under its lock directly, since they
//! need no ordering relative to other queries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use axum::extract::ws::Message;
use hub_proto::envelope::Frame;
use hub_proto::error_code::ErrorCode;
use hub_proto::presence::PresenceStatus;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::connection::Role;
use crate::dispatcher::Dispatcher;

/// Identifies one live connection for the lifetime of its socket.
pub type ConnectionId = Uuid;

/// Per-connection bookkeeping the hub needs to mutate or fan out to.
pub struct ClientEntry {
    pub sender: mpsc::Sender<Message>,
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub role: Role,
    pub presence: PresenceStatus,
    pub rooms: HashSet<String>,
}

/// Everything the mutator owns. Shared behind an `Arc<RwLock<_>>` so query
/// methods can read-lock without routing through the mailbox.
#[derive(Default)]
pub struct HubState {
    pub clients: HashMap<ConnectionId, ClientEntry>,
    pub rooms: HashMap<String, HashSet<ConnectionId>>,
}

/// Bounded send-buffer capacity per connection (§3: "capacity 256").
pub const SEND_BUFFER_CAPACITY: usize = 256;

struct RegisterMsg {
    id: ConnectionId,
    sender: mpsc::Sender<Message>,
    user_id: String,
    tenant_id: Option<String>,
    role: Role,
    initial_rooms: Vec<String>,
}

struct BroadcastRequest {
    room: Option<String>,
    frame: Frame,
    exclude: Option<ConnectionId>,
}

enum HubCommand {
    Register(RegisterMsg),
    Unregister(ConnectionId),
    JoinRoom { id: ConnectionId, room: String },
    LeaveRoom { id: ConnectionId, room: String },
    Broadcast(BroadcastRequest),
    SetPresence { id: ConnectionId, status: PresenceStatus },
    Inbound { id: ConnectionId, frame: Frame },
    Direct { id: ConnectionId, frame: Frame },
}

/// Handle to the hub's mailbox plus its shared read-only state.
///
/// Cloning a `Hub` is cheap (it's a channel sender and an `Arc`); every
/// connection task and every dispatcher task holds one.
#[derive(Clone)]
pub struct Hub {
    commands: mpsc::UnboundedSender<HubCommand>,
    state: Arc<RwLock<HubState>>,
}

impl Hub {
    /// Spawns the mutator task and returns a handle plus its join handle.
    ///
    /// `dispatcher` is invoked, on a fresh task per frame, for every inbound
    /// message — the hub never runs dispatch logic on the mutator itself.
    #[must_use]
    pub fn spawn(dispatcher: Arc<Dispatcher>) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = Arc::new(RwLock::new(HubState::default()));
        let hub = Self { commands: tx, state: Arc::clone(&state) };
        let mutator_hub = hub.clone();
        let handle = tokio::spawn(run_mutator(rx, state, dispatcher, mutator_hub));
        (hub, handle)
    }

    /// Registers a new connection and auto-joins it to `initial_rooms`.
    pub fn register(
        &self,
        id: ConnectionId,
        sender: mpsc::Sender<Message>,
        user_id: String,
        tenant_id: Option<String>,
        role: Role,
        initial_rooms: Vec<String>,
    ) {
        let _ = self.commands.send(HubCommand::Register(RegisterMsg {
            id,
            sender,
            user_id,
            tenant_id,
            role,
            initial_rooms,
        }));
    }

    /// Requests teardown of a connection. Idempotent: unregistering an id
    /// that is already gone (or never existed) is a no-op.
    pub fn unregister(&self, id: ConnectionId) {
        let _ = self.commands.send(HubCommand::Unregister(id));
    }

    pub fn join_room(&self, id: ConnectionId, room: impl Into<String>) {
        let _ = self.commands.send(HubCommand::JoinRoom { id, room: room.into() });
    }

    pub fn leave_room(&self, id: ConnectionId, room: impl Into<String>) {
        let _ = self.commands.send(HubCommand::LeaveRoom { id, room: room.into() });
    }

    pub fn set_presence(&self, id: ConnectionId, status: PresenceStatus) {
        let _ = self.commands.send(HubCommand::SetPresence { id, status });
    }

    /// Broadcasts `frame` to `room` (or every connection if `room` is
    /// `None`), skipping `exclude` if present. Non-blocking per connection:
    /// a full send buffer schedules that connection for unregister rather
    /// than stalling the broadcast.
    pub fn broadcast(&self, room: Option<String>, frame: Frame, exclude: Option<ConnectionId>) {
        let _ = self
            .commands
            .send(HubCommand::Broadcast(BroadcastRequest { room, frame, exclude }));
    }

    /// Hands an inbound frame to the mutator, which will spawn a dispatcher
    /// task for it. Used by the connection's read pump.
    pub fn inbound(&self, id: ConnectionId, frame: Frame) {
        let _ = self.commands.send(HubCommand::Inbound { id, frame });
    }

    /// Sends `frame` to exactly one connection, bypassing rooms entirely.
    /// Used for acks/errors replying to a request, and for `call.*`
    /// point-to-point signaling (§4.4: "never broadcast; point-to-point
    /// only").
    pub fn reply_direct(&self, id: ConnectionId, frame: Frame) {
        let _ = self.commands.send(HubCommand::Direct { id, frame });
    }

    /// Snapshot of every connection id currently in `room`.
    #[must_use]
    pub fn room_clients(&self, room: &str) -> Vec<ConnectionId> {
        self.state
            .read()
            .rooms
            .get(room)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn room_count(&self) -> usize {
        self.state.read().rooms.len()
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.state.read().clients.len()
    }

    /// Snapshot of a connection's identity, used by the dispatcher to
    /// authorize a frame without holding the hub lock across a service call.
    #[must_use]
    pub fn client_snapshot(&self, id: ConnectionId) -> Option<ClientSnapshot> {
        let state = self.state.read();
        let entry = state.clients.get(&id)?;
        Some(ClientSnapshot {
            user_id: entry.user_id.clone(),
            tenant_id: entry.tenant_id.clone(),
            role: entry.role,
            rooms: entry.rooms.clone(),
        })
    }

    /// Looks up every connection belonging to `user_id`, for directed
    /// delivery (`call.*` signaling, `user:<uid>` room membership lookups).
    #[must_use]
    pub fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        self.state
            .read()
            .clients
            .iter()
            .filter(|(_, entry)| entry.user_id == user_id)
            .map(|(id, _)| *id)
            .collect()
    }
}

/// A read-only copy of a connection's identity and current room set, safe
/// to hold across an `.await` since it holds no lock.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub role: Role,
    pub rooms: HashSet<String>,
}

async fn run_mutator(
    mut rx: mpsc::UnboundedReceiver<HubCommand>,
    state: Arc<RwLock<HubState>>,
    dispatcher: Arc<Dispatcher>,
    hub: Hub,
) {
    while let Some(command) = rx.recv().await {
        match command {
            HubCommand::Register(msg) => {
                let mut state = state.write();
                for room in &msg.initial_rooms {
                    state.rooms.entry(room.clone()).or_default().insert(msg.id);
                }
                state.clients.insert(
                    msg.id,
                    ClientEntry {
                        sender: msg.sender,
                        user_id: msg.user_id,
                        tenant_id: msg.tenant_id,
                        role: msg.role,
                        presence: PresenceStatus::Online,
                        rooms: msg.initial_rooms.into_iter().collect(),
                    },
                );
            }
            HubCommand::Unregister(id) => {
                let (user_id, departed_rooms) = {
                    let mut state = state.write();
                    unregister_locked(&mut state, id)
                };
                if let Some(user_id) = user_id {
                    for room in departed_rooms {
                        let still_occupied = state.read().rooms.contains_key(&room);
                        if still_occupied {
                            publish_presence_offline(&hub, &room, &user_id);
                        }
                    }
                }
            }
            HubCommand::JoinRoom { id, room } => {
                let mut state = state.write();
                if state.clients.contains_key(&id) {
                    state.rooms.entry(room.clone()).or_default().insert(id);
                    if let Some(entry) = state.clients.get_mut(&id) {
                        entry.rooms.insert(room);
                    }
                }
            }
            HubCommand::LeaveRoom { id, room } => {
                let mut state = state.write();
                remove_from_room(&mut state, id, &room);
            }
            HubCommand::SetPresence { id, status } => {
                let mut state = state.write();
                if let Some(entry) = state.clients.get_mut(&id) {
                    entry.presence = status;
                }
            }
            HubCommand::Broadcast(request) => {
                let mut to_evict = Vec::new();
                {
                    let state = state.read();
                    let targets: Vec<ConnectionId> = match &request.room {
                        Some(room) => state
                            .rooms
                            .get(room)
                            .map(|members| members.iter().copied().collect())
                            .unwrap_or_default(),
                        None => state.clients.keys().copied().collect(),
                    };
                    let Ok(text) = hub_proto::envelope::encode(&request.frame) else {
                        continue;
                    };
                    for target in targets {
                        if Some(target) == request.exclude {
                            continue;
                        }
                        let Some(entry) = state.clients.get(&target) else {
                            continue;
                        };
                        if entry.sender.try_send(Message::Text(text.clone().into())).is_err() {
                            to_evict.push(target);
                        }
                    }
                }
                for id in to_evict {
                    tracing::debug!(connection = %id, "send buffer full, scheduling eviction");
                    let (user_id, departed_rooms) = {
                        let mut state = state.write();
                        unregister_locked(&mut state, id)
                    };
                    if let Some(user_id) = user_id {
                        for room in departed_rooms {
                            let still_occupied = state.read().rooms.contains_key(&room);
                            if still_occupied {
                                publish_presence_offline(&hub, &room, &user_id);
                            }
                        }
                    }
                }
            }
            HubCommand::Inbound { id, frame } => {
                spawn_dispatch(Arc::clone(&dispatcher), hub.clone(), id, frame);
            }
            HubCommand::Direct { id, frame } => {
                let state = state.read();
                if let Some(entry) = state.clients.get(&id)
                    && let Ok(text) = hub_proto::envelope::encode(&frame)
                {
                    let _ = entry.sender.try_send(Message::Text(text.into()));
                }
            }
        }
    }

    // Channel closed: cancellation. Close every send buffer so write pumps
    // observe it and emit a close frame.
    let mut state = state.write();
    state.clients.clear();
    state.rooms.clear();
}

/// Removes a connection from the registry and every room it was in.
/// Returns the departing connection's `user_id` (so the caller can publish
/// its offline-presence event without re-reading the now-removed entry)
/// together with the set of rooms it departed from.
fn unregister_locked(state: &mut HubState, id: ConnectionId) -> (Option<String>, Vec<String>) {
    let Some(entry) = state.clients.remove(&id) else {
        return (None, Vec::new());
    };
    let rooms: Vec<String> = entry.rooms.into_iter().collect();
    for room in &rooms {
        if let Some(members) = state.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                state.rooms.remove(room);
            }
        }
    }
    (Some(entry.user_id), rooms)
}

fn remove_from_room(state: &mut HubState, id: ConnectionId, room: &str) {
    if let Some(members) = state.rooms.get_mut(room) {
        members.remove(&id);
        if members.is_empty() {
            state.rooms.remove(room);
        }
    }
    if let Some(entry) = state.clients.get_mut(&id) {
        entry.rooms.remove(room);
    }
}

/// Spawns the ephemeral per-frame dispatch task (§4.3, §5: "handler tasks
/// are ephemeral... must never hold hub locks across service calls").
///
/// The dispatch itself runs on an inner `tokio::spawn` so its `JoinHandle`
/// can be awaited without blocking the mutator: a panic inside
/// `Dispatcher::dispatch` surfaces as an `Err` on that handle rather than
/// propagating, and is converted to an `ERR_HANDLER_FAILED` reply to the
/// originating connection (§4.3, §7), instead of being silently dropped by
/// a detached spawn.
fn spawn_dispatch(dispatcher: Arc<Dispatcher>, hub: Hub, id: ConnectionId, frame: Frame) {
    let op_id = frame.op_id.clone();
    let reply_hub = hub.clone();
    tokio::spawn(async move {
        let handle = tokio::spawn(async move {
            dispatcher.dispatch(id, frame, hub).await;
        });
        if let Err(join_err) = handle.await {
            tracing::error!(connection = %id, error = %join_err, "dispatch task panicked");
            reply_hub.reply_direct(
                id,
                Frame::error(op_id, ErrorCode::HandlerFailed, "handler failed"),
            );
        }
    });
}

/// Broadcasts `presence.update{status:offline}` to a room a connection just
/// left, dispatched outside the mutator's own write-lock section to avoid
/// self-deadlock (the broadcast command re-enters the mailbox). `user_id` is
/// the departing connection's identity, captured by `unregister_locked`
/// before its entry was removed from the registry.
fn publish_presence_offline(hub: &Hub, room: &str, user_id: &str) {
    let hub = hub.clone();
    let room = room.to_string();
    let user_id = user_id.to_string();
    tokio::spawn(async move {
        let data = serde_json::json!({
            "user_id": user_id,
            "room": room,
            "status": "offline",
        });
        hub.broadcast(Some(room.clone()), Frame::event("presence.update", data), None);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{InMemoryAuthService, InMemoryChatService, InMemoryDeviceService, InMemoryMembershipService};

    fn test_dispatcher() -> Arc<Dispatcher> {
        Arc::new(Dispatcher::new(
            Arc::new(InMemoryAuthService::new()),
            Arc::new(InMemoryMembershipService::new()),
            Arc::new(InMemoryChatService::new()),
            Arc::new(InMemoryDeviceService::new()),
        ))
    }

    #[tokio::test]
    async fn register_adds_to_initial_rooms() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (tx, _rx) = mpsc::channel(SEND_BUFFER_CAPACITY);
        let id = Uuid::new_v4();
        hub.register(id, tx, "alice".into(), Some("acme".into()), Role::User, vec!["host".into()]);
        // Give the mutator a tick to process.
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(hub.client_count(), 1);
        assert!(hub.room_clients("host").contains(&id));
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_drains_rooms() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (tx, _rx) = mpsc::channel(SEND_BUFFER_CAPACITY);
        let id = Uuid::new_v4();
        hub.register(id, tx, "alice".into(), None, Role::User, vec!["host".into()]);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        hub.unregister(id);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(hub.client_count(), 0);
        assert!(hub.room_clients("host").is_empty());

        // Unregistering again must not panic or resurrect state.
        hub.unregister(id);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_connection() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (tx_a, mut rx_a) = mpsc::channel(SEND_BUFFER_CAPACITY);
        let (tx_b, mut rx_b) = mpsc::channel(SEND_BUFFER_CAPACITY);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        hub.register(a, tx_a, "alice".into(), None, Role::User, vec!["host".into()]);
        hub.register(b, tx_b, "bob".into(), None, Role::User, vec!["host".into()]);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        hub.broadcast(Some("host".into()), Frame::event("chat.message", serde_json::json!({})), Some(a));
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn handler_panic_replies_with_handler_failed() {
        use crate::services::{ChatError, ChatService, StoredMessage};

        struct PanicChat;

        #[async_trait::async_trait]
        impl ChatService for PanicChat {
            async fn send(&self, _user_id: &str, _scope: &str, _body: &str) -> Result<StoredMessage, ChatError> {
                panic!("boom");
            }
            async fn edit(&self, _: &str, _: bool, _: &str, _: &str) -> Result<String, ChatError> {
                unimplemented!()
            }
            async fn delete(&self, _: &str, _: bool, _: bool, _: &str, _: bool) -> Result<String, ChatError> {
                unimplemented!()
            }
            async fn redact(&self, _: bool, _: bool, _: &str, _: &str) -> Result<String, ChatError> {
                unimplemented!()
            }
        }

        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(InMemoryAuthService::new()),
            Arc::new(InMemoryMembershipService::new()),
            Arc::new(PanicChat),
            Arc::new(InMemoryDeviceService::new()),
        ));
        let (hub, _handle) = Hub::spawn(dispatcher);
        let (tx, mut rx) = mpsc::channel(SEND_BUFFER_CAPACITY);
        let id = Uuid::new_v4();
        hub.register(id, tx, "alice".into(), None, Role::User, vec![]);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        hub.inbound(
            id,
            Frame {
                r#type: "chat.send".to_string(),
                op_id: Some("1".to_string()),
                data: Some(serde_json::json!({"scope": "host", "body": "hi"})),
                error: None,
            },
        );
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let Message::Text(text) = rx.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        assert!(text.contains("ERR_HANDLER_FAILED"));
    }

    #[tokio::test]
    async fn unregister_publishes_offline_presence_with_departing_user_id() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (tx_a, _rx_a) = mpsc::channel(SEND_BUFFER_CAPACITY);
        let (tx_b, mut rx_b) = mpsc::channel(SEND_BUFFER_CAPACITY);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        hub.register(a, tx_a, "alice".into(), None, Role::User, vec!["host".into()]);
        hub.register(b, tx_b, "bob".into(), None, Role::User, vec!["host".into()]);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        hub.unregister(a);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let Message::Text(text) = rx_b.try_recv().unwrap() else {
            panic!("expected text frame");
        };
        let frame: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(frame["type"], "presence.update");
        assert_eq!(frame["data"]["user_id"], "alice");
        assert_eq!(frame["data"]["status"], "offline");
    }

    #[tokio::test]
    async fn full_buffer_schedules_eviction_without_blocking() {
        let (hub, _handle) = Hub::spawn(test_dispatcher());
        let (tx, _rx) = mpsc::channel(1);
        let id = Uuid::new_v4();
        hub.register(id, tx, "alice".into(), None, Role::User, vec!["host".into()]);
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        // No one drains the receiver, so these broadcasts overflow the
        // buffer and the connection should be scheduled for eviction.
        hub.broadcast(Some("host".into()), Frame::event("chat.message", serde_json::json!({"n": 1})), None);
        hub.broadcast(Some("host".into()), Frame::event("chat.message", serde_json::json!({"n": 2})), None);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(hub.client_count(), 0);
    }
}
