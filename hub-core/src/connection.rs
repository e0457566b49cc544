//! One duplex peer: read pump, write pump, and the identity fixed at
//! upgrade time.
//!
//! A connection never tears down its own hub registration directly — on any
//! terminal condition (read error, write error, the other pump exiting) it
//! requests `Hub::unregister` and lets the mutator task do the cleanup, so
//! teardown is always driven from one place and is safe to call twice.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use hub_proto::envelope::{self, Frame};
use hub_proto::error_code::ErrorCode;
use uuid::Uuid;

use crate::hub::{ConnectionId, Hub, SEND_BUFFER_CAPACITY};
use crate::rate_limit::TokenBucket;

/// A connection's authorization level, fixed at upgrade and never mutated
/// afterward (§9: "no runtime mutation").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Moderator,
    Admin,
}

impl Role {
    #[must_use]
    pub const fn is_admin(self) -> bool {
        matches!(self, Self::Admin)
    }

    #[must_use]
    pub const fn is_moderator(self) -> bool {
        matches!(self, Self::Moderator | Self::Admin)
    }
}

/// Identity resolved by the authentication middleware before upgrade.
/// Immutable for the lifetime of the connection.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub role: Role,
}

/// Read/write timing and size limits, carried from [`crate::config::HubConfig`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectionLimits {
    pub max_frame_bytes: usize,
    pub read_idle_timeout: Duration,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub rate_limit_per_sec: u32,
    pub rate_limit_burst: u32,
}

/// Rooms a connection is auto-joined to immediately on successful upgrade
/// (§6: host if admin, tenant if present, always its own user room).
#[must_use]
pub fn auto_join_rooms(identity: &Identity) -> Vec<String> {
    let mut rooms = vec![hub_proto::room::user(&identity.user_id)];
    if identity.role.is_admin() {
        rooms.push(hub_proto::room::host());
    }
    if let Some(tenant_id) = &identity.tenant_id {
        rooms.push(hub_proto::room::tenant(tenant_id));
    }
    rooms
}

/// Drives one upgraded WebSocket to completion: registers with the hub,
/// runs the read and write pumps concurrently, and unregisters on exit.
pub async fn run(socket: WebSocket, identity: Identity, hub: Hub, limits: ConnectionLimits) {
    let id: ConnectionId = Uuid::new_v4();
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Message>(SEND_BUFFER_CAPACITY);

    let initial_rooms = auto_join_rooms(&identity);
    hub.register(
        id,
        tx,
        identity.user_id.clone(),
        identity.tenant_id.clone(),
        identity.role,
        initial_rooms,
    );

    tracing::info!(connection = %id, user_id = %identity.user_id, "connection registered");

    let mut write_task = tokio::spawn(async move {
        let mut ping_timer = tokio::time::interval(limits.ping_interval);
        ping_timer.tick().await; // first tick fires immediately
        loop {
            tokio::select! {
                maybe_msg = rx.recv() => {
                    let Some(msg) = maybe_msg else {
                        let _ = ws_sender.send(Message::Close(None)).await;
                        break;
                    };
                    // Drain whatever else is already queued and flush it in
                    // one batch (§4.2: "coalesce... within the same message
                    // write") so a burst of frames costs one socket write
                    // instead of one per frame, without merging their
                    // WebSocket frame boundaries — each queued message still
                    // decodes as exactly one JSON object per text frame (§4.1).
                    let mut pending = vec![msg];
                    while let Ok(more) = rx.try_recv() {
                        pending.push(more);
                    }
                    let last = pending.len() - 1;
                    let mut write_failed = false;
                    for (i, m) in pending.into_iter().enumerate() {
                        let sent = if i == last {
                            tokio::time::timeout(limits.write_timeout, ws_sender.send(m)).await
                        } else {
                            tokio::time::timeout(limits.write_timeout, ws_sender.feed(m)).await
                        };
                        if sent.is_err() {
                            write_failed = true;
                            break;
                        }
                    }
                    if write_failed {
                        break;
                    }
                }
                _ = ping_timer.tick() => {
                    if tokio::time::timeout(limits.write_timeout, ws_sender.send(Message::Ping(Vec::new().into())))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
            }
        }
    });

    let reader_hub = hub.clone();
    let reader_id = id;
    let mut read_task = tokio::spawn(async move {
        let mut rate_limiter = TokenBucket::new(limits.rate_limit_per_sec, limits.rate_limit_burst);
        loop {
            let next = tokio::time::timeout(limits.read_idle_timeout, ws_receiver.next()).await;
            let Ok(Some(Ok(msg))) = next else {
                break;
            };
            match msg {
                Message::Text(text) => {
                    if text.len() > limits.max_frame_bytes {
                        tracing::warn!(connection = %reader_id, size = text.len(), "frame exceeds max size, closing");
                        break;
                    }
                    handle_text_frame(&text, reader_id, &reader_hub, &mut rate_limiter);
                }
                Message::Binary(data) => {
                    if data.len() > limits.max_frame_bytes {
                        tracing::warn!(connection = %reader_id, size = data.len(), "frame exceeds max size, closing");
                        break;
                    }
                    // The wire protocol is JSON text; a binary frame is
                    // treated as UTF-8 text if valid, otherwise rejected.
                    if let Ok(text) = std::str::from_utf8(&data) {
                        handle_text_frame(text, reader_id, &reader_hub, &mut rate_limiter);
                    }
                }
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => {
                    // Receiving either resets the idle timeout implicitly,
                    // since the next loop iteration re-arms it from now.
                }
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => { write_task.abort(); }
        _ = &mut write_task => { read_task.abort(); }
    }

    hub.unregister(id);
    tracing::info!(connection = %id, "connection unregistered");
}

fn handle_text_frame(text: &str, id: ConnectionId, hub: &Hub, rate_limiter: &mut TokenBucket) {
    let frame = match envelope::decode(text) {
        Ok(frame) => frame,
        Err(err) => {
            tracing::debug!(connection = %id, error = %err, "malformed frame");
            send_reply(hub, id, Frame::error(None, ErrorCode::InvalidMessage, err.to_string()));
            return;
        }
    };

    if !rate_limiter.try_take() {
        send_reply(
            hub,
            id,
            Frame::error(frame.op_id.clone(), ErrorCode::RateLimit, "rate limit exceeded"),
        );
        return;
    }

    hub.inbound(id, frame);
}

/// Sends a single reply directly to one connection's send buffer, used for
/// frame-level errors the read pump itself produces (before dispatch).
fn send_reply(hub: &Hub, id: ConnectionId, frame: Frame) {
    // A direct reply to exactly one connection is a broadcast whose room
    // is that connection's private `user:<id>`-style target; simpler to
    // reuse the dispatcher's point-to-point helper via a singleton room.
    // Frame replies at the read-pump level bypass rooms entirely: they go
    // straight to the connection's own send buffer.
    hub.reply_direct(id, frame);
}
