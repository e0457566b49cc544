//! Domain service seams consumed by the dispatcher.
//!
//! These traits are the hub's only contact with the outside system: real
//! auth, membership, chat, and device persistence live in services this
//! crate does not own (spec'd out of scope). Each trait is `Send + Sync` so
//! the dispatcher can hold it behind an `Arc<dyn _>` and call it from
//! ephemeral per-frame tasks. The `InMemory*` stand-ins exist only to drive
//! dispatcher tests without a real backing store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::connection::Role;

/// Resolved identity for a validated access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub user_id: String,
    pub tenant_id: Option<String>,
    pub role: Role,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token is invalid or expired")]
    Unauthorized,
}

/// Validates bearer tokens at upgrade time and refresh requests in-flight.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn validate_access_token(&self, token: &str) -> Result<AuthenticatedUser, AuthError>;

    /// Validates a refresh, returning the (possibly same) authenticated
    /// identity. Per the decision in `SPEC_FULL.md` §4.4, a user-id change
    /// on refresh is rejected by the dispatcher, not by this trait.
    async fn refresh(&self, refresh_token: &str) -> Result<AuthenticatedUser, AuthError>;
}

/// Confirms network membership for `room.join{room:"network:<id>"}`.
#[async_trait]
pub trait MembershipService: Send + Sync {
    async fn is_approved_member(&self, user_id: &str, network_id: &str) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("not authorized to perform this chat action")]
    Forbidden,
    #[error("message {0} not found")]
    NotFound(String),
    #[error("invalid chat request: {0}")]
    Invalid(String),
}

/// A persisted chat message, as returned by the chat service.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub message_id: String,
    pub scope: String,
    pub user_id: String,
    pub body: String,
}

/// Persistence, scope rules, and edit/delete/redact authorization for chat.
#[async_trait]
pub trait ChatService: Send + Sync {
    async fn send(
        &self,
        user_id: &str,
        scope: &str,
        body: &str,
    ) -> Result<StoredMessage, ChatError>;

    /// Returns the message's scope on success, enforcing "author or admin".
    async fn edit(
        &self,
        user_id: &str,
        is_admin: bool,
        message_id: &str,
        new_body: &str,
    ) -> Result<String, ChatError>;

    /// `hard` deletes require `is_admin`; `soft` allows author or moderator.
    async fn delete(
        &self,
        user_id: &str,
        is_admin: bool,
        is_moderator: bool,
        message_id: &str,
        hard: bool,
    ) -> Result<String, ChatError>;

    /// Moderator/admin only.
    async fn redact(
        &self,
        is_moderator: bool,
        is_admin: bool,
        message_id: &str,
        mask: &str,
    ) -> Result<String, ChatError>;
}

/// Heartbeat-driven device presence; publishes device online/offline events
/// via `Hub::broadcast` directly rather than through this trait (per
/// `spec.md` §4.6, `DeviceOnline`/`DeviceOffline` are emitted by the
/// service, consumed here only as an interface boundary marker).
#[async_trait]
pub trait DeviceService: Send + Sync {
    async fn record_heartbeat(&self, device_id: &str);
}

// ---------------------------------------------------------------------------
// In-memory stand-ins, sufficient to drive dispatcher tests.
// ---------------------------------------------------------------------------

/// Maps opaque bearer tokens to a fixed identity. Good enough to exercise
/// the dispatcher's authorization branches without a real auth backend.
pub struct InMemoryAuthService {
    tokens: HashMap<String, AuthenticatedUser>,
}

impl InMemoryAuthService {
    #[must_use]
    pub fn new() -> Self {
        Self { tokens: HashMap::new() }
    }

    #[must_use]
    pub fn with_token(mut self, token: impl Into<String>, user: AuthenticatedUser) -> Self {
        self.tokens.insert(token.into(), user);
        self
    }
}

impl Default for InMemoryAuthService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthService for InMemoryAuthService {
    async fn validate_access_token(&self, token: &str) -> Result<AuthenticatedUser, AuthError> {
        self.tokens.get(token).cloned().ok_or(AuthError::Unauthorized)
    }

    async fn refresh(&self, refresh_token: &str) -> Result<AuthenticatedUser, AuthError> {
        self.tokens
            .get(refresh_token)
            .cloned()
            .ok_or(AuthError::Unauthorized)
    }
}

/// Tracks a fixed set of `(user_id, network_id)` approvals.
pub struct InMemoryMembershipService {
    approved: Mutex<Vec<(String, String)>>,
}

impl InMemoryMembershipService {
    #[must_use]
    pub fn new() -> Self {
        Self { approved: Mutex::new(Vec::new()) }
    }

    pub fn approve(&self, user_id: impl Into<String>, network_id: impl Into<String>) {
        self.approved.lock().push((user_id.into(), network_id.into()));
    }
}

impl Default for InMemoryMembershipService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MembershipService for InMemoryMembershipService {
    async fn is_approved_member(&self, user_id: &str, network_id: &str) -> bool {
        self.approved
            .lock()
            .iter()
            .any(|(u, n)| u == user_id && n == network_id)
    }
}

/// Append-only in-memory chat store keyed by a monotonic counter id.
pub struct InMemoryChatService {
    next_id: Mutex<u64>,
    messages: Mutex<HashMap<String, StoredMessage>>,
}

impl InMemoryChatService {
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            messages: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for InMemoryChatService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChatService for InMemoryChatService {
    async fn send(
        &self,
        user_id: &str,
        scope: &str,
        body: &str,
    ) -> Result<StoredMessage, ChatError> {
        if scope.is_empty() || body.is_empty() {
            return Err(ChatError::Invalid("scope and body must be non-empty".to_string()));
        }
        let id = {
            let mut next_id = self.next_id.lock();
            let id = *next_id;
            *next_id += 1;
            id
        };
        let message = StoredMessage {
            message_id: id.to_string(),
            scope: scope.to_string(),
            user_id: user_id.to_string(),
            body: body.to_string(),
        };
        self.messages.lock().insert(message.message_id.clone(), message.clone());
        Ok(message)
    }

    async fn edit(
        &self,
        user_id: &str,
        is_admin: bool,
        message_id: &str,
        new_body: &str,
    ) -> Result<String, ChatError> {
        let mut messages = self.messages.lock();
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;
        if message.user_id != user_id && !is_admin {
            return Err(ChatError::Forbidden);
        }
        message.body = new_body.to_string();
        Ok(message.scope.clone())
    }

    async fn delete(
        &self,
        user_id: &str,
        is_admin: bool,
        is_moderator: bool,
        message_id: &str,
        hard: bool,
    ) -> Result<String, ChatError> {
        let mut messages = self.messages.lock();
        let message = messages
            .get(message_id)
            .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;
        let allowed = if hard {
            is_admin
        } else {
            is_admin || is_moderator || message.user_id == user_id
        };
        if !allowed {
            return Err(ChatError::Forbidden);
        }
        let scope = message.scope.clone();
        messages.remove(message_id);
        Ok(scope)
    }

    async fn redact(
        &self,
        is_moderator: bool,
        is_admin: bool,
        message_id: &str,
        mask: &str,
    ) -> Result<String, ChatError> {
        if !is_moderator && !is_admin {
            return Err(ChatError::Forbidden);
        }
        let mut messages = self.messages.lock();
        let message = messages
            .get_mut(message_id)
            .ok_or_else(|| ChatError::NotFound(message_id.to_string()))?;
        message.body = mask.to_string();
        Ok(message.scope.clone())
    }
}

/// Records heartbeats without publishing online/offline transitions; tests
/// that need the transition observe it via the hub's broadcast mailbox
/// directly, matching how a real device service would call `Hub::broadcast`.
pub struct InMemoryDeviceService {
    last_heartbeat: Mutex<HashMap<String, std::time::Instant>>,
}

impl InMemoryDeviceService {
    #[must_use]
    pub fn new() -> Self {
        Self { last_heartbeat: Mutex::new(HashMap::new()) }
    }
}

impl Default for InMemoryDeviceService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceService for InMemoryDeviceService {
    async fn record_heartbeat(&self, device_id: &str) {
        self.last_heartbeat.lock().insert(device_id.to_string(), std::time::Instant::now());
    }
}
