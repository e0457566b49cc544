//! Test-support helpers for spinning up a real bound hub server.
//!
//! Used by this crate's own integration tests (`tests/`) and available to
//! downstream embedders that want the same harness for their own tests.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use serde::Deserialize;

use crate::config::HubConfig;
use crate::connection::{ConnectionLimits, Identity};
use crate::services::{
    AuthenticatedUser, AuthService, InMemoryAuthService, InMemoryChatService, InMemoryDeviceService,
    InMemoryMembershipService,
};
use crate::{Dispatcher, Hub};

#[derive(Clone)]
struct AppState {
    hub: Hub,
    auth: Arc<dyn AuthService>,
    limits: ConnectionLimits,
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    access_token: Option<String>,
}

/// A running hub server bound to an OS-assigned localhost port, with a
/// pre-populated [`InMemoryAuthService`] whose tokens can be issued to
/// tests via [`TestServer::token`].
pub struct TestServer {
    pub addr: SocketAddr,
    pub hub: Hub,
    _server: tokio::task::JoinHandle<()>,
    _mutator: tokio::task::JoinHandle<()>,
}

impl TestServer {
    /// Starts a hub server with the in-memory service stand-ins and the
    /// given token→identity map pre-registered.
    pub async fn start(tokens: Vec<(&str, AuthenticatedUser)>) -> Self {
        let mut auth_service = InMemoryAuthService::new();
        for (token, user) in tokens {
            auth_service = auth_service.with_token(token, user);
        }
        let auth: Arc<dyn AuthService> = Arc::new(auth_service);

        let membership = Arc::new(InMemoryMembershipService::new());
        let chat = Arc::new(InMemoryChatService::new());
        let device = Arc::new(InMemoryDeviceService::new());
        let dispatcher = Arc::new(Dispatcher::new(auth.clone(), membership, chat, device));
        let (hub, mutator_handle) = Hub::spawn(dispatcher);

        let config = HubConfig::default();
        let limits = ConnectionLimits {
            max_frame_bytes: config.max_frame_bytes,
            read_idle_timeout: Duration::from_secs(config.read_idle_timeout_secs),
            ping_interval: Duration::from_secs(config.ping_interval_secs),
            write_timeout: Duration::from_secs(config.write_timeout_secs),
            rate_limit_per_sec: config.rate_limit_per_sec,
            rate_limit_burst: config.rate_limit_burst,
        };

        let state = AppState { hub: hub.clone(), auth: Arc::clone(&auth), limits };
        let app = axum::Router::new()
            .route("/v1/ws", get(ws_handler))
            .route("/healthz", get(healthz))
            .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server_handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Self { addr, hub, _server: server_handle, _mutator: mutator_handle }
    }

    #[must_use]
    pub fn ws_url(&self, token: &str) -> String {
        format!("ws://{}/v1/ws?access_token={}", self.addr, token)
    }
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    let _ = state.hub.client_count();
    StatusCode::OK
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> axum::response::Response {
    let Some(token) = query.access_token else {
        return (StatusCode::UNAUTHORIZED, "missing access_token").into_response();
    };
    let identity = match state.auth.validate_access_token(&token).await {
        Ok(user) => Identity { user_id: user.user_id, tenant_id: user.tenant_id, role: user.role },
        Err(_) => return (StatusCode::UNAUTHORIZED, "invalid access_token").into_response(),
    };

    let hub = state.hub.clone();
    let limits = state.limits;
    ws.on_upgrade(move |socket| crate::connection::run(socket, identity, hub, limits))
}
