//! Hub server binary.
//!
//! Wires the in-memory domain service stand-ins to a [`Dispatcher`], spawns
//! the [`Hub`] mutator, and serves `/v1/ws` (the WebSocket upgrade) and
//! `/healthz` (liveness) over axum.
//!
//! Production wiring of real `AuthService`/`ChatService`/etc. implementations
//! is a constructor-time concern left to the embedding application; this
//! binary exists to run the hub standalone for development and the
//! integration test suite.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use hub_core::config::{HubCliArgs, HubConfig};
use hub_core::connection::{ConnectionLimits, Identity};
use hub_core::services::{
    AuthenticatedUser, AuthService, InMemoryAuthService, InMemoryChatService, InMemoryDeviceService,
    InMemoryMembershipService,
};
use hub_core::{Dispatcher, Hub, Role};
use serde::Deserialize;

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

#[tokio::main]
async fn main() {
    let cli = HubCliArgs::parse();
    let config = match HubConfig::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    let dev_user = AuthenticatedUser {
        user_id: "dev-user".to_string(),
        tenant_id: Some("dev-tenant".to_string()),
        role: Role::Admin,
    };
    let auth: Arc<dyn AuthService> = Arc::new(
        InMemoryAuthService::new().with_token("dev-token", dev_user),
    );
    let membership = Arc::new(InMemoryMembershipService::new());
    let chat = Arc::new(InMemoryChatService::new());
    let device = Arc::new(InMemoryDeviceService::new());

    let dispatcher = Arc::new(Dispatcher::new(auth.clone(), membership, chat, device));
    let (hub, mutator_handle) = Hub::spawn(dispatcher);

    let limits = ConnectionLimits {
        max_frame_bytes: config.max_frame_bytes,
        read_idle_timeout: Duration::from_secs(config.read_idle_timeout_secs),
        ping_interval: Duration::from_secs(config.ping_interval_secs),
        write_timeout: Duration::from_secs(config.write_timeout_secs),
        rate_limit_per_sec: config.rate_limit_per_sec,
        rate_limit_burst: config.rate_limit_burst,
    };

    let state = AppState { hub, auth, limits };

    let app = axum::Router::new()
        .route("/v1/ws", get(ws_handler))
        .route("/healthz", get(healthz))
        .with_state(state);

    tracing::info!(addr = %config.bind_addr, "starting hub server");

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind hub server");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "hub server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    drop(mutator_handle);
}

async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    // The mutator task is alive as long as queries succeed against it.
    let _ = state.hub.client_count();
    StatusCode::OK
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> axum::response::Response {
    let Some(token) = query.access_token else {
        return unauthorized();
    };
    let identity = match state.auth.validate_access_token(&token).await {
        Ok(user) => Identity { user_id: user.user_id, tenant_id: user.tenant_id, role: user.role },
        Err(_) => return unauthorized(),
    };

    let hub = state.hub.clone();
    let limits = state.limits;
    ws.on_upgrade(move |socket| hub_core::connection::run(socket, identity, hub, limits))
}

fn unauthorized() -> axum::response::Response {
    (
        StatusCode::UNAUTHORIZED,
        axum::Json(serde_json::json!({"error": {"code": "ERR_UNAUTHORIZED", "message": "missing or invalid access token"}})),
    )
        .into_response()
}
