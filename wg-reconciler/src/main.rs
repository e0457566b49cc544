//! WireGuard reconciler binary.
//!
//! Runs the reconcile ticker against a [`WireguardBackend`] and serves a
//! `/metrics` route with the exporter output, independent of `hub-core`'s
//! WebSocket hub (`spec.md` §5: the reconciler holds no long-lived locks
//! and shares no task with the hub's mutator).
//!
//! The real WireGuard backend (kernel UAPI) is Linux-only and out of scope
//! for this workspace's test coverage; this binary runs against
//! [`wg_reconciler::backend::FakeBackend`] until a production backend is
//! wired in, matching `hub-core::main`'s "production wiring is a
//! constructor-time concern" stance.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use clap::Parser;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use wg_reconciler::backend::FakeBackend;
use wg_reconciler::config::{ReconcilerCliArgs, ReconcilerConfig};
use wg_reconciler::device::WgKey;
use wg_reconciler::repo::{InMemoryPeerRepository, PeerRepository};
use wg_reconciler::reconciler::run_ticker;
use wg_reconciler::Reconciler;

#[derive(Clone)]
struct AppState {
    prometheus: PrometheusHandle,
}

#[tokio::main]
async fn main() {
    let cli = ReconcilerCliArgs::parse();
    let config = match ReconcilerConfig::load(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    let Some(private_key_raw) = &config.private_key else {
        tracing::error!("no private key configured; pass --private-key or WG_PRIVATE_KEY");
        std::process::exit(1);
    };
    let private_key = match WgKey::parse(private_key_raw) {
        Ok(key) => key,
        Err(err) => {
            tracing::error!(error = %err, "invalid private key");
            std::process::exit(1);
        }
    };

    let prometheus = match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => handle,
        Err(err) => {
            tracing::error!(error = %err, "failed to install prometheus recorder");
            std::process::exit(1);
        }
    };

    let backend = Arc::new(FakeBackend::new());
    let reconciler =
        Arc::new(Reconciler::new(backend, config.interface.clone(), private_key, config.listen_port));

    // Production wiring swaps this for a repository backed by the
    // networking service; empty desired set until one is configured.
    let peer_repo = Arc::new(InMemoryPeerRepository::new());
    let interface = config.interface.clone();
    let ticker_repo = Arc::clone(&peer_repo);
    let ticker_reconciler = Arc::clone(&reconciler);
    let ticker = tokio::spawn(run_ticker(
        ticker_reconciler,
        Duration::from_secs(config.reconcile_interval_secs),
        move || ticker_repo.desired_peers(&interface),
    ));

    let state = AppState { prometheus };
    let app = axum::Router::new().route("/metrics", get(metrics_handler)).with_state(state);

    tracing::info!(addr = %config.metrics_addr, interface = %config.interface, "starting wg-reconciler");

    let listener = match tokio::net::TcpListener::bind(&config.metrics_addr).await {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, "failed to bind metrics listener");
            std::process::exit(1);
        }
    };

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(err) = result {
                tracing::error!(error = %err, "metrics server error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    ticker.abort();
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.prometheus.render()
}
