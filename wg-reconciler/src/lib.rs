//! WireGuard control-plane reconciler: desired/live peer diffing, atomic
//! `replace_peers` apply against a kernel control interface abstraction, and
//! Prometheus metric export.

pub mod backend;
pub mod config;
pub mod device;
pub mod metrics;
pub mod reconciler;
pub mod repo;

pub use backend::WireguardBackend;
pub use reconciler::{ReconcileReport, Reconciler};

/// Errors surfaced by the reconciler and its backend.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// Invalid key material or allowed-IP CIDR; the interface was not touched.
    #[error("invalid config field {field}: {reason}")]
    Config { field: String, reason: String },

    /// The kernel control interface rejected or failed the call.
    #[error("backend I/O error on interface {interface}: {source}")]
    Io { interface: String, source: std::io::Error },

    /// The named interface does not exist.
    #[error("no such WireGuard interface: {0}")]
    NoSuchInterface(String),
}
