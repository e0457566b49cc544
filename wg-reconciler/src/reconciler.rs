//! The reconciler: `SyncPeers`, `UpdateMetrics`, `Close` against a
//! [`WireguardBackend`], run from its own ticker task independent of the
//! hub's mutator (`spec.md` §5).

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::backend::WireguardBackend;
use crate::device::{DeviceUpdate, PeerConfig, WgKey};
use crate::metrics;
use crate::ReconcileError;

/// Diff of the previous live peer set against the newly-applied desired set,
/// computed before `apply` runs. Purely informational — logging/metrics —
/// it never changes the all-or-nothing `replace_peers` semantics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub peers_added: usize,
    pub peers_removed: usize,
    pub peers_kept: usize,
}

/// Owns the private key and interface name for one WireGuard device and
/// drives reconciliation against a [`WireguardBackend`].
pub struct Reconciler<B: WireguardBackend> {
    backend: Arc<B>,
    interface: String,
    private_key: WgKey,
    listen_port: u16,
}

impl<B: WireguardBackend> Reconciler<B> {
    #[must_use]
    pub fn new(backend: Arc<B>, interface: String, private_key: WgKey, listen_port: u16) -> Self {
        Self { backend, interface, private_key, listen_port }
    }

    /// Validates and applies a full peer set. `replace_peers` is always
    /// `true`: the post-state equals `desired` exactly, never an
    /// incremental add/remove diff (`spec.md` §4.5, §9 REDESIGN FLAG).
    ///
    /// On invalid key material or CIDRs the call fails with
    /// [`ReconcileError::Config`] before anything is submitted to the
    /// backend, leaving the interface untouched.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Config`] on invalid peer fields, or
    /// whatever the backend's `apply` returns on I/O failure.
    pub fn sync_peers(&self, desired: &[PeerConfig]) -> Result<ReconcileReport, ReconcileError> {
        let mut validated = Vec::with_capacity(desired.len());
        for peer in desired {
            validated.push(peer.validate()?);
        }

        let previous_keys: HashSet<WgKey> = match self.backend.read_device(&self.interface) {
            Ok(snapshot) => snapshot.peers.into_iter().map(|p| p.public_key).collect(),
            Err(ReconcileError::NoSuchInterface(_)) => HashSet::new(),
            Err(other) => return Err(other),
        };
        let desired_keys: HashSet<WgKey> = validated.iter().map(|p| p.public_key.clone()).collect();

        let report = ReconcileReport {
            peers_added: desired_keys.difference(&previous_keys).count(),
            peers_removed: previous_keys.difference(&desired_keys).count(),
            peers_kept: desired_keys.intersection(&previous_keys).count(),
        };

        let update = DeviceUpdate::new(self.private_key.clone(), self.listen_port, validated);
        self.backend.apply(&self.interface, update)?;

        Ok(report)
    }

    /// Reads the live device and exports its counters as Prometheus gauges.
    ///
    /// # Errors
    ///
    /// Returns whatever the backend's `read_device` returns.
    pub fn update_metrics(&self) -> Result<(), ReconcileError> {
        let snapshot = self.backend.read_device(&self.interface)?;
        metrics::export_snapshot(&snapshot);
        Ok(())
    }

    /// Runs `sync_peers` then `update_metrics` once against the given
    /// desired set, logging and continuing past errors — the caller's
    /// ticker loop (see `main.rs`) never dies on a single bad tick.
    pub fn reconcile_once(&self, desired: &[PeerConfig]) {
        match self.sync_peers(desired) {
            Ok(report) => {
                tracing::info!(
                    interface = %self.interface,
                    added = report.peers_added,
                    removed = report.peers_removed,
                    kept = report.peers_kept,
                    "reconciled peers"
                );
            }
            Err(err) => {
                tracing::error!(interface = %self.interface, error = %err, "sync_peers failed");
                return;
            }
        }

        if let Err(err) = self.update_metrics() {
            tracing::error!(interface = %self.interface, error = %err, "update_metrics failed");
        }
    }
}

/// Runs `reconcile_once` on a fixed interval until cancelled. Independent
/// of the hub's mutator task — the reconciler holds no long-lived locks,
/// each tick is a single backend call (`spec.md` §5).
pub async fn run_ticker<B, F>(reconciler: Arc<Reconciler<B>>, interval: Duration, desired_peers: F)
where
    B: WireguardBackend + 'static,
    F: Fn() -> Vec<PeerConfig>,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        ticker.tick().await;
        reconciler.reconcile_once(&desired_peers());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::FakeBackend;
    use base64::Engine;

    fn key(byte: u8) -> WgKey {
        WgKey::parse(&base64::engine::general_purpose::STANDARD.encode([byte; 32])).unwrap()
    }

    fn peer(byte: u8) -> PeerConfig {
        PeerConfig {
            public_key: key(byte),
            preshared_key: None,
            allowed_ips: vec!["10.0.0.0/24".to_string()],
            endpoint: None,
            persistent_keepalive_secs: Some(25),
        }
    }

    #[test]
    fn first_sync_reports_all_peers_added() {
        let backend = Arc::new(FakeBackend::new());
        let reconciler = Reconciler::new(backend, "wg0".to_string(), key(1), 51820);

        let report = reconciler.sync_peers(&[peer(2), peer(3)]).unwrap();
        assert_eq!(report, ReconcileReport { peers_added: 2, peers_removed: 0, peers_kept: 0 });
    }

    #[test]
    fn resync_with_overlapping_set_reports_kept_added_removed() {
        let backend = Arc::new(FakeBackend::new());
        let reconciler = Reconciler::new(backend, "wg0".to_string(), key(1), 51820);

        reconciler.sync_peers(&[peer(2), peer(3)]).unwrap();
        let report = reconciler.sync_peers(&[peer(3), peer(4)]).unwrap();

        assert_eq!(report, ReconcileReport { peers_added: 1, peers_removed: 1, peers_kept: 1 });
    }

    #[test]
    fn resync_with_empty_set_removes_everything() {
        let backend = Arc::new(FakeBackend::new());
        let reconciler = Reconciler::new(backend.clone(), "wg0".to_string(), key(1), 51820);

        reconciler.sync_peers(&[peer(2), peer(3)]).unwrap();
        reconciler.sync_peers(&[]).unwrap();

        let snapshot = backend.read_device("wg0").unwrap();
        assert_eq!(snapshot.peer_count(), 0);
    }

    #[test]
    fn invalid_peer_leaves_interface_untouched() {
        let backend = Arc::new(FakeBackend::new());
        let reconciler = Reconciler::new(backend.clone(), "wg0".to_string(), key(1), 51820);
        reconciler.sync_peers(&[peer(2)]).unwrap();

        let mut bad = peer(3);
        bad.allowed_ips = vec!["not-a-cidr".to_string()];
        assert!(reconciler.sync_peers(&[bad]).is_err());

        // The prior successful apply is unaffected by the rejected call.
        let snapshot = backend.read_device("wg0").unwrap();
        assert_eq!(snapshot.peer_count(), 1);
    }
}
