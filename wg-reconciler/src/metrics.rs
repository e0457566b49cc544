//! Metric names and export, modeled on `zhubby-moltis`'s `moltis-metrics`
//! crate: centralized name constants plus a thin function that scrapes a
//! [`DeviceSnapshot`] into the `metrics` facade.

use crate::device::DeviceSnapshot;

/// Total number of configured peers on the device (gauge).
pub const PEERS_TOTAL: &str = "wg_peers_total";
/// Bytes received from a peer (gauge, labeled by `pubkey`).
pub const PEER_RX_BYTES: &str = "wg_peer_rx_bytes";
/// Bytes sent to a peer (gauge, labeled by `pubkey`).
pub const PEER_TX_BYTES: &str = "wg_peer_tx_bytes";
/// Seconds since the peer's last handshake, or -1 if there has never been one
/// (gauge, labeled by `pubkey`).
pub const PEER_LAST_HANDSHAKE_SECONDS: &str = "wg_peer_last_handshake_seconds";

/// Common label keys.
pub mod labels {
    pub const PUBKEY: &str = "pubkey";
    pub const INTERFACE: &str = "interface";
}

/// Exports a device snapshot's counters as Prometheus gauges via the
/// `metrics` facade. Called once per reconcile tick from
/// [`crate::reconciler::Reconciler::update_metrics`].
pub fn export_snapshot(snapshot: &DeviceSnapshot) {
    metrics::gauge!(PEERS_TOTAL, labels::INTERFACE => snapshot.interface.clone())
        .set(snapshot.peer_count() as f64);

    for peer in &snapshot.peers {
        let pubkey = peer.public_key.as_str().to_string();
        metrics::gauge!(PEER_RX_BYTES, labels::PUBKEY => pubkey.clone()).set(peer.rx_bytes as f64);
        metrics::gauge!(PEER_TX_BYTES, labels::PUBKEY => pubkey.clone()).set(peer.tx_bytes as f64);

        #[allow(clippy::cast_precision_loss)]
        let handshake_seconds = peer.last_handshake.map_or(-1.0, |s| s as f64);
        metrics::gauge!(PEER_LAST_HANDSHAKE_SECONDS, labels::PUBKEY => pubkey)
            .set(handshake_seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{PeerState, WgKey};
    use base64::Engine;

    #[test]
    fn export_does_not_panic_on_empty_snapshot() {
        let snapshot = DeviceSnapshot { interface: "wg0".to_string(), listen_port: 51820, peers: vec![] };
        export_snapshot(&snapshot);
    }

    #[test]
    fn export_handles_never_handshaked_peer() {
        let key = WgKey::parse(&base64::engine::general_purpose::STANDARD.encode([9u8; 32])).unwrap();
        let snapshot = DeviceSnapshot {
            interface: "wg0".to_string(),
            listen_port: 51820,
            peers: vec![PeerState { public_key: key, rx_bytes: 0, tx_bytes: 0, last_handshake: None }],
        };
        export_snapshot(&snapshot);
    }
}
