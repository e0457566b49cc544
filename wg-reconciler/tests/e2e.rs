//! Scenario 5 (`spec.md` §8): peer replacement is atomic, testable without
//! root or a real network namespace via `FakeBackend`.

use std::sync::Arc;

use base64::Engine;
use wg_reconciler::backend::FakeBackend;
use wg_reconciler::device::{PeerConfig, WgKey};
use wg_reconciler::repo::{InMemoryPeerRepository, PeerRepository};
use wg_reconciler::Reconciler;

fn key(byte: u8) -> WgKey {
    WgKey::parse(&base64::engine::general_purpose::STANDARD.encode([byte; 32])).unwrap()
}

fn peer(byte: u8) -> PeerConfig {
    PeerConfig {
        public_key: key(byte),
        preshared_key: None,
        allowed_ips: vec!["10.20.0.0/24".to_string()],
        endpoint: Some(format!("198.51.100.{byte}:51820")),
        persistent_keepalive_secs: Some(25),
    }
}

#[test]
fn replacing_peer_set_drops_stale_peers_and_keeps_the_rest() {
    let backend = Arc::new(FakeBackend::new());
    let reconciler = Reconciler::new(Arc::clone(&backend), "wg0".to_string(), key(1), 51820);

    let repo = InMemoryPeerRepository::new();
    repo.set_peers("net-a", vec![peer(10), peer(11), peer(12)]);
    reconciler.sync_peers(&repo.desired_peers("net-a")).unwrap();

    let after_first = backend.read_device("wg0").unwrap();
    assert_eq!(after_first.peer_count(), 3);

    // Peer 11 leaves the network, peer 13 joins; the device must end up
    // with exactly {10, 12, 13} after one replace_peers call.
    repo.set_peers("net-a", vec![peer(10), peer(12), peer(13)]);
    let report = reconciler.sync_peers(&repo.desired_peers("net-a")).unwrap();

    assert_eq!(report.peers_added, 1);
    assert_eq!(report.peers_removed, 1);
    assert_eq!(report.peers_kept, 2);

    let after_second = backend.read_device("wg0").unwrap();
    assert_eq!(after_second.peer_count(), 3);
    let keys: std::collections::HashSet<_> = after_second.peers.iter().map(|p| p.public_key.clone()).collect();
    assert!(keys.contains(&key(10)));
    assert!(keys.contains(&key(12)));
    assert!(keys.contains(&key(13)));
    assert!(!keys.contains(&key(11)));
}

#[test]
fn invalid_key_material_fails_without_mutating_the_interface() {
    let backend = Arc::new(FakeBackend::new());
    let reconciler = Reconciler::new(Arc::clone(&backend), "wg0".to_string(), key(1), 51820);

    reconciler.sync_peers(&[peer(20)]).unwrap();

    let mut bad_peer = peer(21);
    bad_peer.allowed_ips = vec!["definitely-not-a-cidr".to_string()];

    assert!(reconciler.sync_peers(&[bad_peer]).is_err());

    let snapshot = backend.read_device("wg0").unwrap();
    assert_eq!(snapshot.peer_count(), 1, "interface must be untouched by the rejected call");
}
