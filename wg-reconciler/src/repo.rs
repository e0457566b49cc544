//! The authoritative source of desired WireGuard peers per network.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::device::PeerConfig;

/// Supplies the desired peer set for a network. Implemented against a real
/// datastore in production; [`InMemoryPeerRepository`] stands in for tests.
pub trait PeerRepository: Send + Sync {
    /// Returns the full desired peer set for `network_id`. An empty network
    /// (or one that does not exist) returns an empty vector rather than an
    /// error — "no peers" is a valid desired state.
    fn desired_peers(&self, network_id: &str) -> Vec<PeerConfig>;
}

/// In-memory peer repository keyed by network id.
#[derive(Default)]
pub struct InMemoryPeerRepository {
    networks: Mutex<HashMap<String, Vec<PeerConfig>>>,
}

impl InMemoryPeerRepository {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the desired peer set for a network wholesale.
    pub fn set_peers(&self, network_id: &str, peers: Vec<PeerConfig>) {
        self.networks.lock().insert(network_id.to_string(), peers);
    }
}

impl PeerRepository for InMemoryPeerRepository {
    fn desired_peers(&self, network_id: &str) -> Vec<PeerConfig> {
        self.networks.lock().get(network_id).cloned().unwrap_or_default()
    }
}
