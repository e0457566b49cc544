//! The kernel control interface abstraction.
//!
//! Production code talks to a real WireGuard device; tests substitute
//! [`FakeBackend`], an in-memory model, so `replace_peers` atomicity and
//! metric export can be exercised without root or a real network namespace.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::device::{DeviceSnapshot, DeviceUpdate, PeerState, WgKey};
use crate::ReconcileError;

/// The interface the reconciler submits device updates through and reads
/// live state back from.
pub trait WireguardBackend: Send + Sync {
    /// Applies a full device configuration atomically. `update.replace_peers`
    /// is always `true`: the post-state equals `update.peers` exactly.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Io`] or [`ReconcileError::NoSuchInterface`]
    /// on failure; the interface is left untouched.
    fn apply(&self, interface: &str, update: DeviceUpdate) -> Result<(), ReconcileError>;

    /// Reads back the live device state.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::NoSuchInterface`] if the interface has
    /// never been configured.
    fn read_device(&self, interface: &str) -> Result<DeviceSnapshot, ReconcileError>;
}

/// In-memory stand-in for a kernel WireGuard device, keyed by interface name.
#[derive(Default)]
pub struct FakeBackend {
    devices: Mutex<HashMap<String, DeviceSnapshot>>,
}

impl FakeBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl WireguardBackend for FakeBackend {
    fn apply(&self, interface: &str, update: DeviceUpdate) -> Result<(), ReconcileError> {
        let peers = update
            .peers
            .iter()
            .map(|p| PeerState {
                public_key: p.public_key.clone(),
                rx_bytes: 0,
                tx_bytes: 0,
                last_handshake: None,
            })
            .collect();

        let snapshot = DeviceSnapshot { interface: interface.to_string(), listen_port: update.listen_port, peers };
        self.devices.lock().insert(interface.to_string(), snapshot);
        Ok(())
    }

    fn read_device(&self, interface: &str) -> Result<DeviceSnapshot, ReconcileError> {
        self.devices
            .lock()
            .get(interface)
            .cloned()
            .ok_or_else(|| ReconcileError::NoSuchInterface(interface.to_string()))
    }
}

impl FakeBackend {
    /// Test hook: directly mutates a peer's counters as if traffic had
    /// flowed, without going through `apply`.
    #[cfg(test)]
    pub fn set_peer_counters(&self, interface: &str, public_key: &WgKey, rx: u64, tx: u64, last_handshake: Option<u64>) {
        let mut devices = self.devices.lock();
        if let Some(snapshot) = devices.get_mut(interface) {
            if let Some(peer) = snapshot.peers.iter_mut().find(|p| &p.public_key == public_key) {
                peer.rx_bytes = rx;
                peer.tx_bytes = tx;
                peer.last_handshake = last_handshake;
            }
        }
    }
}
