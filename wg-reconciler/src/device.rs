//! Desired/live WireGuard device model and the key/CIDR validation that
//! guards [`crate::reconciler::Reconciler::sync_peers`] before any call
//! reaches the kernel control interface.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::ReconcileError;

/// A validated WireGuard public or private key: 32 bytes of X25519 key
/// material, stored in its base64 wire form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WgKey(String);

impl WgKey {
    /// Parses and validates a base64-encoded 32-byte key.
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Config`] if the value is not valid base64
    /// or does not decode to exactly 32 bytes.
    pub fn parse(raw: &str) -> Result<Self, ReconcileError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(raw.trim())
            .map_err(|e| ReconcileError::Config {
                field: "key".to_string(),
                reason: format!("invalid base64: {e}"),
            })?;
        if decoded.len() != 32 {
            return Err(ReconcileError::Config {
                field: "key".to_string(),
                reason: format!("expected 32 bytes, got {}", decoded.len()),
            });
        }
        Ok(Self(raw.trim().to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WgKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single configured peer, as supplied by the [`crate::repo::PeerRepository`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub public_key: WgKey,
    pub preshared_key: Option<WgKey>,
    pub allowed_ips: Vec<String>,
    pub endpoint: Option<String>,
    pub persistent_keepalive_secs: Option<u16>,
}

impl PeerConfig {
    /// Validates key material and allowed-IP CIDRs, returning a
    /// [`ValidatedPeer`] ready to hand to a [`crate::backend::WireguardBackend`].
    ///
    /// # Errors
    ///
    /// Returns [`ReconcileError::Config`] on the first malformed field.
    pub fn validate(&self) -> Result<ValidatedPeer, ReconcileError> {
        let public_key = self.public_key.clone();
        let preshared_key = self.preshared_key.clone();

        let mut allowed_ips = Vec::with_capacity(self.allowed_ips.len());
        for cidr in &self.allowed_ips {
            let parsed = IpNet::from_str(cidr).map_err(|e| ReconcileError::Config {
                field: "allowed_ips".to_string(),
                reason: format!("invalid CIDR {cidr:?}: {e}"),
            })?;
            allowed_ips.push(parsed);
        }

        Ok(ValidatedPeer {
            public_key,
            preshared_key,
            allowed_ips,
            endpoint: self.endpoint.clone(),
            persistent_keepalive_secs: self.persistent_keepalive_secs,
        })
    }
}

/// A [`PeerConfig`] whose key material and CIDRs have already passed
/// validation. Only `ValidatedPeer`s are ever handed to a backend.
#[derive(Debug, Clone)]
pub struct ValidatedPeer {
    pub public_key: WgKey,
    pub preshared_key: Option<WgKey>,
    pub allowed_ips: Vec<IpNet>,
    pub endpoint: Option<String>,
    pub persistent_keepalive_secs: Option<u16>,
}

/// A full device configuration submitted as a single atomic call.
///
/// `replace_peers` is always `true` — see `spec.md` §4.5 and §9's REDESIGN
/// FLAG: the post-state of the interface must equal `peers` exactly, never
/// an incremental add/remove diff sent to the kernel.
#[derive(Debug, Clone)]
pub struct DeviceUpdate {
    pub private_key: WgKey,
    pub listen_port: u16,
    pub replace_peers: bool,
    pub peers: Vec<ValidatedPeer>,
}

impl DeviceUpdate {
    #[must_use]
    pub fn new(private_key: WgKey, listen_port: u16, peers: Vec<ValidatedPeer>) -> Self {
        Self { private_key, listen_port, replace_peers: true, peers }
    }
}

/// Per-peer live counters as read back from the kernel device.
#[derive(Debug, Clone)]
pub struct PeerState {
    pub public_key: WgKey,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
    /// Seconds since the last handshake, or `None` if there has never been one.
    pub last_handshake: Option<u64>,
}

/// A snapshot of a live WireGuard device, as read by
/// [`crate::backend::WireguardBackend::read_device`].
#[derive(Debug, Clone, Default)]
pub struct DeviceSnapshot {
    pub interface: String,
    pub listen_port: u16,
    pub peers: Vec<PeerState>,
}

impl DeviceSnapshot {
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }
}
