//! Local WireGuard device seam.
//!
//! The proxy never talks to WireGuard's data path except through loopback
//! sockets. It only needs to read a peer's state and redirect the peer's
//! endpoint at a proxy socket (and back again).

use crate::error::{ProxyError, Result};
use crate::keys::PeerKey;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::SystemTime;

/// Peer state as reported by the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerInfo {
    /// Current endpoint
    pub endpoint: Option<SocketAddr>,
    /// Time of the last completed handshake
    pub last_handshake: Option<SystemTime>,
    /// Bytes received from the peer
    pub rx_bytes: u64,
    /// Bytes sent to the peer
    pub tx_bytes: u64,
}

/// Operations the proxy needs from the local WireGuard device
#[async_trait]
pub trait WireGuardDevice: Send + Sync {
    /// Look up a configured peer
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::PeerNotFound` if the peer is not configured and
    /// `ProxyError::Device` if the device cannot be queried
    async fn get_peer(&self, key: &PeerKey) -> Result<PeerInfo>;

    /// Point the peer's endpoint at `endpoint`
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Device` if the device rejects the change
    async fn set_peer_endpoint(&self, key: &PeerKey, endpoint: SocketAddr) -> Result<()>;
}

/// In-memory device, for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryDevice {
    peers: Mutex<HashMap<PeerKey, PeerInfo>>,
    rewrites: Mutex<Vec<(PeerKey, SocketAddr)>>,
}

impl MemoryDevice {
    /// Empty device
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a peer
    pub fn add_peer(&self, key: PeerKey, endpoint: Option<SocketAddr>) {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                key,
                PeerInfo {
                    endpoint,
                    ..PeerInfo::default()
                },
            );
    }

    /// Current endpoint of a peer
    #[must_use]
    pub fn endpoint(&self, key: &PeerKey) -> Option<SocketAddr> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .and_then(|p| p.endpoint)
    }

    /// Every endpoint rewrite in order
    #[must_use]
    pub fn rewrites(&self) -> Vec<(PeerKey, SocketAddr)> {
        self.rewrites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl WireGuardDevice for MemoryDevice {
    async fn get_peer(&self, key: &PeerKey) -> Result<PeerInfo> {
        self.peers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
            .ok_or_else(|| ProxyError::PeerNotFound(key.short()))
    }

    async fn set_peer_endpoint(&self, key: &PeerKey, endpoint: SocketAddr) -> Result<()> {
        let mut peers = self.peers.lock().unwrap_or_else(PoisonError::into_inner);
        let peer = peers
            .get_mut(key)
            .ok_or_else(|| ProxyError::Device(format!("unknown peer {}", key.short()).into()))?;
        peer.endpoint = Some(endpoint);
        drop(peers);

        self.rewrites
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((*key, endpoint));
        Ok(())
    }
}
