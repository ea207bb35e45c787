//! Peer-list snapshots pushed by the control plane.

use crate::keys::PeerKey;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// NAT classification reported for a host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NatType {
    /// Directly reachable
    Public,
    /// Endpoint-independent mapping
    Asymmetric,
    /// Endpoint-dependent mapping; needs a relay
    Symmetric,
    /// Not yet determined
    #[default]
    #[serde(other)]
    Unknown,
}

/// Peer behind a relay host, as seen by that relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayedPeer {
    /// Relayed peer's key
    pub public_key: PeerKey,
    /// Where the relay forwards its frames
    pub endpoint: SocketAddr,
}

/// One peer in a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerUpdate {
    /// WireGuard public key
    pub public_key: PeerKey,
    /// Owning host
    #[serde(default)]
    pub host_id: String,
    /// Network scope
    #[serde(default)]
    pub network: String,
    /// Public endpoint
    #[serde(default)]
    pub endpoint: Option<SocketAddr>,
    /// Port of the peer's proxy server
    #[serde(default)]
    pub proxy_listen_port: u16,
    /// Peer's NAT type
    #[serde(default)]
    pub nat_type: NatType,
    /// Proxy traffic to this peer
    #[serde(default)]
    pub proxy: bool,
    /// Peer is reached through a relay host
    #[serde(default)]
    pub is_relayed: bool,
    /// Relay host's proxy endpoint when relayed
    #[serde(default)]
    pub relay_endpoint: Option<SocketAddr>,
    /// Peer relays for others
    #[serde(default)]
    pub is_relay: bool,
    /// Peer is an ingress gateway
    #[serde(default)]
    pub is_ingress_gateway: bool,
    /// Peer is an external client that dials in
    #[serde(default)]
    pub is_ext_client: bool,
}

impl PeerUpdate {
    /// Address of the peer's proxy server
    #[must_use]
    pub fn proxy_addr(&self) -> Option<SocketAddr> {
        let endpoint = self.endpoint?;
        let port = if self.proxy_listen_port == 0 {
            endpoint.port()
        } else {
            self.proxy_listen_port
        };
        Some(SocketAddr::new(endpoint.ip(), port))
    }
}

/// Full peer-list snapshot for this host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPeerUpdate {
    /// This host's id
    #[serde(default)]
    pub host_id: String,
    /// Network epoch; control messages from other epochs are ignored
    #[serde(default)]
    pub epoch: u32,
    /// This host's NAT type
    #[serde(default)]
    pub nat_type: NatType,
    /// Proxy port the control plane advertises for this host
    #[serde(default)]
    pub proxy_listen_port: u16,
    /// This host relays for others
    #[serde(default)]
    pub is_relay: bool,
    /// Peers relayed through this host
    #[serde(default)]
    pub relayed_peers: Vec<RelayedPeer>,
    /// Peers
    #[serde(default)]
    pub peers: Vec<PeerUpdate>,
}

impl HostPeerUpdate {
    /// Find a peer by key
    #[must_use]
    pub fn peer(&self, key: &PeerKey) -> Option<&PeerUpdate> {
        self.peers.iter().find(|p| &p.public_key == key)
    }
}
