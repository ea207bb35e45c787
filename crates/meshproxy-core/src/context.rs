//! Process state store.
//!
//! One [`ProxyContext`] per proxy subsystem instance, shared as
//! `Arc<ProxyContext>` by the manager, the demultiplexers and every peer
//! connection. Nothing here is global; tests build as many as they like.
//!
//! Active connections live in two indexes, by public key and by key hash.
//! Both are updated under one write lock, so a [`Conn`] present in one is
//! always present in the other. No lock is held across I/O: teardown drains
//! records under the lock and closes them after releasing it.

use crate::config::ProxySettings;
use crate::conn::{Proxy, ProxyConfig, ProxyMode};
use crate::device::WireGuardDevice;
use crate::keys::{KeyHash, PeerKey};
use crate::metrics::MetricsStore;
use crate::update::NatType;
use dashmap::DashMap;
use meshproxy_transport::RelayTransport;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

/// Active peer connection record.
///
/// Replaced wholesale on change, never mutated in place.
#[derive(Clone)]
pub struct Conn {
    /// Peer key
    pub key: PeerKey,
    /// Wire index of `key`
    pub key_hash: KeyHash,
    /// Network scope
    pub network: String,
    /// Relay path
    pub mode: ProxyMode,
    /// Where framed packets for this peer are sent
    pub remote: SocketAddr,
    /// Loopback socket WireGuard now talks to
    pub local_addr: SocketAddr,
    /// Peer is reached through a relay host
    pub is_relayed: bool,
    /// Lifecycle handle
    pub proxy: Arc<dyn Proxy>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("key", &self.key)
            .field("network", &self.network)
            .field("mode", &self.mode)
            .field("remote", &self.remote)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Peer routable locally before a connection exists.
///
/// Used for external clients that dial in: the first inbound frame supplies
/// the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePeer {
    /// Peer key
    pub key: PeerKey,
    /// Network scope
    pub network: String,
    /// Last known endpoint
    pub endpoint: Option<SocketAddr>,
}

/// Per-peer flags, independent of connection lifecycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PeerSettings {
    /// Peer relays for others
    pub is_relay: bool,
    /// Peer is an ingress gateway
    pub is_ingress_gateway: bool,
    /// Peer is reached through a relay
    pub is_relayed: bool,
    /// Relay proxy endpoint when relayed
    pub relay_to: Option<SocketAddr>,
    /// Peer's NAT type
    pub nat_type: NatType,
}

#[derive(Default)]
struct Peers {
    by_key: HashMap<PeerKey, Conn>,
    by_hash: HashMap<KeyHash, Conn>,
    waiting: HashMap<KeyHash, RemotePeer>,
    relayed: HashMap<KeyHash, SocketAddr>,
}

#[derive(Default)]
struct Transports {
    server: Option<Arc<dyn RelayTransport>>,
    turn: Option<Arc<dyn RelayTransport>>,
}

/// Shared state of one proxy subsystem instance
pub struct ProxyContext {
    local_key: PeerKey,
    local_hash: KeyHash,
    device: Arc<dyn WireGuardDevice>,
    settings: ProxySettings,
    epoch: AtomicU32,
    peers: RwLock<Peers>,
    peer_settings: DashMap<PeerKey, PeerSettings>,
    configs: DashMap<PeerKey, ProxyConfig>,
    relay_addrs: DashMap<PeerKey, SocketAddr>,
    transports: RwLock<Transports>,
    metrics: MetricsStore,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl ProxyContext {
    /// Create a context for the host owning `local_key`
    #[must_use]
    pub fn new(
        local_key: PeerKey,
        device: Arc<dyn WireGuardDevice>,
        settings: ProxySettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_key,
            local_hash: local_key.hash(),
            device,
            settings,
            epoch: AtomicU32::new(0),
            peers: RwLock::new(Peers::default()),
            peer_settings: DashMap::new(),
            configs: DashMap::new(),
            relay_addrs: DashMap::new(),
            transports: RwLock::new(Transports::default()),
            metrics: MetricsStore::new(),
        })
    }

    /// This host's key
    #[must_use]
    pub fn local_key(&self) -> &PeerKey {
        &self.local_key
    }

    /// This host's key hash
    #[must_use]
    pub fn local_hash(&self) -> &KeyHash {
        &self.local_hash
    }

    /// The WireGuard device
    #[must_use]
    pub fn device(&self) -> &Arc<dyn WireGuardDevice> {
        &self.device
    }

    /// Subsystem settings
    #[must_use]
    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Metrics store
    #[must_use]
    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    /// Current network epoch
    #[must_use]
    pub fn epoch(&self) -> u32 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Set the network epoch
    pub fn set_epoch(&self, epoch: u32) {
        self.epoch.store(epoch, Ordering::Release);
    }

    // ============ Connections ============

    /// Register a connection in both indexes, returning the one it replaced
    pub fn register(&self, conn: Conn) -> Option<Conn> {
        let mut peers = write(&self.peers);
        let previous = peers.by_key.insert(conn.key, conn.clone());
        if let Some(prev) = &previous {
            peers.by_hash.remove(&prev.key_hash);
        }
        peers.waiting.remove(&conn.key_hash);
        peers.by_hash.insert(conn.key_hash, conn);
        previous
    }

    /// Remove a connection from both indexes
    pub fn remove(&self, key: &PeerKey) -> Option<Conn> {
        let mut peers = write(&self.peers);
        let conn = peers.by_key.remove(key)?;
        peers.by_hash.remove(&conn.key_hash);
        Some(conn)
    }

    /// Replace the transport-level fields of a registered connection
    ///
    /// Returns false if no connection is registered for `key`.
    pub fn update_conn(&self, key: &PeerKey, local_addr: SocketAddr, config: &ProxyConfig) -> bool {
        let mut peers = write(&self.peers);
        let Some(current) = peers.by_key.get(key) else {
            return false;
        };

        let updated = Conn {
            local_addr,
            remote: config.remote,
            mode: config.mode,
            is_relayed: config.is_relayed,
            network: config.network.clone(),
            ..current.clone()
        };
        peers.by_hash.insert(updated.key_hash, updated.clone());
        peers.by_key.insert(*key, updated);
        true
    }

    /// Look up by key
    #[must_use]
    pub fn conn(&self, key: &PeerKey) -> Option<Conn> {
        read(&self.peers).by_key.get(key).cloned()
    }

    /// Look up by key hash
    #[must_use]
    pub fn conn_by_hash(&self, hash: &KeyHash) -> Option<Conn> {
        read(&self.peers).by_hash.get(hash).cloned()
    }

    /// Every registered connection
    #[must_use]
    pub fn conns(&self) -> Vec<Conn> {
        read(&self.peers).by_key.values().cloned().collect()
    }

    /// Number of registered connections
    #[must_use]
    pub fn conn_count(&self) -> usize {
        read(&self.peers).by_key.len()
    }

    /// True when both indexes hold exactly the same connections
    #[must_use]
    pub fn indexes_consistent(&self) -> bool {
        let peers = read(&self.peers);
        peers.by_key.len() == peers.by_hash.len()
            && peers.by_key.iter().all(|(key, conn)| {
                conn.key == *key
                    && peers.by_hash.get(&conn.key_hash).is_some_and(|h| {
                        h.key == *key && h.remote == conn.remote && h.local_addr == conn.local_addr
                    })
            })
    }

    // ============ Waiting external clients ============

    /// Replace the waiting set
    pub fn set_waiting(&self, waiting: Vec<RemotePeer>) {
        let mut peers = write(&self.peers);
        peers.waiting = waiting
            .into_iter()
            .map(|peer| (peer.key.hash(), peer))
            .collect();
    }

    /// Waiting peer with this hash
    #[must_use]
    pub fn waiting_by_hash(&self, hash: &KeyHash) -> Option<RemotePeer> {
        read(&self.peers).waiting.get(hash).cloned()
    }

    /// Remove a peer from the waiting set
    pub fn take_waiting(&self, key: &PeerKey) -> Option<RemotePeer> {
        write(&self.peers).waiting.remove(&key.hash())
    }

    /// Number of waiting peers
    #[must_use]
    pub fn waiting_count(&self) -> usize {
        read(&self.peers).waiting.len()
    }

    // ============ Relayed peers (relay hosts) ============

    /// Replace the peers this host forwards for
    pub fn set_relayed(&self, relayed: impl IntoIterator<Item = (PeerKey, SocketAddr)>) {
        let mut peers = write(&self.peers);
        peers.relayed = relayed
            .into_iter()
            .map(|(key, endpoint)| (key.hash(), endpoint))
            .collect();
    }

    /// Forwarding target for a relayed peer
    #[must_use]
    pub fn relayed_by_hash(&self, hash: &KeyHash) -> Option<SocketAddr> {
        read(&self.peers).relayed.get(hash).copied()
    }

    // ============ Settings and configs ============

    /// Store per-peer flags
    pub fn set_peer_settings(&self, key: PeerKey, settings: PeerSettings) {
        self.peer_settings.insert(key, settings);
    }

    /// Per-peer flags
    #[must_use]
    pub fn peer_settings(&self, key: &PeerKey) -> Option<PeerSettings> {
        self.peer_settings.get(key).map(|s| s.value().clone())
    }

    /// Drop flags of peers not in `keep`
    pub fn retain_peer_settings(&self, keep: impl Fn(&PeerKey) -> bool) {
        self.peer_settings.retain(|key, _| keep(key));
    }

    /// Store the latest desired config for a peer
    pub fn set_config(&self, config: ProxyConfig) {
        self.configs.insert(config.peer_key, config);
    }

    /// Latest desired config for a peer
    #[must_use]
    pub fn config(&self, key: &PeerKey) -> Option<ProxyConfig> {
        self.configs.get(key).map(|c| c.value().clone())
    }

    /// Forget a peer's config
    pub fn remove_config(&self, key: &PeerKey) {
        self.configs.remove(key);
    }

    // ============ Relay addresses (TURN) ============

    /// Record a peer's relayed address learned by signaling
    pub fn set_peer_relay_addr(&self, key: PeerKey, addr: SocketAddr) {
        self.relay_addrs.insert(key, addr);
    }

    /// Peer's relayed address
    #[must_use]
    pub fn peer_relay_addr(&self, key: &PeerKey) -> Option<SocketAddr> {
        self.relay_addrs.get(key).map(|a| *a.value())
    }

    /// Forget a peer's relayed address
    pub fn remove_peer_relay_addr(&self, key: &PeerKey) -> Option<SocketAddr> {
        self.relay_addrs.remove(key).map(|(_, addr)| addr)
    }

    /// Drop relayed addresses of peers not in `keep`
    pub fn retain_peer_relay_addrs(&self, keep: impl Fn(&PeerKey) -> bool) {
        self.relay_addrs.retain(|key, _| keep(key));
    }

    // ============ Transports ============

    /// Install the shared proxy server transport
    pub fn set_proxy_server(&self, transport: Arc<dyn RelayTransport>) {
        write(&self.transports).server = Some(transport);
    }

    /// Shared proxy server transport
    #[must_use]
    pub fn proxy_server(&self) -> Option<Arc<dyn RelayTransport>> {
        read(&self.transports).server.clone()
    }

    /// Install the TURN session
    pub fn set_turn(&self, transport: Arc<dyn RelayTransport>) {
        write(&self.transports).turn = Some(transport);
    }

    /// TURN session, if one is established
    #[must_use]
    pub fn turn(&self) -> Option<Arc<dyn RelayTransport>> {
        read(&self.transports).turn.clone()
    }

    /// Transport carrying traffic for `mode`
    #[must_use]
    pub fn transport_for(&self, mode: ProxyMode) -> Option<Arc<dyn RelayTransport>> {
        match mode {
            ProxyMode::Direct => self.proxy_server(),
            ProxyMode::Turn => self.turn(),
        }
    }

    /// Tear everything down so the context can be reused.
    ///
    /// Connections are closed first, then the TURN session, then the proxy
    /// server.
    pub async fn reset(&self) {
        let conns: Vec<Conn> = {
            let mut peers = write(&self.peers);
            peers.by_hash.clear();
            peers.waiting.clear();
            peers.relayed.clear();
            peers.by_key.drain().map(|(_, conn)| conn).collect()
        };

        for conn in &conns {
            debug!("Closing connection to {} on reset", conn.key.short());
            conn.proxy.close().await;
        }

        let transports = std::mem::take(&mut *write(&self.transports));
        if let Some(turn) = transports.turn {
            if let Err(e) = turn.close().await {
                debug!("TURN close failed: {}", e);
            }
        }
        if let Some(server) = transports.server {
            if let Err(e) = server.close().await {
                debug!("Proxy server close failed: {}", e);
            }
        }

        self.peer_settings.clear();
        self.configs.clear();
        self.relay_addrs.clear();
        self.metrics.clear();
        self.set_epoch(0);

        info!("Proxy context reset ({} connections closed)", conns.len());
    }
}
