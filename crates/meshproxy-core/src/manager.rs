//! Reconciliation loop.
//!
//! The manager owns one FIFO queue. Peer-list snapshots, inbound signals and
//! demultiplexer notifications all go through it, so they are applied
//! strictly in arrival order by a single task.
//!
//! For each snapshot the manager computes the desired connection set and
//! drives the context toward it:
//!
//! 1. peers without a connection that need one are started
//! 2. connections whose peer vanished, stopped needing a proxy or switched
//!    relay path are closed and removed
//! 3. connections whose only change is the remote address, or whose pump
//!    died, are reset in place
//! 4. external clients without a connection wait until their first frame
//!
//! Applying the same snapshot twice changes nothing the second time.

use crate::conn::{PeerConnection, Proxy, ProxyConfig, ProxyMode};
use crate::context::{Conn, PeerSettings, ProxyContext, RemotePeer};
use crate::error::Result;
use crate::keys::PeerKey;
use crate::packet::{ControlMessage, EndpointUpdate};
use crate::update::{HostPeerUpdate, NatType, PeerUpdate};
use meshproxy_turn::{Signal, Signaler};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, info, warn};

/// Input to the manager queue
#[derive(Debug)]
pub enum ManagerEvent {
    /// Full peer list from the control plane
    Snapshot(HostPeerUpdate),
    /// Relay address signal from another host
    Signal(Signal),
    /// First frame seen from a waiting external client
    Promote {
        /// Client key
        key: PeerKey,
        /// Source address of the frame
        observed: SocketAddr,
        /// Transport the frame arrived on
        mode: ProxyMode,
    },
    /// Peer announced a new proxy port
    EndpointUpdate {
        /// Announcing peer
        key: PeerKey,
        /// New proxy port
        port: u16,
    },
    /// Stop the loop
    Shutdown,
}

/// Connection churn caused by one reconciliation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Connections started
    pub started: usize,
    /// Connections closed and removed
    pub closed: usize,
    /// Connections reset in place
    pub reset: usize,
    /// Starts or resets that failed
    pub failed: usize,
}

impl ReconcileReport {
    /// True when nothing changed
    #[must_use]
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// Decide the relay path for a peer, if any.
///
/// TURN is used when either side is behind a symmetric NAT and a session
/// exists; otherwise the peer's proxy flag selects the shared proxy server.
#[must_use]
pub fn route(
    host: &HostPeerUpdate,
    peer: &PeerUpdate,
    turn_available: bool,
    use_turn: bool,
) -> Option<ProxyMode> {
    let symmetric = host.nat_type == NatType::Symmetric || peer.nat_type == NatType::Symmetric;
    if use_turn && turn_available && symmetric {
        Some(ProxyMode::Turn)
    } else if peer.proxy {
        Some(ProxyMode::Direct)
    } else {
        None
    }
}

struct Plan {
    desired: HashMap<PeerKey, ProxyConfig>,
    waiting: Vec<RemotePeer>,
    need_relay: Vec<(String, PeerKey)>,
}

/// Drives the context toward each snapshot
pub struct Manager {
    ctx: Arc<ProxyContext>,
    signaler: Option<Signaler>,
    last: Option<HostPeerUpdate>,
    port_overrides: HashMap<PeerKey, u16>,
    requested: HashMap<PeerKey, Instant>,
}

impl Manager {
    /// Manager over `ctx`; without a signaler TURN peers cannot be set up
    #[must_use]
    pub fn new(ctx: Arc<ProxyContext>, signaler: Option<Signaler>) -> Self {
        Self {
            ctx,
            signaler,
            last: None,
            port_overrides: HashMap::new(),
            requested: HashMap::new(),
        }
    }

    /// Most recently applied snapshot
    #[must_use]
    pub fn last_snapshot(&self) -> Option<&HostPeerUpdate> {
        self.last.as_ref()
    }

    /// Process events until `Shutdown` or until every sender is gone
    pub async fn run(mut self, mut events: mpsc::Receiver<ManagerEvent>) {
        let mut sweep = time::interval(self.ctx.settings().metric_window);
        let stale_after = self.ctx.settings().stale_after();

        loop {
            tokio::select! {
                biased;
                event = events.recv() => match event {
                    Some(ManagerEvent::Shutdown) | None => break,
                    Some(event) => self.handle(event).await,
                },
                _ = sweep.tick() => {
                    let stale = self.ctx.metrics().sweep(stale_after);
                    if stale > 0 {
                        debug!("{} peers marked disconnected", stale);
                    }
                }
            }
        }

        info!("Manager loop stopped");
    }

    /// Apply one event
    pub async fn handle(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::Snapshot(update) => {
                let report = self.reconcile(update).await;
                if !report.is_noop() {
                    info!(
                        "Reconciled: {} started, {} closed, {} reset, {} failed",
                        report.started, report.closed, report.reset, report.failed
                    );
                }
            }
            ManagerEvent::Signal(signal) => self.on_signal(signal).await,
            ManagerEvent::Promote {
                key,
                observed,
                mode,
            } => self.on_promote(key, observed, mode).await,
            ManagerEvent::EndpointUpdate { key, port } => self.on_endpoint_update(key, port).await,
            ManagerEvent::Shutdown => {}
        }
    }

    /// Drive the connection set toward `update`
    pub async fn reconcile(&mut self, update: HostPeerUpdate) -> ReconcileReport {
        let ctx = self.ctx.clone();
        let mut report = ReconcileReport::default();

        ctx.set_epoch(update.epoch);
        if update.is_relay {
            ctx.set_relayed(
                update
                    .relayed_peers
                    .iter()
                    .map(|r| (r.public_key, r.endpoint)),
            );
        } else {
            ctx.set_relayed(std::iter::empty());
        }

        let present: HashSet<PeerKey> = update.peers.iter().map(|p| p.public_key).collect();
        for peer in &update.peers {
            ctx.set_peer_settings(
                peer.public_key,
                PeerSettings {
                    is_relay: peer.is_relay,
                    is_ingress_gateway: peer.is_ingress_gateway,
                    is_relayed: peer.is_relayed,
                    relay_to: peer.relay_endpoint,
                    nat_type: peer.nat_type,
                },
            );
        }
        ctx.retain_peer_settings(|key| present.contains(key));
        ctx.retain_peer_relay_addrs(|key| present.contains(key));
        self.port_overrides.retain(|key, _| present.contains(key));
        self.requested.retain(|key, _| present.contains(key));

        let plan = self.plan(&update);

        for conn in ctx.conns() {
            match plan.desired.get(&conn.key) {
                None => {
                    debug!("Removing connection to {}", conn.key.short());
                    self.remove(&conn).await;
                    report.closed += 1;
                }
                Some(config) if config.mode != conn.mode => {
                    debug!(
                        "Relay path for {} changed {:?} -> {:?}",
                        conn.key.short(),
                        conn.mode,
                        config.mode
                    );
                    self.remove(&conn).await;
                    report.closed += 1;
                }
                Some(config)
                    if config.remote != conn.remote
                        || config.is_relayed != conn.is_relayed
                        || !conn.proxy.is_alive() =>
                {
                    ctx.set_config(config.clone());
                    match conn.proxy.reset().await {
                        Ok(_) => report.reset += 1,
                        Err(e) => {
                            warn!("Reset of {} failed: {}", conn.key.short(), e);
                            self.remove(&conn).await;
                            report.failed += 1;
                        }
                    }
                }
                Some(_) => {}
            }
        }

        // Pumps of departed peers are joined by now
        ctx.metrics().retain_peers(|key| present.contains(key));

        let advertised = (update.proxy_listen_port != 0).then_some(update.proxy_listen_port);
        for (key, config) in plan.desired {
            if ctx.conn(&key).is_some() {
                continue;
            }
            match self.add(config, advertised).await {
                Ok(()) => report.started += 1,
                Err(e) => {
                    warn!("Cannot proxy {}: {}", key.short(), e);
                    report.failed += 1;
                }
            }
        }

        ctx.set_waiting(plan.waiting);

        for (host_id, key) in plan.need_relay {
            self.request_relay_address(&host_id, key).await;
        }

        self.last = Some(update);
        report
    }

    fn plan(&self, update: &HostPeerUpdate) -> Plan {
        let ctx = &self.ctx;
        let turn_available = ctx.turn().is_some();
        let use_turn = ctx.settings().use_turn;

        let mut plan = Plan {
            desired: HashMap::new(),
            waiting: Vec::new(),
            need_relay: Vec::new(),
        };

        for peer in &update.peers {
            let key = peer.public_key;

            if peer.is_ext_client {
                match ctx.conn(&key).and_then(|_| ctx.config(&key)) {
                    Some(config) => {
                        plan.desired.insert(key, config);
                    }
                    None => plan.waiting.push(RemotePeer {
                        key,
                        network: peer.network.clone(),
                        endpoint: peer.endpoint,
                    }),
                }
                continue;
            }

            let Some(mode) = route(update, peer, turn_available, use_turn) else {
                continue;
            };

            let remote = match mode {
                ProxyMode::Turn => match ctx.peer_relay_addr(&key) {
                    Some(addr) => addr,
                    None => {
                        plan.need_relay.push((peer.host_id.clone(), key));
                        continue;
                    }
                },
                ProxyMode::Direct => {
                    let target = if peer.is_relayed {
                        peer.relay_endpoint
                    } else {
                        peer.proxy_addr().map(|addr| match self.port_overrides.get(&key) {
                            Some(port) => SocketAddr::new(addr.ip(), *port),
                            None => addr,
                        })
                    };
                    match target {
                        Some(addr) => addr,
                        None => {
                            debug!("No endpoint for {}, not proxying", key.short());
                            continue;
                        }
                    }
                }
            };

            let config = ProxyConfig::new(ctx, key, peer.network.clone(), mode, remote)
                .relayed(peer.is_relayed);
            plan.desired.insert(key, config);
        }

        plan
    }

    async fn add(&self, config: ProxyConfig, advertised: Option<u16>) -> Result<()> {
        let ctx = &self.ctx;
        let key = config.peer_key;
        ctx.set_config(config.clone());

        let proxy = PeerConnection::new(ctx, config.clone());
        let local_addr = match proxy.start().await {
            Ok(addr) => addr,
            Err(e) => {
                ctx.remove_config(&key);
                return Err(e);
            }
        };

        ctx.register(Conn {
            key,
            key_hash: key.hash(),
            network: config.network.clone(),
            mode: config.mode,
            remote: config.remote,
            local_addr,
            is_relayed: config.is_relayed,
            proxy,
        });

        if config.mode == ProxyMode::Direct {
            self.announce_port(&config, advertised).await;
        }
        Ok(())
    }

    /// Tell the peer our real proxy port when it differs from the advertised one
    async fn announce_port(&self, config: &ProxyConfig, advertised: Option<u16>) {
        let Some(server) = self.ctx.proxy_server() else {
            return;
        };
        let Ok(bound) = server.local_addr() else {
            return;
        };
        if advertised.is_none_or(|port| port == bound.port()) {
            return;
        }

        let update = ControlMessage::EndpointUpdate(EndpointUpdate {
            epoch: self.ctx.epoch(),
            sender: config.local_key,
            receiver: config.peer_key,
            port: u32::from(bound.port()),
        });
        match server.send_to(&update.encode(), config.remote).await {
            Ok(_) => debug!(
                "Announced proxy port {} to {}",
                bound.port(),
                config.peer_key.short()
            ),
            Err(e) => debug!("Endpoint update to {} failed: {}", config.remote, e),
        }
    }

    async fn remove(&self, conn: &Conn) {
        self.ctx.remove(&conn.key);
        self.ctx.remove_config(&conn.key);
        conn.proxy.close().await;
    }

    async fn request_relay_address(&mut self, host_id: &str, key: PeerKey) {
        let (Some(signaler), Some(turn)) = (&self.signaler, self.ctx.turn()) else {
            return;
        };
        let Ok(relay) = turn.local_addr() else {
            return;
        };

        let window = self.ctx.settings().signal_freshness;
        if self
            .requested
            .get(&key)
            .is_some_and(|at| at.elapsed() < window)
        {
            return;
        }

        match signaler
            .exchange_relay_address(host_id, &key.to_base64(), relay)
            .await
        {
            Ok(_) => {
                self.requested.insert(key, Instant::now());
            }
            Err(e) => warn!("Relay address request to {} failed: {}", host_id, e),
        }
    }

    async fn on_signal(&mut self, signal: Signal) {
        let Some(signaler) = &self.signaler else {
            return;
        };
        if let Err(e) = signaler.accept(&signal) {
            debug!("Ignoring signal: {}", e);
            return;
        }
        let Ok(key) = signal.from_key.parse::<PeerKey>() else {
            debug!("Signal with invalid sender key from {}", signal.from_host_id);
            return;
        };

        if !signal.reply {
            if let Some(relay) = self.ctx.turn().and_then(|t| t.local_addr().ok()) {
                if let Err(e) = signaler.answer(&signal, relay).await {
                    warn!("Answering {} failed: {}", signal.from_host_id, e);
                }
            }
        }

        let Some(relay) = signal.relay_addr() else {
            return;
        };

        // Replies are matched by peer key; apply only while the peer still needs TURN
        let turn_available = self.ctx.turn().is_some();
        let use_turn = self.ctx.settings().use_turn;
        let relevant = self.last.as_ref().is_some_and(|update| {
            update
                .peer(&key)
                .is_some_and(|peer| route(update, peer, turn_available, use_turn) == Some(ProxyMode::Turn))
        });
        if !relevant {
            debug!("Relay address from {} not needed", key.short());
            return;
        }
        if self.ctx.peer_relay_addr(&key) == Some(relay) {
            return;
        }

        info!("Relay address of {} is {}", key.short(), relay);
        self.ctx.set_peer_relay_addr(key, relay);
        self.requested.remove(&key);

        if let Some(update) = self.last.clone() {
            self.reconcile(update).await;
        }
    }

    async fn on_promote(&mut self, key: PeerKey, observed: SocketAddr, mode: ProxyMode) {
        let Some(waiting) = self.ctx.take_waiting(&key) else {
            return;
        };
        if self.ctx.conn(&key).is_some() {
            return;
        }

        let config = ProxyConfig::new(&self.ctx, key, waiting.network, mode, observed);
        match self.add(config, None).await {
            Ok(()) => info!("External client {} connected from {}", key.short(), observed),
            Err(e) => warn!("Cannot proxy external client {}: {}", key.short(), e),
        }
    }

    async fn on_endpoint_update(&mut self, key: PeerKey, port: u16) {
        let Some(conn) = self.ctx.conn(&key) else {
            return;
        };
        if conn.mode != ProxyMode::Direct || conn.is_relayed || conn.remote.port() == port {
            return;
        }

        self.port_overrides.insert(key, port);
        let Some(mut config) = self.ctx.config(&key) else {
            return;
        };
        config.remote = SocketAddr::new(conn.remote.ip(), port);
        self.ctx.set_config(config);

        match conn.proxy.reset().await {
            Ok(_) => info!("{} moved to proxy port {}", key.short(), port),
            Err(e) => {
                warn!("Reset of {} after endpoint update failed: {}", key.short(), e);
                self.remove(&conn).await;
            }
        }
    }
}
