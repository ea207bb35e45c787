//! Peer connections.
//!
//! A [`PeerConnection`] sits between the local WireGuard device and a relay
//! transport for one remote peer:
//!
//! ```text
//!  WireGuard ──► 127.0.0.1:<ephemeral> ──pump──► frame ──► transport ──► peer
//!  WireGuard ◄── 127.0.0.1:<ephemeral> ◄──deliver── demux ◄── transport ◄── peer
//! ```
//!
//! Starting a connection binds the loopback socket, dials it to the
//! WireGuard listen port and rewrites the peer's endpoint to that socket, so
//! WireGuard keeps encrypting and handshaking as usual. Closing restores the
//! original endpoint.
//!
//! State machine: `Idle → Starting → Active → (Resetting → Starting) → Closed`.
//!
//! Each start spawns a task group (pump and prober) that is fully joined on
//! close, so no task outlives the connection that started it.

use crate::context::ProxyContext;
use crate::error::{ProxyError, Result};
use crate::keys::{KeyHash, PeerKey};
use crate::packet::{ControlMessage, MetricProbe, TRAILER_LEN, frame_in_place};
use async_trait::async_trait;
use meshproxy_transport::RelayTransport;
use meshproxy_turn::Signal;
use std::io::ErrorKind;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time;
use tracing::{debug, info, trace, warn};

/// Relay path for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyMode {
    /// Through the shared proxy server socket
    Direct,
    /// Through the TURN allocation
    Turn,
}

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Never started
    Idle,
    /// Binding and rewriting the endpoint
    Starting,
    /// Pumping
    Active,
    /// Closing before a restart
    Resetting,
    /// Closed
    Closed,
}

/// Everything needed to run one peer connection.
///
/// Built by the manager and replaced wholesale on change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    /// This host's key
    pub local_key: PeerKey,
    /// Remote peer's key
    pub peer_key: PeerKey,
    /// Network scope
    pub network: String,
    /// Relay path
    pub mode: ProxyMode,
    /// Where framed packets are sent
    pub remote: SocketAddr,
    /// Local WireGuard listen address
    pub wg_addr: SocketAddr,
    /// Probe interval
    pub keepalive: Duration,
    /// Upper bound on one blocking read
    pub io_timeout: Duration,
    /// Largest datagram read from WireGuard
    pub max_packet_size: usize,
    /// Peer reached through a relay host
    pub is_relayed: bool,
}

impl ProxyConfig {
    /// Config for `peer_key` with the context's settings
    #[must_use]
    pub fn new(
        ctx: &ProxyContext,
        peer_key: PeerKey,
        network: impl Into<String>,
        mode: ProxyMode,
        remote: SocketAddr,
    ) -> Self {
        let settings = ctx.settings();
        Self {
            local_key: *ctx.local_key(),
            peer_key,
            network: network.into(),
            mode,
            remote,
            wg_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, settings.wg_listen_port)),
            keepalive: settings.keepalive_interval,
            io_timeout: settings.io_timeout,
            max_packet_size: settings.max_packet_size,
            is_relayed: false,
        }
    }

    /// Mark the peer as reached through a relay host
    #[must_use]
    pub fn relayed(mut self, is_relayed: bool) -> Self {
        self.is_relayed = is_relayed;
        self
    }
}

/// Lifecycle of one proxied peer
#[async_trait]
pub trait Proxy: Send + Sync {
    /// Bind, rewrite the WireGuard endpoint and start pumping.
    ///
    /// Returns the loopback address WireGuard now sends to.
    ///
    /// # Errors
    ///
    /// Returns a setup error if the socket cannot be bound, no transport
    /// exists for the mode, or the endpoint rewrite fails
    async fn start(&self) -> Result<SocketAddr>;

    /// Stop pumping and restore the endpoint. Idempotent.
    async fn close(&self);

    /// Close, pick up the latest config from the context and start again.
    ///
    /// # Errors
    ///
    /// Returns the error of the restart
    async fn reset(&self) -> Result<SocketAddr>;

    /// Hand a payload received from the peer to WireGuard
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidState` if not active, or the write error
    async fn deliver(&self, payload: &[u8]) -> Result<()>;

    /// Loopback address while active
    fn local_addr(&self) -> Option<SocketAddr>;

    /// False once the pump has stopped on an I/O error
    fn is_alive(&self) -> bool;

    /// Current state
    fn state(&self) -> ConnState;
}

struct Running {
    socket: Arc<UdpSocket>,
    cancel: watch::Sender<bool>,
    tasks: JoinSet<()>,
    original_endpoint: Option<SocketAddr>,
}

struct Shared {
    state: ConnState,
    config: ProxyConfig,
    running: Option<Running>,
}

/// [`Proxy`] over a loopback socket and a relay transport
pub struct PeerConnection {
    key: PeerKey,
    ctx: Weak<ProxyContext>,
    shared: Mutex<Shared>,
    alive: Arc<AtomicBool>,
    // Serializes start/close/reset so endpoint rewrites for this peer never overlap
    op: tokio::sync::Mutex<()>,
}

impl PeerConnection {
    /// New idle connection
    #[must_use]
    pub fn new(ctx: &Arc<ProxyContext>, config: ProxyConfig) -> Arc<Self> {
        Arc::new(Self {
            key: config.peer_key,
            ctx: Arc::downgrade(ctx),
            shared: Mutex::new(Shared {
                state: ConnState::Idle,
                config,
                running: None,
            }),
            alive: Arc::new(AtomicBool::new(false)),
            op: tokio::sync::Mutex::new(()),
        })
    }

    /// Config the connection is running with
    #[must_use]
    pub fn config(&self) -> ProxyConfig {
        self.lock().config.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: ConnState) {
        self.lock().state = state;
    }

    fn context(&self) -> Result<Arc<ProxyContext>> {
        self.ctx
            .upgrade()
            .ok_or(ProxyError::invalid_state("proxy context dropped"))
    }

    async fn start_locked(&self) -> Result<SocketAddr> {
        let config = {
            let mut shared = self.lock();
            match shared.state {
                ConnState::Active => {
                    if let Some(running) = &shared.running {
                        return running.socket.local_addr().map_err(Into::into);
                    }
                }
                ConnState::Starting => return Err(ProxyError::invalid_state("already starting")),
                _ => {}
            }
            shared.state = ConnState::Starting;
            shared.config.clone()
        };

        match self.spawn(&config).await {
            Ok((running, local_addr)) => {
                let mut shared = self.lock();
                shared.running = Some(running);
                shared.state = ConnState::Active;
                Ok(local_addr)
            }
            Err(e) => {
                self.set_state(ConnState::Idle);
                Err(e)
            }
        }
    }

    async fn spawn(&self, config: &ProxyConfig) -> Result<(Running, SocketAddr)> {
        let ctx = self.context()?;
        let transport = ctx.transport_for(config.mode).ok_or_else(|| {
            ProxyError::NoRelay(format!("{:?} mode", config.mode).into())
        })?;

        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .map_err(|e| ProxyError::SocketSetup(format!("bind: {e}").into()))?;
        socket
            .connect(config.wg_addr)
            .await
            .map_err(|e| ProxyError::SocketSetup(format!("dial {}: {e}", config.wg_addr).into()))?;
        let local_addr = socket.local_addr()?;

        let device = ctx.device();
        let original_endpoint = match device.get_peer(&self.key).await {
            Ok(info) => info.endpoint.filter(|ep| !ep.ip().is_loopback()),
            Err(e) if e.is_lookup() => None,
            Err(e) => return Err(e),
        };
        device
            .set_peer_endpoint(&self.key, local_addr)
            .await
            .map_err(|e| ProxyError::Device(format!("endpoint rewrite: {e}").into()))?;

        let socket = Arc::new(socket);
        let (cancel, cancel_rx) = watch::channel(false);
        self.alive.store(true, Ordering::Release);

        let mut tasks = JoinSet::new();
        tasks.spawn(pump(
            socket.clone(),
            transport.clone(),
            config.clone(),
            Arc::downgrade(&ctx),
            self.alive.clone(),
            cancel_rx.clone(),
        ));
        tasks.spawn(prober(
            transport,
            config.clone(),
            Arc::downgrade(&ctx),
            cancel_rx,
        ));

        info!(
            "Proxying {} via {:?}: {} -> {}",
            self.key.short(),
            config.mode,
            local_addr,
            config.remote
        );

        Ok((
            Running {
                socket,
                cancel,
                tasks,
                original_endpoint,
            },
            local_addr,
        ))
    }

    async fn close_locked(&self, final_state: ConnState) {
        let running = {
            let mut shared = self.lock();
            if matches!(shared.state, ConnState::Idle | ConnState::Closed) && shared.running.is_none()
            {
                shared.state = final_state;
                return;
            }
            shared.running.take()
        };

        let Some(mut running) = running else {
            self.set_state(final_state);
            return;
        };

        let _ = running.cancel.send(true);
        while running.tasks.join_next().await.is_some() {}
        self.alive.store(false, Ordering::Release);

        if let (Some(original), Ok(ctx)) = (running.original_endpoint, self.context()) {
            if let Err(e) = ctx.device().set_peer_endpoint(&self.key, original).await {
                warn!(
                    "Failed to restore endpoint of {} to {}: {}",
                    self.key.short(),
                    original,
                    e
                );
            }
        }

        self.set_state(final_state);
        debug!("Connection to {} closed", self.key.short());
    }
}

#[async_trait]
impl Proxy for PeerConnection {
    async fn start(&self) -> Result<SocketAddr> {
        let _op = self.op.lock().await;
        self.start_locked().await
    }

    async fn close(&self) {
        let _op = self.op.lock().await;
        self.close_locked(ConnState::Closed).await;
    }

    async fn reset(&self) -> Result<SocketAddr> {
        let _op = self.op.lock().await;
        self.set_state(ConnState::Resetting);
        self.close_locked(ConnState::Resetting).await;

        let ctx = self.context()?;
        if let Some(latest) = ctx.config(&self.key) {
            self.lock().config = latest;
        }

        let local_addr = self.start_locked().await?;
        let config = self.config();
        ctx.update_conn(&self.key, local_addr, &config);
        info!("Connection to {} reset toward {}", self.key.short(), config.remote);
        Ok(local_addr)
    }

    async fn deliver(&self, payload: &[u8]) -> Result<()> {
        let (socket, network) = {
            let shared = self.lock();
            match (&shared.state, &shared.running) {
                (ConnState::Active, Some(running)) => {
                    (running.socket.clone(), shared.config.network.clone())
                }
                _ => return Err(ProxyError::invalid_state("connection not active")),
            }
        };

        socket.send(payload).await?;
        if let Some(ctx) = self.ctx.upgrade() {
            ctx.metrics()
                .record_received(&network, &self.key, payload.len());
        }
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.lock()
            .running
            .as_ref()
            .and_then(|r| r.socket.local_addr().ok())
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn state(&self) -> ConnState {
        self.lock().state
    }
}

/// WireGuard → relay
async fn pump(
    socket: Arc<UdpSocket>,
    transport: Arc<dyn RelayTransport>,
    config: ProxyConfig,
    ctx: Weak<ProxyContext>,
    alive: Arc<AtomicBool>,
    mut cancel: watch::Receiver<bool>,
) {
    let sender = config.local_key.hash();
    let receiver: KeyHash = config.peer_key.hash();
    let mut buf = vec![0u8; config.max_packet_size + TRAILER_LEN];

    loop {
        let read = tokio::select! {
            _ = cancel.changed() => break,
            read = time::timeout(config.io_timeout, socket.recv(&mut buf[..config.max_packet_size])) => read,
        };

        let len = match read {
            Err(_) => continue,
            Ok(Ok(len)) => len,
            // Nothing listening on the WireGuard port yet
            Ok(Err(e)) if e.kind() == ErrorKind::ConnectionRefused => continue,
            Ok(Err(e)) => {
                warn!("Read from WireGuard for {} failed: {}", config.peer_key.short(), e);
                alive.store(false, Ordering::Release);
                break;
            }
        };

        let framed = match frame_in_place(&mut buf, len, &sender, &receiver) {
            Ok(framed) => framed,
            Err(e) => {
                debug!("Dropping packet for {}: {}", config.peer_key.short(), e);
                continue;
            }
        };

        if let Err(e) = transport.send_to(&buf[..framed], config.remote).await {
            warn!(
                "Relay send to {} for {} failed: {}",
                config.remote,
                config.peer_key.short(),
                e
            );
            alive.store(false, Ordering::Release);
            break;
        }

        trace!("Relayed {} bytes to {}", len, config.peer_key.short());
        if let Some(ctx) = ctx.upgrade() {
            ctx.metrics().record_sent(&config.network, &config.peer_key, len);
        }
    }
}

/// Periodic latency probe toward the peer
async fn prober(
    transport: Arc<dyn RelayTransport>,
    config: ProxyConfig,
    ctx: Weak<ProxyContext>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut ticker = time::interval(config.keepalive);
    let mut probe_id: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.changed() => break,
            _ = ticker.tick() => {}
        }

        let Some(epoch) = ctx.upgrade().map(|c| c.epoch()) else {
            break;
        };
        probe_id = probe_id.wrapping_add(1);

        let probe = ControlMessage::Metric(MetricProbe {
            probe_id,
            epoch,
            sender: config.local_key,
            receiver: config.peer_key,
            timestamp_ms: Signal::now_millis(),
        });
        if let Err(e) = transport.send_to(&probe.encode(), config.remote).await {
            debug!("Metric probe to {} failed: {}", config.peer_key.short(), e);
        }
    }
}
