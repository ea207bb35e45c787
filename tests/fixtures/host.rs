//! Single-host test fixture.
//!
//! A [`TestHost`] is one proxy context on loopback: an in-memory WireGuard
//! device, a UDP socket standing in for WireGuard's listen port, and
//! optionally a proxy server transport for manager-driven tests.

use async_trait::async_trait;
use meshproxy_core::{
    Conn, ConnState, HostPeerUpdate, MemoryDevice, NatType, PeerKey, PeerUpdate, Proxy,
    ProxyContext, ProxyMode, ProxySettings, Result,
};
use meshproxy_transport::UdpTransport;
use meshproxy_turn::{Signal, SignalError, SignalSink};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Deterministic key from a seed byte
pub fn key(seed: u8) -> PeerKey {
    PeerKey::from_bytes([seed; 32])
}

/// Endpoint WireGuard reports for a peer before any proxying
pub fn original_endpoint(seed: u8) -> SocketAddr {
    SocketAddr::from(([198, 51, 100, seed], 51820))
}

/// Settings suited to loopback tests
pub fn settings(wg_port: u16) -> ProxySettings {
    ProxySettings {
        wg_listen_port: wg_port,
        proxy_listen_port: 0,
        proxy_bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
        keepalive_interval: Duration::from_millis(200),
        io_timeout: Duration::from_millis(100),
        metric_window: Duration::from_secs(5),
        ..ProxySettings::default()
    }
}

/// One proxy host on loopback
pub struct TestHost {
    /// Host key
    pub key: PeerKey,
    /// Shared state
    pub ctx: Arc<ProxyContext>,
    /// WireGuard stand-in
    pub device: Arc<MemoryDevice>,
    /// Socket in place of WireGuard's listen port
    pub wg: UdpSocket,
}

impl TestHost {
    /// Host without any transport installed
    pub async fn new(seed: u8) -> Self {
        Self::with_settings(seed, |_| {}).await
    }

    /// Host with adjusted settings
    pub async fn with_settings(seed: u8, adjust: impl FnOnce(&mut ProxySettings)) -> Self {
        let wg = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let mut settings = settings(wg.local_addr().unwrap().port());
        adjust(&mut settings);

        let device = Arc::new(MemoryDevice::new());
        let key = key(seed);
        let ctx = ProxyContext::new(key, device.clone(), settings);
        Self {
            key,
            ctx,
            device,
            wg,
        }
    }

    /// Host with a loopback proxy server installed
    pub async fn with_server(seed: u8) -> Self {
        let host = Self::new(seed).await;
        host.install_server().await;
        host
    }

    /// Bind a fresh proxy server and install it
    pub async fn install_server(&self) -> SocketAddr {
        let server = UdpTransport::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
            .await
            .unwrap();
        let addr = meshproxy_transport::RelayTransport::local_addr(&server).unwrap();
        self.ctx.set_proxy_server(Arc::new(server));
        addr
    }

    /// Make the device know a peer, with its original endpoint
    pub fn add_device_peer(&self, seed: u8) -> PeerKey {
        let peer = key(seed);
        self.device.add_peer(peer, Some(original_endpoint(seed)));
        peer
    }

    /// Registered connection for a peer
    pub fn conn(&self, peer: &PeerKey) -> Option<Conn> {
        self.ctx.conn(peer)
    }

    /// Send a datagram from the WireGuard stand-in to a connection's loopback socket
    pub async fn wg_send(&self, peer: &PeerKey, payload: &[u8]) {
        let local = self.conn(peer).expect("connection").local_addr;
        self.wg.send_to(payload, local).await.unwrap();
    }

    /// Next datagram reaching the WireGuard stand-in
    pub async fn wg_recv(&self) -> Option<(Vec<u8>, SocketAddr)> {
        recv_timeout(&self.wg, Duration::from_secs(2)).await
    }
}

/// Peer entry reachable through its proxy server at `127.0.0.1:proxy_port`
pub fn proxied_peer(seed: u8, proxy_port: u16) -> PeerUpdate {
    PeerUpdate {
        public_key: key(seed),
        host_id: format!("host-{seed}"),
        network: "net".to_string(),
        endpoint: Some(SocketAddr::from((Ipv4Addr::LOCALHOST, 51820))),
        proxy_listen_port: proxy_port,
        nat_type: NatType::Public,
        proxy: true,
        is_relayed: false,
        relay_endpoint: None,
        is_relay: false,
        is_ingress_gateway: false,
        is_ext_client: false,
    }
}

/// Snapshot for `epoch` listing `peers`
pub fn snapshot(epoch: u32, peers: Vec<PeerUpdate>) -> HostPeerUpdate {
    HostPeerUpdate {
        host_id: "host-under-test".to_string(),
        epoch,
        peers,
        ..HostPeerUpdate::default()
    }
}

/// Receive one datagram or give up after `timeout`
pub async fn recv_timeout(socket: &UdpSocket, timeout: Duration) -> Option<(Vec<u8>, SocketAddr)> {
    let mut buf = vec![0u8; 65536];
    match tokio::time::timeout(timeout, socket.recv_from(&mut buf)).await {
        Ok(Ok((len, from))) => {
            buf.truncate(len);
            Some((buf, from))
        }
        _ => None,
    }
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// [`Proxy`] that only counts calls
#[derive(Default)]
pub struct StubProxy {
    /// `start` and `reset` calls
    pub starts: AtomicUsize,
    /// `close` calls
    pub closes: AtomicUsize,
}

#[async_trait]
impl Proxy for StubProxy {
    async fn start(&self) -> Result<SocketAddr> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(SocketAddr::from((Ipv4Addr::LOCALHOST, 40000)))
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }

    async fn reset(&self) -> Result<SocketAddr> {
        self.start().await
    }

    async fn deliver(&self, _payload: &[u8]) -> Result<()> {
        Ok(())
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    fn is_alive(&self) -> bool {
        true
    }

    fn state(&self) -> ConnState {
        ConnState::Active
    }
}

/// Conn record backed by a [`StubProxy`]
pub fn stub_conn(seed: u8, remote_port: u16) -> Conn {
    let key = key(seed);
    Conn {
        key,
        key_hash: key.hash(),
        network: "net".to_string(),
        mode: ProxyMode::Direct,
        remote: SocketAddr::from(([203, 0, 113, seed], remote_port)),
        local_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 40000 + u16::from(seed))),
        is_relayed: false,
        proxy: Arc::new(StubProxy::default()),
    }
}

/// Signal sink that hands every outbound signal to a channel
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Signal>,
}

impl ChannelSink {
    /// Sink and the receiving end of its channel
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<Signal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

#[async_trait]
impl SignalSink for ChannelSink {
    async fn send_signal(&self, signal: Signal) -> std::result::Result<(), SignalError> {
        self.tx
            .send(signal)
            .map_err(|_| SignalError::Delivery("receiver dropped".to_string()))
    }
}
