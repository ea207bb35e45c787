//! TURN relay session.
//!
//! A [`TurnSession`] owns one allocation on a TURN server. It is shared by
//! every peer connection that needs the relay, through the
//! [`RelayTransport`] implementation: `send_to` wraps a datagram in a Send
//! indication (installing a permission for the peer first), `recv_from`
//! yields the payload of the next Data indication.
//!
//! Two background tasks run per session. The receiver dispatches
//! transaction responses, queues Data indications and answers Binding
//! requests from the server. The upkeep task refreshes the allocation at half
//! its lifetime and re-installs permissions before they expire.

use crate::config::{PERMISSION_REFRESH, TurnConfig};
use crate::error::{Result, TurnError};
use crate::stun::{
    MAX_DATA_LEN, StunAttribute, StunAuthentication, StunMessage, StunMessageClass, StunMethod,
    TRANSPORT_UDP,
};
use async_trait::async_trait;
use dashmap::DashMap;
use meshproxy_transport::{
    RelayTransport, StatsCounters, TransportError, TransportResult, TransportStats,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinSet;
use tokio::time::{self, interval_at};
use tracing::{debug, info, trace, warn};

/// Data indications buffered before the reader picks them up
const INBOUND_QUEUE: usize = 1024;

/// Challenge rounds (401/438) tolerated per request
const MAX_CHALLENGES: usize = 2;

type Inbound = (Vec<u8>, SocketAddr);

#[derive(Default)]
struct Challenge {
    realm: Option<String>,
    nonce: Option<String>,
}

struct Inner {
    socket: UdpSocket,
    server: SocketAddr,
    config: TurnConfig,
    credentials: StunAuthentication,
    challenge: Mutex<Challenge>,
    pending: DashMap<[u8; 12], oneshot::Sender<StunMessage>>,
    permissions: DashMap<IpAddr, Instant>,
    closed: AtomicBool,
    counters: StatsCounters,
}

impl Inner {
    /// Attach long-term credentials once the server has challenged us
    fn sign(&self, msg: &mut StunMessage) {
        let challenge = self.challenge.lock().unwrap_or_else(PoisonError::into_inner);
        let (Some(realm), Some(nonce)) = (&challenge.realm, &challenge.nonce) else {
            return;
        };

        msg.add_attribute(StunAttribute::Username(self.credentials.username.clone()));
        msg.add_attribute(StunAttribute::Realm(realm.clone()));
        msg.add_attribute(StunAttribute::Nonce(nonce.clone()));
        msg.add_message_integrity(&self.credentials.with_realm(realm.clone()));
    }

    fn accept_challenge(&self, response: &StunMessage) {
        let mut challenge = self.challenge.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(realm) = response.realm() {
            challenge.realm = Some(realm.to_string());
        }
        if let Some(nonce) = response.nonce() {
            challenge.nonce = Some(nonce.to_string());
        }
    }

    /// Send one transaction and wait for its response, retransmitting on timeout
    async fn round_trip(&self, msg: &StunMessage) -> Result<StunMessage> {
        let (tx, mut rx) = oneshot::channel();
        self.pending.insert(msg.transaction_id, tx);
        let bytes = msg.encode();

        let result = async {
            for attempt in 0..self.config.retries {
                self.socket.send_to(&bytes, self.server).await?;
                match time::timeout(self.config.request_timeout, &mut rx).await {
                    Ok(Ok(response)) => return Ok(response),
                    Ok(Err(_)) => return Err(TurnError::Closed),
                    Err(_) => trace!(
                        "{} to {} timed out (attempt {})",
                        msg.method.name(),
                        self.server,
                        attempt + 1
                    ),
                }
            }
            Err(TurnError::Unreachable(self.server))
        }
        .await;

        self.pending.remove(&msg.transaction_id);
        result
    }

    /// Authenticated request with challenge handling
    async fn request(
        &self,
        method: StunMethod,
        attributes: &[StunAttribute],
    ) -> Result<StunMessage> {
        let mut last_error = None;

        for _ in 0..=MAX_CHALLENGES {
            let mut msg = StunMessage::request(method);
            for attr in attributes {
                msg.add_attribute(attr.clone());
            }
            self.sign(&mut msg);

            let response = self.round_trip(&msg).await?;
            match response.class {
                StunMessageClass::SuccessResponse => return Ok(response),
                StunMessageClass::ErrorResponse => {
                    let (code, reason) = response
                        .error_code()
                        .map(|(c, r)| (c, r.to_string()))
                        .unwrap_or((0, String::new()));

                    // 401 Unauthorized, 438 Stale Nonce
                    if matches!(code, 401 | 438) && response.nonce().is_some() {
                        debug!("{} challenged with {}, retrying", method.name(), code);
                        self.accept_challenge(&response);
                        last_error = Some(TurnError::Rejected {
                            method: method.name(),
                            code,
                            reason,
                        });
                        continue;
                    }

                    return Err(TurnError::Rejected {
                        method: method.name(),
                        code,
                        reason,
                    });
                }
                _ => return Err(crate::error::StunError::InvalidMessageType.into()),
            }
        }

        Err(last_error.unwrap_or(TurnError::Unreachable(self.server)))
    }

    async fn allocate(&self) -> Result<(SocketAddr, Option<SocketAddr>, Duration)> {
        let response = self
            .request(
                StunMethod::Allocate,
                &[
                    StunAttribute::RequestedTransport(TRANSPORT_UDP),
                    StunAttribute::Lifetime(self.config.lifetime.as_secs() as u32),
                ],
            )
            .await?;

        let relayed = response
            .relayed_address()
            .ok_or(TurnError::NoRelayedAddress)?;
        let lifetime = response
            .lifetime()
            .map_or(self.config.lifetime, |secs| Duration::from_secs(u64::from(secs)));

        Ok((relayed, response.mapped_address(), lifetime))
    }

    async fn refresh(&self, lifetime: Duration) -> Result<Duration> {
        let response = self
            .request(
                StunMethod::Refresh,
                &[StunAttribute::Lifetime(lifetime.as_secs() as u32)],
            )
            .await?;
        Ok(response
            .lifetime()
            .map_or(lifetime, |secs| Duration::from_secs(u64::from(secs))))
    }

    async fn create_permission(&self, peers: &[IpAddr]) -> Result<()> {
        // Port is ignored by the server for permissions
        let attributes: Vec<_> = peers
            .iter()
            .map(|ip| StunAttribute::XorPeerAddress(SocketAddr::new(*ip, 0)))
            .collect();
        self.request(StunMethod::CreatePermission, &attributes)
            .await?;

        let now = Instant::now();
        for ip in peers {
            self.permissions.insert(*ip, now);
        }
        Ok(())
    }

    async fn ensure_permission(&self, ip: IpAddr) -> Result<()> {
        if self.permissions.contains_key(&ip) {
            return Ok(());
        }
        debug!("Installing TURN permission for {}", ip);
        self.create_permission(&[ip]).await
    }

    async fn answer_binding(&self, request: &StunMessage, from: SocketAddr) {
        let response = StunMessage::success_for(request)
            .with(StunAttribute::XorMappedAddress(from))
            .encode();
        if let Err(e) = self.socket.send_to(&response, from).await {
            debug!("Failed to answer binding request from {}: {}", from, e);
        }
    }
}

/// An allocation on a TURN server, usable as a shared relay transport.
pub struct TurnSession {
    inner: Arc<Inner>,
    relayed: SocketAddr,
    mapped: Option<SocketAddr>,
    inbound: tokio::sync::Mutex<mpsc::Receiver<Inbound>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Option<JoinSet<()>>>,
}

impl TurnSession {
    /// Allocate a relayed transport address on the configured server.
    ///
    /// # Errors
    ///
    /// Returns `TurnError` if the configuration is invalid, the server cannot
    /// be resolved or reached, or it rejects the allocation. No background task
    /// survives a failed attempt.
    pub async fn connect(config: TurnConfig) -> Result<Self> {
        config.validate()?;

        let server = time::timeout(config.request_timeout, tokio::net::lookup_host(&config.server))
            .await
            .map_err(|_| TurnError::Resolve(config.server.clone()))?
            .map_err(|e| TurnError::Resolve(format!("{}: {e}", config.server)))?
            .next()
            .ok_or_else(|| TurnError::Resolve(config.server.clone()))?;

        let socket = UdpSocket::bind(&config.bind_addr).await?;
        let credentials =
            StunAuthentication::new(config.username.clone(), config.password.as_str(), None);

        let inner = Arc::new(Inner {
            socket,
            server,
            config,
            credentials,
            challenge: Mutex::new(Challenge::default()),
            pending: DashMap::new(),
            permissions: DashMap::new(),
            closed: AtomicBool::new(false),
            counters: StatsCounters::new(),
        });

        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_QUEUE);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        tasks.spawn(receive_loop(inner.clone(), inbound_tx, shutdown_rx.clone()));

        let (relayed, mut mapped, lifetime) = match inner.allocate().await {
            Ok(allocation) => allocation,
            Err(e) => {
                let _ = shutdown_tx.send(true);
                tasks.shutdown().await;
                return Err(e);
            }
        };

        if mapped.is_none() {
            let binding = StunMessage::request(StunMethod::Binding);
            mapped = inner
                .round_trip(&binding)
                .await
                .ok()
                .and_then(|r| r.mapped_address());
        }

        tasks.spawn(upkeep_loop(inner.clone(), lifetime, shutdown_rx));

        info!(
            "TURN allocation on {}: relayed {} (lifetime {}s)",
            server,
            relayed,
            lifetime.as_secs()
        );

        Ok(Self {
            inner,
            relayed,
            mapped,
            inbound: tokio::sync::Mutex::new(inbound_rx),
            shutdown: shutdown_tx,
            tasks: Mutex::new(Some(tasks)),
        })
    }

    /// Relayed transport address peers send to
    #[must_use]
    pub fn relayed_address(&self) -> SocketAddr {
        self.relayed
    }

    /// Our address as observed by the server, when it reported one
    #[must_use]
    pub fn mapped_address(&self) -> Option<SocketAddr> {
        self.mapped
    }

    /// TURN server address
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.inner.server
    }

    /// Peer IPs with an installed permission
    #[must_use]
    pub fn permitted_peers(&self) -> Vec<IpAddr> {
        self.inner.permissions.iter().map(|e| *e.key()).collect()
    }
}

#[async_trait]
impl RelayTransport for TurnSession {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        if buf.len() > MAX_DATA_LEN {
            self.inner.counters.send_failed();
            return Err(TransportError::Relay(format!(
                "datagram of {} bytes exceeds TURN limit of {}",
                buf.len(),
                MAX_DATA_LEN
            )));
        }

        if let Err(e) = self.inner.ensure_permission(addr.ip()).await {
            self.inner.counters.send_failed();
            return Err(e.into());
        }

        let indication = StunMessage::new(StunMethod::Send, StunMessageClass::Indication)
            .with(StunAttribute::XorPeerAddress(addr))
            .with(StunAttribute::Data(buf.to_vec()))
            .encode();

        match self.inner.socket.send_to(&indication, self.inner.server).await {
            Ok(_) => {
                self.inner.counters.sent(buf.len());
                Ok(buf.len())
            }
            Err(e) => {
                self.inner.counters.send_failed();
                Err(TransportError::Io(e))
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        if self.inner.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let mut inbound = self.inbound.lock().await;
        let (data, from) = inbound.recv().await.ok_or(TransportError::Closed)?;

        let len = data.len().min(buf.len());
        buf[..len].copy_from_slice(&data[..len]);
        Ok((len, from))
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.relayed)
    }

    async fn close(&self) -> TransportResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        // Deallocate is a Refresh with zero lifetime; failure only means the
        // allocation times out on the server instead
        if let Err(e) = self
            .inner
            .request(StunMethod::Refresh, &[StunAttribute::Lifetime(0)])
            .await
        {
            debug!("TURN deallocate failed: {}", e);
        }

        let _ = self.shutdown.send(true);
        let tasks = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(mut tasks) = tasks {
            while tasks.join_next().await.is_some() {}
        }

        info!("TURN session on {} closed", self.inner.server);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Relaxed)
    }

    fn kind(&self) -> &'static str {
        "turn"
    }

    fn stats(&self) -> TransportStats {
        self.inner.counters.snapshot()
    }
}

impl Drop for TurnSession {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

async fn receive_loop(
    inner: Arc<Inner>,
    inbound: mpsc::Sender<Inbound>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 65536];

    loop {
        let (len, from) = tokio::select! {
            _ = shutdown.changed() => break,
            result = inner.socket.recv_from(&mut buf) => match result {
                Ok(received) => received,
                Err(e) => {
                    warn!("TURN socket receive error: {}", e);
                    continue;
                }
            },
        };

        if from != inner.server {
            trace!("Ignoring {} bytes from non-server {}", len, from);
            continue;
        }

        let Ok(msg) = StunMessage::decode(&buf[..len]) else {
            trace!("Dropping non-STUN datagram from TURN server");
            continue;
        };

        match (msg.method, msg.class) {
            (StunMethod::Data, StunMessageClass::Indication) => {
                let (Some(peer), Some(data)) = (msg.peer_address(), msg.data()) else {
                    continue;
                };
                inner.counters.received(data.len());
                if inbound.try_send((data.to_vec(), peer)).is_err() {
                    debug!("Inbound relay queue full, dropping datagram from {}", peer);
                }
            }
            (StunMethod::Binding, StunMessageClass::Request) => {
                inner.answer_binding(&msg, from).await;
            }
            (_, StunMessageClass::SuccessResponse | StunMessageClass::ErrorResponse) => {
                if let Some((_, waiter)) = inner.pending.remove(&msg.transaction_id) {
                    let _ = waiter.send(msg);
                }
            }
            _ => {}
        }
    }

    debug!("TURN receive loop stopped");
}

async fn upkeep_loop(inner: Arc<Inner>, lifetime: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut lifetime = lifetime;
    let half = (lifetime / 2).max(Duration::from_secs(1));
    let mut allocation_tick = interval_at(time::Instant::now() + half, half);
    let mut permission_tick = interval_at(
        time::Instant::now() + PERMISSION_REFRESH,
        PERMISSION_REFRESH,
    );

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = allocation_tick.tick() => {
                match inner.refresh(inner.config.lifetime).await {
                    Ok(granted) => {
                        lifetime = granted;
                        debug!("TURN allocation refreshed ({}s)", lifetime.as_secs());
                    }
                    Err(e) => warn!("TURN allocation refresh failed: {}", e),
                }
            }
            _ = permission_tick.tick() => {
                let stale: Vec<IpAddr> = inner
                    .permissions
                    .iter()
                    .filter(|e| e.value().elapsed() >= PERMISSION_REFRESH)
                    .map(|e| *e.key())
                    .collect();
                if stale.is_empty() {
                    continue;
                }
                if let Err(e) = inner.create_permission(&stale).await {
                    warn!("TURN permission refresh failed: {}", e);
                    for ip in &stale {
                        inner.permissions.remove(ip);
                    }
                }
            }
        }
    }

    debug!("TURN upkeep loop stopped");
}
