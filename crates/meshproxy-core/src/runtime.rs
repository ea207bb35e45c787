//! Subsystem lifecycle.
//!
//! [`ProxyRuntime::start`] binds the shared proxy server, optionally
//! allocates a TURN relay, and spawns one demultiplexer per transport plus
//! the manager loop. [`ProxyRuntime::shutdown`] stops them in reverse:
//! manager, demultiplexers, peer connections, TURN session, proxy server.

use crate::conn::ProxyMode;
use crate::context::ProxyContext;
use crate::demux::Demux;
use crate::error::{ProxyError, Result};
use crate::manager::{Manager, ManagerEvent};
use crate::update::HostPeerUpdate;
use meshproxy_transport::{RelayTransport, UdpTransport};
use meshproxy_turn::{Signal, SignalSink, Signaler, TurnConfig, TurnSession};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{info, warn};

/// Optional collaborators of the runtime
#[derive(Default)]
pub struct RuntimeOptions {
    /// Control-plane id of this host
    pub host_id: String,
    /// TURN server to allocate on; `None` disables TURN
    pub turn: Option<TurnConfig>,
    /// Where outbound signals go; required for TURN peers
    pub signal_sink: Option<Arc<dyn SignalSink>>,
}

impl fmt::Debug for RuntimeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeOptions")
            .field("host_id", &self.host_id)
            .field("turn", &self.turn.as_ref().map(|t| &t.server))
            .field("signal_sink", &self.signal_sink.is_some())
            .finish()
    }
}

/// A running proxy subsystem
pub struct ProxyRuntime {
    ctx: Arc<ProxyContext>,
    events: mpsc::Sender<ManagerEvent>,
    stop: watch::Sender<bool>,
    manager: JoinHandle<()>,
    demux: JoinSet<()>,
    server_addr: SocketAddr,
}

impl ProxyRuntime {
    /// Bind the proxy server and start every background task.
    ///
    /// A TURN allocation failure is logged and the runtime continues without
    /// TURN; peers that would need it stay un-proxied.
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidConfig` for bad settings and
    /// `ProxyError::SocketSetup` if the proxy server cannot bind
    pub async fn start(ctx: Arc<ProxyContext>, options: RuntimeOptions) -> Result<Self> {
        let settings = ctx.settings().clone();
        settings.validate()?;

        let bind = SocketAddr::new(settings.proxy_bind_addr, settings.proxy_listen_port);
        let server = UdpTransport::bind(bind)
            .await
            .map_err(|e| ProxyError::SocketSetup(format!("proxy server {bind}: {e}").into()))?;
        let server_addr = server.local_addr()?;
        let server: Arc<dyn RelayTransport> = Arc::new(server);
        ctx.set_proxy_server(server.clone());
        info!("Proxy server listening on {}", server_addr);

        let turn = match options.turn {
            Some(config) if settings.use_turn => match TurnSession::connect(config).await {
                Ok(session) => {
                    let session: Arc<dyn RelayTransport> = Arc::new(session);
                    ctx.set_turn(session.clone());
                    Some(session)
                }
                Err(e) => {
                    warn!("TURN unavailable, continuing without relay: {}", e);
                    None
                }
            },
            _ => None,
        };

        let (events_tx, events_rx) = mpsc::channel(settings.event_queue);
        let (stop, stop_rx) = watch::channel(false);

        let mut demux = JoinSet::new();
        demux.spawn(
            Demux::new(ctx.clone(), server, ProxyMode::Direct, events_tx.clone())
                .run(stop_rx.clone()),
        );
        if let Some(turn) = turn {
            demux.spawn(Demux::new(ctx.clone(), turn, ProxyMode::Turn, events_tx.clone()).run(stop_rx));
        }

        let signaler = options.signal_sink.map(|sink| {
            Signaler::new(
                options.host_id,
                ctx.local_key().to_base64(),
                sink,
                settings.signal_freshness,
            )
        });
        let manager = tokio::spawn(Manager::new(ctx.clone(), signaler).run(events_rx));

        Ok(Self {
            ctx,
            events: events_tx,
            stop,
            manager,
            demux,
            server_addr,
        })
    }

    /// Shared state
    #[must_use]
    pub fn context(&self) -> &Arc<ProxyContext> {
        &self.ctx
    }

    /// Address the proxy server is bound to
    #[must_use]
    pub fn server_addr(&self) -> SocketAddr {
        self.server_addr
    }

    /// True when a TURN session is up
    #[must_use]
    pub fn has_turn(&self) -> bool {
        self.ctx.turn().is_some()
    }

    /// Handle for feeding the manager queue
    #[must_use]
    pub fn events(&self) -> mpsc::Sender<ManagerEvent> {
        self.events.clone()
    }

    /// Queue a peer-list snapshot
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Channel` once the manager has stopped
    pub async fn apply(&self, update: HostPeerUpdate) -> Result<()> {
        self.send(ManagerEvent::Snapshot(update)).await
    }

    /// Queue an inbound signal
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::Channel` once the manager has stopped
    pub async fn signal(&self, signal: Signal) -> Result<()> {
        self.send(ManagerEvent::Signal(signal)).await
    }

    async fn send(&self, event: ManagerEvent) -> Result<()> {
        self.events
            .send(event)
            .await
            .map_err(|_| ProxyError::Channel("manager stopped".into()))
    }

    /// Stop everything and reset the context
    pub async fn shutdown(mut self) {
        let _ = self.events.send(ManagerEvent::Shutdown).await;
        if let Err(e) = self.manager.await {
            warn!("Manager task ended abnormally: {}", e);
        }

        let _ = self.stop.send(true);
        while self.demux.join_next().await.is_some() {}

        self.ctx.reset().await;
        info!("Proxy runtime stopped");
    }
}
