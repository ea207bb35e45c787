//! UDP transport for the shared proxy socket.
//!
//! Every directly proxied peer is reached through one of these, bound on the
//! proxy listen port. The socket is prepared through socket2 (buffer sizes)
//! before tokio takes it over. Address reuse stays off, so a port still held
//! by a live socket fails to bind.

use crate::transport::{RelayTransport, StatsCounters, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// Socket options applied at bind time
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// SO_RCVBUF
    pub recv_buffer: usize,
    /// SO_SNDBUF
    pub send_buffer: usize,
    /// SO_REUSEADDR; lets a second live socket share the port when set
    pub reuse_address: bool,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_buffer: 2 * 1024 * 1024,
            send_buffer: 2 * 1024 * 1024,
            reuse_address: false,
        }
    }
}

/// Shared proxy socket.
///
/// Clones share the socket, the counters and the closed flag. Closing wakes
/// the reader blocked in `recv_from`.
///
/// # Examples
///
/// ```no_run
/// use meshproxy_transport::{RelayTransport, UdpTransport};
/// use std::net::SocketAddr;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let addr: SocketAddr = "0.0.0.0:51722".parse()?;
/// let transport = UdpTransport::bind(addr).await?;
///
/// transport.send_to(b"framed", "203.0.113.7:51722".parse()?).await?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    closed: Arc<watch::Sender<bool>>,
    counters: Arc<StatsCounters>,
}

impl UdpTransport {
    /// Bind with default options
    ///
    /// # Errors
    /// Returns `TransportError::Bind` if the socket cannot be set up
    pub async fn bind(addr: impl Into<SocketAddr>) -> TransportResult<Self> {
        Self::bind_with(addr.into(), &SocketOptions::default())
    }

    /// Bind with explicit options
    ///
    /// # Errors
    /// Returns `TransportError::Bind` if the socket cannot be set up
    pub fn bind_with(addr: SocketAddr, options: &SocketOptions) -> TransportResult<Self> {
        let bind_err = |source| TransportError::Bind { addr, source };

        let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
            .map_err(bind_err)?;
        socket.set_reuse_address(options.reuse_address).map_err(bind_err)?;
        // Buffer sizes are a hint; the kernel may clamp them
        if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer) {
            tracing::debug!("SO_RCVBUF on {}: {}", addr, e);
        }
        if let Err(e) = socket.set_send_buffer_size(options.send_buffer) {
            tracing::debug!("SO_SNDBUF on {}: {}", addr, e);
        }
        socket.bind(&addr.into()).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(bind_err)?;
        tracing::debug!("UDP transport bound on {}", addr);

        Ok(Self {
            socket: Arc::new(socket),
            closed: Arc::new(watch::channel(false).0),
            counters: Arc::new(StatsCounters::new()),
        })
    }

    fn check_open(&self) -> TransportResult<()> {
        if *self.closed.borrow() {
            return Err(TransportError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl RelayTransport for UdpTransport {
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize> {
        self.check_open()?;

        match self.socket.send_to(buf, addr).await {
            Ok(sent) => {
                self.counters.sent(sent);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_failed();
                Err(e.into())
            }
        }
    }

    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => Err(TransportError::Closed),
            received = self.socket.recv_from(buf) => match received {
                Ok((len, from)) => {
                    self.counters.received(len);
                    Ok((len, from))
                }
                Err(e) => {
                    self.counters.recv_failed();
                    Err(e.into())
                }
            },
        }
    }

    fn local_addr(&self) -> TransportResult<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    async fn close(&self) -> TransportResult<()> {
        self.closed.send_replace(true);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn kind(&self) -> &'static str {
        "udp"
    }

    fn stats(&self) -> TransportStats {
        self.counters.snapshot()
    }
}
