//! Transport trait shared by every relay path.
//!
//! A peer connection never cares whether its framed packets leave through the
//! shared proxy socket or through a TURN allocation; both implement
//! [`RelayTransport`] and are handed to connections as `Arc<dyn RelayTransport>`.

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

/// Errors of a relay transport
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `close` was called
    #[error("transport closed")]
    Closed,

    /// The socket could not be set up on the address
    #[error("cannot bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Cause
        source: io::Error,
    },

    /// The relay refused or could not forward the datagram
    #[error("relay error: {0}")]
    Relay(String),
}

impl TransportError {
    /// True when the transport can no longer be used at all
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, TransportError::Closed)
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Datagram transport carrying framed traffic between relay endpoints.
///
/// `recv_from` is driven by exactly one reader (the demultiplexer for that
/// transport); `send_to` may be called concurrently by any number of peer
/// connections.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Send one datagram to a relay endpoint
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after `close`, or the send error
    async fn send_to(&self, buf: &[u8], addr: SocketAddr) -> TransportResult<usize>;

    /// Next datagram and the endpoint it came from
    ///
    /// # Errors
    /// Returns `TransportError::Closed` after `close`, or the receive error
    async fn recv_from(&self, buf: &mut [u8]) -> TransportResult<(usize, SocketAddr)>;

    /// Address peers send to in order to reach this transport.
    ///
    /// For a plain socket this is the bound address; for a TURN session it is
    /// the relayed transport address allocated on the server.
    ///
    /// # Errors
    /// Returns `TransportError` if the address cannot be determined
    fn local_addr(&self) -> TransportResult<SocketAddr>;

    /// Stop the transport. A pending `recv_from` returns `Closed`. Idempotent.
    ///
    /// # Errors
    /// Returns `TransportError` if releasing remote resources fails
    async fn close(&self) -> TransportResult<()>;

    /// True after `close`
    fn is_closed(&self) -> bool;

    /// Short name used in logs ("udp", "turn")
    fn kind(&self) -> &'static str;

    /// Traffic counters
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Point-in-time traffic counters of a transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Payload bytes sent
    pub bytes_sent: u64,
    /// Payload bytes received
    pub bytes_received: u64,
    /// Datagrams sent
    pub packets_sent: u64,
    /// Datagrams received
    pub packets_received: u64,
    /// Failed sends
    pub send_errors: u64,
    /// Failed receives
    pub recv_errors: u64,
}

/// Lock-free counters a transport updates from any task
#[derive(Debug, Default)]
pub struct StatsCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    send_errors: AtomicU64,
    recv_errors: AtomicU64,
}

impl StatsCounters {
    /// Zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one sent datagram of `bytes`
    pub fn sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Count one received datagram of `bytes`
    pub fn received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed send
    pub fn send_failed(&self) {
        self.send_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a failed receive
    pub fn recv_failed(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Current values
    #[must_use]
    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}
