//! # meshproxy Transport
//!
//! Datagram transport layer for the meshproxy relay proxy.
//!
//! This crate provides:
//! - The [`RelayTransport`] trait shared by every path that carries framed
//!   WireGuard traffic (the shared proxy socket and the TURN relay session)
//! - [`UdpTransport`], the shared proxy socket, set up through socket2
//! - [`StatsCounters`] for per-transport traffic accounting

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod transport;
pub mod udp;

pub use transport::{
    RelayTransport, StatsCounters, TransportError, TransportResult, TransportStats,
};
pub use udp::{SocketOptions, UdpTransport};
