//! # meshproxy Core
//!
//! Relay proxy for mesh WireGuard hosts that cannot reach each other
//! directly.
//!
//! WireGuard is pointed at a loopback socket per proxied peer. Packets read
//! there get a 36-byte trailer naming sender and receiver by key hash and are
//! sent through either the shared proxy server socket or a TURN allocation.
//! On the receiving host a demultiplexer strips the trailer and hands the
//! packet to the right loopback socket, or forwards it unchanged when the
//! host relays for the receiver.
//!
//! ## Modules
//!
//! - [`packet`]: trailer framing and control messages
//! - [`keys`]: peer keys and their hashes
//! - [`conn`]: per-peer connection lifecycle
//! - [`context`]: shared state store
//! - [`demux`]: inbound routing
//! - [`manager`]: reconciliation against peer-list snapshots
//! - [`runtime`]: startup and shutdown of the whole subsystem

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod conn;
pub mod context;
pub mod demux;
pub mod device;
pub mod error;
pub mod keys;
pub mod manager;
pub mod metrics;
pub mod packet;
pub mod runtime;
pub mod update;

pub use config::ProxySettings;
pub use conn::{ConnState, PeerConnection, Proxy, ProxyConfig, ProxyMode};
pub use context::{Conn, PeerSettings, ProxyContext, RemotePeer};
pub use demux::{Demux, Dispatch};
pub use device::{MemoryDevice, PeerInfo, WireGuardDevice};
pub use error::{FrameError, ProxyError, Result};
pub use keys::{KeyHash, PeerKey};
pub use manager::{Manager, ManagerEvent, ReconcileReport};
pub use metrics::{MetricSample, MetricsStore, PeerMetric};
pub use packet::{ControlMessage, EndpointUpdate, Inbound, MetricProbe};
pub use runtime::{ProxyRuntime, RuntimeOptions};
pub use update::{HostPeerUpdate, NatType, PeerUpdate, RelayedPeer};
