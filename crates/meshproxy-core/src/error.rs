//! Error types for the proxy core
//!
//! Errors fall into the categories the proxy reacts to differently:
//!
//! - **Setup**: a connection or session could not be established (socket bind,
//!   endpoint rewrite, TURN allocation, missing device). Surfaced to the
//!   caller, never retried automatically; the peer stays un-proxied until the
//!   next snapshot.
//! - **Transient**: I/O on an established pump. Logged, ends only the affected
//!   task; the next reconciliation pass repairs the connection.
//! - **Protocol**: malformed frames. Dropped silently by the demultiplexer.
//! - **Lookup**: a key or hash not in the store. Means "nothing to do".

use crate::keys::KeyError;
use meshproxy_transport::TransportError;
use meshproxy_turn::{SignalError, TurnError};
use std::borrow::Cow;
use thiserror::Error;

/// Trailer or control message could not be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    /// Datagram too short or type tag mismatch
    #[error("frame not found")]
    FrameNotFound,

    /// Control message with the wrong length for its tag
    #[error("malformed control message")]
    Malformed,

    /// No room left for the trailer
    #[error("buffer too small for trailer")]
    BufferTooSmall,
}

/// Errors raised by the proxy core
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Local socket bind or dial failed
    #[error("Socket setup failed: {0}")]
    SocketSetup(Cow<'static, str>),

    /// WireGuard device refused an endpoint rewrite or lookup
    #[error("WireGuard device error: {0}")]
    Device(Cow<'static, str>),

    /// No WireGuard device registered with the context
    #[error("No WireGuard device available")]
    NoDevice,

    /// TURN session could not be established
    #[error("TURN setup failed: {0}")]
    TurnSetup(#[from] TurnError),

    /// No relay transport is available for the requested mode
    #[error("No relay available for {0}")]
    NoRelay(Cow<'static, str>),

    /// I/O failure on an established transport
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Control-plane signaling failed
    #[error("Signaling error: {0}")]
    Signal(#[from] SignalError),

    /// Wire protocol decoding failed
    #[error("Protocol error: {0}")]
    Frame(#[from] FrameError),

    /// Invalid key text
    #[error("Invalid key: {0}")]
    Key(#[from] KeyError),

    /// Peer not in the store
    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    /// Connection used in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    /// Manager loop or event queue is gone
    #[error("Channel error: {0}")]
    Channel(Cow<'static, str>),
}

impl ProxyError {
    /// Returns true for failures to establish a connection or session
    #[must_use]
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            ProxyError::SocketSetup(_)
                | ProxyError::Device(_)
                | ProxyError::NoDevice
                | ProxyError::TurnSetup(_)
                | ProxyError::NoRelay(_)
        )
    }

    /// Returns true for I/O failures a later pass may not hit
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, ProxyError::Transport(_) | ProxyError::Channel(_))
    }

    /// Returns true for lookups that found nothing
    #[must_use]
    pub fn is_lookup(&self) -> bool {
        matches!(self, ProxyError::PeerNotFound(_))
    }

    /// Create a socket setup error with static context
    #[must_use]
    pub const fn socket(context: &'static str) -> Self {
        ProxyError::SocketSetup(Cow::Borrowed(context))
    }

    /// Create an invalid state error with static context
    #[must_use]
    pub const fn invalid_state(context: &'static str) -> Self {
        ProxyError::InvalidState(Cow::Borrowed(context))
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::Transport(TransportError::Io(err))
    }
}

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;
