//! Error types for the TURN client and signaling.

use meshproxy_transport::TransportError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// STUN/TURN message codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StunError {
    /// Message shorter than the 20-byte header
    #[error("Message too short")]
    MessageTooShort,

    /// Magic cookie mismatch or leading bits set
    #[error("Invalid magic cookie")]
    InvalidMagicCookie,

    /// Method not understood by this codec
    #[error("Invalid message type")]
    InvalidMessageType,

    /// Attribute value malformed
    #[error("Invalid attribute")]
    InvalidAttribute,

    /// Required attribute absent
    #[error("Missing attribute")]
    MissingAttribute,

    /// MESSAGE-INTEGRITY mismatch
    #[error("Authentication failed")]
    AuthenticationFailed,
}

/// TURN session errors
#[derive(Debug, Error)]
pub enum TurnError {
    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Codec error on a server response
    #[error("STUN error: {0}")]
    Stun(#[from] StunError),

    /// Server did not answer within the configured retries
    #[error("TURN server {0} unreachable")]
    Unreachable(SocketAddr),

    /// Server answered with an error response
    #[error("TURN server rejected {method}: {code} {reason}")]
    Rejected {
        /// Request method name
        method: &'static str,
        /// STUN error code
        code: u16,
        /// Reason phrase from the server
        reason: String,
    },

    /// Allocation succeeded but the response lacked a relayed address
    #[error("Allocation response missing XOR-RELAYED-ADDRESS")]
    NoRelayedAddress,

    /// Server address could not be resolved
    #[error("Cannot resolve TURN server {0}")]
    Resolve(String),

    /// Session already closed
    #[error("TURN session closed")]
    Closed,

    /// Invalid configuration
    #[error("Invalid TURN configuration: {0}")]
    Config(String),
}

impl TurnError {
    /// Returns true for failures a later attempt may not hit
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TurnError::Io(_) | TurnError::Unreachable(_) | TurnError::Resolve(_)
        )
    }
}

impl From<TurnError> for TransportError {
    fn from(err: TurnError) -> Self {
        match err {
            TurnError::Io(e) => TransportError::Io(e),
            TurnError::Closed => TransportError::Closed,
            other => TransportError::Relay(other.to_string()),
        }
    }
}

/// Signaling errors
#[derive(Debug, Error)]
pub enum SignalError {
    /// Signal could not be encoded or decoded
    #[error("Signal serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Outbound sink refused the signal
    #[error("Signal delivery failed: {0}")]
    Delivery(String),

    /// Signal timestamp outside the freshness window
    #[error("Stale signal from {0}")]
    Stale(String),

    /// Signal not addressed to this host
    #[error("Signal addressed to {0}")]
    Misaddressed(String),
}

/// Result type for TURN operations
pub type Result<T> = std::result::Result<T, TurnError>;
