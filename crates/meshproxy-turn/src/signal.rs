//! Relay address exchange over the control plane.
//!
//! Before two hosts can reach each other through TURN, each must learn the
//! other's relayed address. That exchange happens out of band: a [`Signal`] is
//! handed to a [`SignalSink`] (the control-plane connection) and the peer
//! answers with a reply carrying its own address.
//!
//! Replies carry no request token. They are matched by the sender's peer key,
//! so a late reply for a peer that is still relevant is applied and any other
//! is discarded by the caller.

use crate::error::SignalError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Signal action tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    /// Relay address negotiation for a TURN connection
    ConnNegotiation,
}

/// Control-plane signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signal {
    /// Sending host
    pub from_host_id: String,
    /// Receiving host
    pub to_host_id: String,
    /// Sender's WireGuard public key (base64)
    pub from_key: String,
    /// Receiver's WireGuard public key (base64)
    pub to_key: String,
    /// Action
    pub action: SignalAction,
    /// Sender's relayed transport address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_address: Option<String>,
    /// True when answering a request
    #[serde(default)]
    pub reply: bool,
    /// Unix time in milliseconds
    pub timestamp: u64,
}

impl Signal {
    /// Milliseconds since the Unix epoch
    #[must_use]
    pub fn now_millis() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }

    /// Age relative to `now_ms`; signals from the future count as fresh
    #[must_use]
    pub fn age(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.timestamp))
    }

    /// True if the signal is no older than `window`
    #[must_use]
    pub fn is_fresh(&self, window: Duration) -> bool {
        self.age(Self::now_millis()) <= window
    }

    /// Parsed relay address, if present and well formed
    #[must_use]
    pub fn relay_addr(&self) -> Option<SocketAddr> {
        self.relay_address.as_deref()?.parse().ok()
    }

    /// Encode as JSON
    ///
    /// # Errors
    ///
    /// Returns `SignalError::Serialization` on encoding failure
    pub fn to_json(&self) -> Result<String, SignalError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode from JSON
    ///
    /// # Errors
    ///
    /// Returns `SignalError::Serialization` on malformed input
    pub fn from_json(text: &str) -> Result<Self, SignalError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Outbound side of the control plane
#[async_trait]
pub trait SignalSink: Send + Sync {
    /// Deliver a signal to its destination host
    ///
    /// # Errors
    ///
    /// Returns `SignalError::Delivery` when the control plane is unavailable
    async fn send_signal(&self, signal: Signal) -> Result<(), SignalError>;
}

/// Builds, validates and answers relay address signals for one host
#[derive(Clone)]
pub struct Signaler {
    host_id: String,
    local_key: String,
    sink: Arc<dyn SignalSink>,
    freshness: Duration,
}

impl Signaler {
    /// Create a signaler for this host
    #[must_use]
    pub fn new(
        host_id: impl Into<String>,
        local_key: impl Into<String>,
        sink: Arc<dyn SignalSink>,
        freshness: Duration,
    ) -> Self {
        Self {
            host_id: host_id.into(),
            local_key: local_key.into(),
            sink,
            freshness,
        }
    }

    /// This host's id
    #[must_use]
    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Tell `peer_key` our relayed address and ask for theirs.
    ///
    /// Returns the signal that was sent.
    ///
    /// # Errors
    ///
    /// Returns `SignalError::Delivery` if the sink refuses it
    pub async fn exchange_relay_address(
        &self,
        peer_host_id: &str,
        peer_key: &str,
        relay_addr: SocketAddr,
    ) -> Result<Signal, SignalError> {
        let signal = self.build(peer_host_id, peer_key, relay_addr, false);
        debug!("Requesting relay address from host {}", peer_host_id);
        self.sink.send_signal(signal.clone()).await?;
        Ok(signal)
    }

    /// Answer a request with our relayed address
    ///
    /// # Errors
    ///
    /// Returns `SignalError::Delivery` if the sink refuses it
    pub async fn answer(&self, request: &Signal, relay_addr: SocketAddr) -> Result<(), SignalError> {
        let reply = self.build(&request.from_host_id, &request.from_key, relay_addr, true);
        self.sink.send_signal(reply).await
    }

    /// Check an inbound signal before acting on it
    ///
    /// # Errors
    ///
    /// Returns `SignalError::Stale` outside the freshness window and
    /// `SignalError::Misaddressed` when it names another host or key
    pub fn accept(&self, signal: &Signal) -> Result<(), SignalError> {
        if signal.to_host_id != self.host_id || signal.to_key != self.local_key {
            return Err(SignalError::Misaddressed(signal.to_host_id.clone()));
        }
        if !signal.is_fresh(self.freshness) {
            return Err(SignalError::Stale(signal.from_host_id.clone()));
        }
        Ok(())
    }

    fn build(&self, peer_host_id: &str, peer_key: &str, relay_addr: SocketAddr, reply: bool) -> Signal {
        Signal {
            from_host_id: self.host_id.clone(),
            to_host_id: peer_host_id.to_string(),
            from_key: self.local_key.clone(),
            to_key: peer_key.to_string(),
            action: SignalAction::ConnNegotiation,
            relay_address: Some(relay_addr.to_string()),
            reply,
            timestamp: Signal::now_millis(),
        }
    }
}
