//! Runtime settings for the proxy subsystem.

use crate::error::ProxyError;
use std::borrow::Cow;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Proxy subsystem settings
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Local WireGuard listen port; peer connections dial 127.0.0.1 on it
    pub wg_listen_port: u16,

    /// Port the shared proxy server socket binds
    pub proxy_listen_port: u16,

    /// Address the shared proxy server socket binds
    pub proxy_bind_addr: IpAddr,

    /// Metric probe interval
    pub keepalive_interval: Duration,

    /// Upper bound on any single blocking socket read
    pub io_timeout: Duration,

    /// Maximum accepted age of a control-plane signal
    pub signal_freshness: Duration,

    /// A peer with no probe answer inside this window is disconnected
    pub metric_window: Duration,

    /// Largest datagram read from WireGuard
    pub max_packet_size: usize,

    /// Route symmetric-NAT peers through TURN when a session exists
    pub use_turn: bool,

    /// Manager event queue depth
    pub event_queue: usize,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            wg_listen_port: 51820,
            proxy_listen_port: 51722,
            proxy_bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            keepalive_interval: Duration::from_secs(20),
            io_timeout: Duration::from_secs(5),
            signal_freshness: Duration::from_secs(5),
            metric_window: Duration::from_secs(20),
            max_packet_size: 65535,
            use_turn: true,
            event_queue: 256,
        }
    }
}

impl ProxySettings {
    /// Validate settings
    ///
    /// # Errors
    ///
    /// Returns `ProxyError::InvalidConfig` for zero ports, intervals or sizes
    pub fn validate(&self) -> Result<(), ProxyError> {
        let invalid = |msg: &'static str| Err(ProxyError::InvalidConfig(Cow::Borrowed(msg)));

        if self.wg_listen_port == 0 {
            return invalid("wg_listen_port must be > 0");
        }
        if self.keepalive_interval.is_zero() {
            return invalid("keepalive_interval must be > 0");
        }
        if self.io_timeout.is_zero() {
            return invalid("io_timeout must be > 0");
        }
        if self.signal_freshness.is_zero() {
            return invalid("signal_freshness must be > 0");
        }
        if self.metric_window.is_zero() {
            return invalid("metric_window must be > 0");
        }
        if self.max_packet_size < 64 {
            return invalid("max_packet_size must be at least 64");
        }
        if self.event_queue == 0 {
            return invalid("event_queue must be > 0");
        }
        Ok(())
    }

    /// Age after which a probe echo no longer counts as connected.
    ///
    /// One `metric_window` plus `io_timeout` of grace, so an echo landing just
    /// after a sweep tick does not flap the flag.
    #[must_use]
    pub fn stale_after(&self) -> Duration {
        self.metric_window + self.io_timeout
    }
}
