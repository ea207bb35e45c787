//! Per-peer traffic and latency metrics.
//!
//! Entries are keyed by `(network, peer)`. The pumps add byte counts, probe
//! echoes set latency and connectivity, and a periodic sweep marks peers
//! without a recent echo as disconnected. Counters are only ever reset
//! explicitly. Consumers poll [`MetricsStore::snapshot`].

use crate::keys::PeerKey;
use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Metrics for one peer
#[derive(Debug, Clone, Default)]
pub struct PeerMetric {
    /// Last measured round-trip time
    pub latency: Option<Duration>,
    /// Probe answered within the window
    pub connected: bool,
    /// Bytes relayed to the peer
    pub bytes_sent: u64,
    /// Bytes relayed from the peer
    pub bytes_received: u64,
    /// When the last probe echo arrived
    pub last_probe: Option<Instant>,
}

/// Serializable view of one entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricSample {
    /// Network scope
    pub network: String,
    /// Peer key
    pub peer: PeerKey,
    /// Round-trip time in milliseconds
    pub latency_ms: Option<u64>,
    /// Connectivity flag
    pub connected: bool,
    /// Bytes relayed to the peer
    pub bytes_sent: u64,
    /// Bytes relayed from the peer
    pub bytes_received: u64,
}

/// Concurrent metrics table
#[derive(Debug, Default)]
pub struct MetricsStore {
    entries: DashMap<(String, PeerKey), PeerMetric>,
}

impl MetricsStore {
    /// Empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count bytes sent toward a peer
    pub fn record_sent(&self, network: &str, peer: &PeerKey, bytes: usize) {
        self.entries
            .entry((network.to_string(), *peer))
            .or_default()
            .bytes_sent += bytes as u64;
    }

    /// Count bytes received from a peer
    pub fn record_received(&self, network: &str, peer: &PeerKey, bytes: usize) {
        self.entries
            .entry((network.to_string(), *peer))
            .or_default()
            .bytes_received += bytes as u64;
    }

    /// Record a probe echo
    pub fn record_latency(&self, network: &str, peer: &PeerKey, rtt: Duration) {
        let mut entry = self.entries.entry((network.to_string(), *peer)).or_default();
        entry.latency = Some(rtt);
        entry.connected = true;
        entry.last_probe = Some(Instant::now());
    }

    /// Mark entries without an echo inside `window` as disconnected.
    ///
    /// Returns how many entries changed.
    pub fn sweep(&self, window: Duration) -> usize {
        let mut changed = 0;
        for mut entry in self.entries.iter_mut() {
            let stale = entry.last_probe.is_none_or(|at| at.elapsed() > window);
            if stale && entry.connected {
                entry.connected = false;
                changed += 1;
            }
        }
        changed
    }

    /// Zero the byte counters of one entry
    pub fn reset_counters(&self, network: &str, peer: &PeerKey) {
        if let Some(mut entry) = self.entries.get_mut(&(network.to_string(), *peer)) {
            entry.bytes_sent = 0;
            entry.bytes_received = 0;
        }
    }

    /// Copy of one entry
    #[must_use]
    pub fn get(&self, network: &str, peer: &PeerKey) -> Option<PeerMetric> {
        self.entries
            .get(&(network.to_string(), *peer))
            .map(|e| e.value().clone())
    }

    /// Drop one entry
    pub fn remove(&self, network: &str, peer: &PeerKey) {
        self.entries.remove(&(network.to_string(), *peer));
    }

    /// Drop entries of peers for which `keep` is false
    pub fn retain_peers(&self, keep: impl Fn(&PeerKey) -> bool) {
        self.entries.retain(|(_, peer), _| keep(peer));
    }

    /// Drop everything
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries exist
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Point-in-time copy of every entry, sorted by network then peer
    #[must_use]
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples: Vec<_> = self
            .entries
            .iter()
            .map(|e| {
                let (network, peer) = e.key();
                MetricSample {
                    network: network.clone(),
                    peer: *peer,
                    latency_ms: e.latency.map(|d| d.as_millis() as u64),
                    connected: e.connected,
                    bytes_sent: e.bytes_sent,
                    bytes_received: e.bytes_received,
                }
            })
            .collect();
        samples.sort_by(|a, b| (&a.network, a.peer).cmp(&(&b.network, b.peer)));
        samples
    }
}
