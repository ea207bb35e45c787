//! WireGuard device backed by the `wg` command.

use async_trait::async_trait;
use meshproxy_core::{PeerInfo, PeerKey, ProxyError, Result, WireGuardDevice};
use std::net::SocketAddr;
use std::time::{Duration, UNIX_EPOCH};
use tokio::process::Command;
use tracing::debug;

/// Reads and rewrites peers of one interface through `wg show` / `wg set`
#[derive(Debug, Clone)]
pub struct WgCommandDevice {
    interface: String,
    program: String,
}

impl WgCommandDevice {
    /// Device for `interface`, using `wg` from `PATH`
    #[must_use]
    pub fn new(interface: impl Into<String>) -> Self {
        Self {
            interface: interface.into(),
            program: "wg".to_string(),
        }
    }

    async fn run(&self, args: &[&str]) -> Result<String> {
        debug!("{} {}", self.program, args.join(" "));
        let output = Command::new(&self.program)
            .args(args)
            .output()
            .await
            .map_err(|e| ProxyError::Device(format!("{}: {e}", self.program).into()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProxyError::Device(
                format!("{} {}: {}", self.program, args.join(" "), stderr.trim()).into(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Find `key` in `wg show <iface> dump` output.
///
/// The first line describes the interface; every further line is
/// `public-key preshared-key endpoint allowed-ips latest-handshake rx tx keepalive`
/// separated by tabs.
#[must_use]
pub fn parse_dump(dump: &str, key: &PeerKey) -> Option<PeerInfo> {
    let wanted = key.to_base64();
    dump.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < 7 || fields[0] != wanted {
            return None;
        }

        let endpoint = fields[2].parse::<SocketAddr>().ok();
        let last_handshake = fields[4]
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));

        Some(PeerInfo {
            endpoint,
            last_handshake,
            rx_bytes: fields[5].parse().unwrap_or(0),
            tx_bytes: fields[6].parse().unwrap_or(0),
        })
    })
}

#[async_trait]
impl WireGuardDevice for WgCommandDevice {
    async fn get_peer(&self, key: &PeerKey) -> Result<PeerInfo> {
        let dump = self.run(&["show", &self.interface, "dump"]).await?;
        parse_dump(&dump, key).ok_or_else(|| ProxyError::PeerNotFound(key.short()))
    }

    async fn set_peer_endpoint(&self, key: &PeerKey, endpoint: SocketAddr) -> Result<()> {
        let key = key.to_base64();
        let endpoint = endpoint.to_string();
        self.run(&["set", &self.interface, "peer", &key, "endpoint", &endpoint])
            .await
            .map(|_| ())
    }
}
