//! Configuration file for the meshproxy daemon.

use meshproxy_core::{PeerKey, ProxySettings};
use meshproxy_turn::TurnConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// meshproxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Host identity
    #[serde(default)]
    pub host: HostConfig,
    /// Proxy settings
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// TURN relay
    #[serde(default)]
    pub turn: TurnSection,
    /// Logging
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Host identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Control-plane host id, also the TURN username
    #[serde(default)]
    pub host_id: String,
    /// WireGuard public key (base64)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// WireGuard interface name
    #[serde(default = "default_interface")]
    pub interface: String,
}

/// Proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Local WireGuard listen port
    #[serde(default = "default_wg_listen_port")]
    pub wg_listen_port: u16,
    /// Shared proxy server port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    /// Proxy server bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,
    /// Probe interval in seconds
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_secs: u64,
    /// Read timeout in seconds
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    /// Use TURN for peers behind symmetric NAT
    #[serde(default = "default_true")]
    pub use_turn: bool,
}

/// TURN relay
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnSection {
    /// TURN server `host:port`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,
    /// Long-term credential password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Requested allocation lifetime in seconds
    #[serde(default = "default_lifetime_secs")]
    pub lifetime_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_interface() -> String {
    "wg0".to_string()
}

fn default_wg_listen_port() -> u16 {
    51820
}

fn default_listen_port() -> u16 {
    51722
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_keepalive_secs() -> u64 {
    20
}

fn default_io_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_lifetime_secs() -> u64 {
    600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            host_id: String::new(),
            public_key: None,
            interface: default_interface(),
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            wg_listen_port: default_wg_listen_port(),
            listen_port: default_listen_port(),
            bind_addr: default_bind_addr(),
            keepalive_secs: default_keepalive_secs(),
            io_timeout_secs: default_io_timeout_secs(),
            use_turn: true,
        }
    }
}

impl Default for TurnSection {
    fn default() -> Self {
        Self {
            server: None,
            password: None,
            lifetime_secs: default_lifetime_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("meshproxy/config.toml")
    }

    /// Parse the configured public key
    ///
    /// # Errors
    ///
    /// Returns an error if the key is missing or not a valid WireGuard key.
    pub fn public_key(&self) -> anyhow::Result<PeerKey> {
        let Some(text) = &self.host.public_key else {
            anyhow::bail!("host.public_key is not set");
        };
        Ok(text.parse()?)
    }

    /// Runtime settings for the proxy subsystem
    ///
    /// # Errors
    ///
    /// Returns an error if the bind address does not parse or a value is out
    /// of range.
    pub fn proxy_settings(&self) -> anyhow::Result<ProxySettings> {
        let bind: IpAddr = self
            .proxy
            .bind_addr
            .parse()
            .map_err(|_| anyhow::anyhow!("Invalid proxy.bind_addr: {}", self.proxy.bind_addr))?;
        let keepalive = Duration::from_secs(self.proxy.keepalive_secs);

        let settings = ProxySettings {
            wg_listen_port: self.proxy.wg_listen_port,
            proxy_listen_port: self.proxy.listen_port,
            proxy_bind_addr: bind,
            keepalive_interval: keepalive,
            io_timeout: Duration::from_secs(self.proxy.io_timeout_secs),
            metric_window: keepalive,
            use_turn: self.proxy.use_turn,
            ..ProxySettings::default()
        };
        settings.validate()?;
        Ok(settings)
    }

    /// TURN configuration, if a server is configured and TURN is enabled
    #[must_use]
    pub fn turn_config(&self) -> Option<TurnConfig> {
        if !self.proxy.use_turn {
            return None;
        }
        let server = self.turn.server.as_ref()?;
        let mut config = TurnConfig::new(
            server.clone(),
            self.host.host_id.clone(),
            self.turn.password.clone().unwrap_or_default(),
        );
        config.lifetime = Duration::from_secs(self.turn.lifetime_secs);
        Some(config)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if let Some(key) = &self.host.public_key {
            key.parse::<PeerKey>()
                .map_err(|e| anyhow::anyhow!("Invalid host.public_key: {e}"))?;
        }

        if self.host.interface.is_empty() {
            anyhow::bail!("host.interface must not be empty");
        }

        self.proxy_settings()?;

        if let Some(config) = self.turn_config() {
            config.validate()?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }
}
