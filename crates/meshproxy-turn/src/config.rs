//! TURN client configuration.

use crate::error::TurnError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use zeroize::Zeroizing;

/// Default allocation lifetime requested from the server
pub const DEFAULT_LIFETIME: Duration = Duration::from_secs(600);

/// Permissions expire after 5 minutes on the server; refresh before that
pub const PERMISSION_REFRESH: Duration = Duration::from_secs(240);

/// Configuration for one TURN session
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Server as `host:port`
    pub server: String,

    /// Account name, normally the host id
    pub username: String,

    /// Account password
    #[serde(with = "zeroizing_string")]
    pub password: Zeroizing<String>,

    /// Requested allocation lifetime
    #[serde(with = "duration_secs")]
    pub lifetime: Duration,

    /// Wait for one transaction response
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Retransmissions per transaction
    pub retries: u32,

    /// Local address for the relay socket
    pub bind_addr: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            server: String::new(),
            username: String::new(),
            password: Zeroizing::new(String::new()),
            lifetime: DEFAULT_LIFETIME,
            request_timeout: Duration::from_secs(3),
            retries: 3,
            bind_addr: "0.0.0.0:0".to_string(),
        }
    }
}

impl TurnConfig {
    /// Configuration for `server` with the given credentials
    #[must_use]
    pub fn new(
        server: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            server: server.into(),
            username: username.into(),
            password: Zeroizing::new(password.into()),
            ..Self::default()
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns `TurnError::Config` when the server is empty or timings are zero
    pub fn validate(&self) -> Result<(), TurnError> {
        if self.server.is_empty() {
            return Err(TurnError::Config("server must be set".to_string()));
        }
        if self.username.is_empty() {
            return Err(TurnError::Config("username must be set".to_string()));
        }
        if self.lifetime.as_secs() < 60 {
            return Err(TurnError::Config(
                "lifetime must be at least 60 seconds".to_string(),
            ));
        }
        if self.request_timeout.is_zero() {
            return Err(TurnError::Config("request_timeout must be > 0".to_string()));
        }
        if self.retries == 0 {
            return Err(TurnError::Config("retries must be > 0".to_string()));
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

mod zeroizing_string {
    use serde::{Deserialize, Deserializer, Serializer};
    use zeroize::Zeroizing;

    pub fn serialize<S: Serializer>(v: &Zeroizing<String>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(v)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Zeroizing<String>, D::Error> {
        Ok(Zeroizing::new(String::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TurnConfig::default();
        assert_eq!(config.lifetime, Duration::from_secs(600));
        assert_eq!(config.retries, 3);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = TurnConfig::new("turn.example.net:3478", "host-1", "pw");
        assert!(config.validate().is_ok());

        config.retries = 0;
        assert!(matches!(config.validate(), Err(TurnError::Config(_))));

        config.retries = 1;
        config.lifetime = Duration::from_secs(10);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_serde_uses_seconds() {
        let config = TurnConfig::new("turn.example.net:3478", "host-1", "pw");
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["lifetime"], 600);
        assert_eq!(json["request_timeout"], 3);

        let back: TurnConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back.password.as_str(), "pw");
        assert_eq!(back.lifetime, config.lifetime);
    }
}
