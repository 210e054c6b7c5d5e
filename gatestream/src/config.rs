//! Gateway configuration, loaded from TOML. Every field has a default.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dispatcher::EVENT_CHANNEL_CAPACITY;
use crate::error::{GateStreamError, Result};

/// Configuration for the gateway endpoint and its sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Bind host.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// WebSocket path of the secure endpoint.
    pub path: String,
    /// Bounded wait for `handshake.auth`.
    pub handshake_timeout_ms: u64,
    /// Per-request timeout for invokes.
    pub request_timeout_ms: u64,
    /// Replay guard timestamp window, either side of now.
    pub replay_tolerance_ms: u64,
    pub registration_token_ttl_secs: u64,
    pub pairing_code_ttl_secs: u64,
    /// Inbound frames above this size are malformed.
    pub max_frame_bytes: usize,
    /// Events retained per subscriber before the slowest one starts to lag.
    pub event_buffer: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 8787,
            path: "/gateway/agent/secure".into(),
            handshake_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            replay_tolerance_ms: 300_000,
            registration_token_ttl_secs: 86_400,
            pairing_code_ttl_secs: 300,
            max_frame_bytes: 1024 * 1024,
            event_buffer: EVENT_CHANNEL_CAPACITY,
        }
    }
}

impl GatewayConfig {
    /// Read and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text).map_err(|e| GateStreamError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(GateStreamError::Config("host must not be empty".into()));
        }
        if !self.path.starts_with('/') {
            return Err(GateStreamError::Config("path must start with '/'".into()));
        }
        for (name, value) in [
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("request_timeout_ms", self.request_timeout_ms),
            ("replay_tolerance_ms", self.replay_tolerance_ms),
            ("registration_token_ttl_secs", self.registration_token_ttl_secs),
            ("pairing_code_ttl_secs", self.pairing_code_ttl_secs),
            ("max_frame_bytes", self.max_frame_bytes as u64),
            ("event_buffer", self.event_buffer as u64),
        ] {
            if value == 0 {
                return Err(GateStreamError::Config(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn token_ttl_ms(&self) -> u64 {
        self.registration_token_ttl_secs.saturating_mul(1000)
    }

    pub fn pairing_ttl_ms(&self) -> u64 {
        self.pairing_code_ttl_secs.saturating_mul(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_is_all_defaults() {
        assert_eq!(GatewayConfig::from_toml_str("").unwrap(), GatewayConfig::default());
    }

    #[test]
    fn partial_override() {
        let cfg = GatewayConfig::from_toml_str("port = 9000\nrequest_timeout_ms = 500\n").unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.request_timeout(), Duration::from_millis(500));
        assert_eq!(cfg.path, "/gateway/agent/secure");
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9000");
    }

    #[test]
    fn zero_timeout_rejected() {
        assert!(matches!(
            GatewayConfig::from_toml_str("handshake_timeout_ms = 0"),
            Err(GateStreamError::Config(_))
        ));
    }

    #[test]
    fn zero_event_buffer_rejected() {
        assert!(matches!(
            GatewayConfig::from_toml_str("event_buffer = 0"),
            Err(GateStreamError::Config(_))
        ));
        assert_eq!(GatewayConfig::from_toml_str("event_buffer = 8").unwrap().event_buffer, 8);
    }

    #[test]
    fn relative_path_rejected() {
        assert!(GatewayConfig::from_toml_str("path = \"agent\"").is_err());
    }

    #[test]
    fn unknown_key_rejected() {
        assert!(GatewayConfig::from_toml_str("prot = 1").is_err());
    }

    #[test]
    fn ttl_conversion() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.token_ttl_ms(), 86_400_000);
        assert_eq!(cfg.pairing_ttl_ms(), 300_000);
    }
}
