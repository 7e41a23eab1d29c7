//! Client and tunnel configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::tunnel::DEFAULT_RECEIVE_TIMEOUT;

/// Top-level configuration for a protocol client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Transport settings shared by all tunnel variants.
    pub tunnel: TunnelConfig,
    /// Keep-alive period: a `sync` is sent this often while connected.
    pub keepalive_interval_ms: u64,
}

/// Transport settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    /// Close the tunnel with an upstream timeout if nothing is received
    /// for this long.
    pub receive_timeout_ms: u64,
    /// Period of the long-poll progress fallback timer.
    pub poll_interval_ms: u64,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            tunnel: TunnelConfig::default(),
            keepalive_interval_ms: 5000,
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT.as_millis() as u64,
            poll_interval_ms: 30,
        }
    }
}

impl ClientConfig {
    /// Keep-alive period as a [`Duration`].
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    /// Load from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }
}

impl TunnelConfig {
    /// Receive timeout as a [`Duration`].
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Poll fallback period as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let cfg = ClientConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("receive_timeout_ms"));
        assert!(text.contains("keepalive_interval_ms"));
    }

    #[test]
    fn roundtrip_config() {
        let cfg = ClientConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        let parsed: ClientConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.tunnel.receive_timeout_ms, 15_000);
        assert_eq!(parsed.keepalive_interval_ms, 5000);
    }

    #[test]
    fn partial_config_uses_defaults() {
        let parsed: ClientConfig = toml::from_str("[tunnel]\nreceive_timeout_ms = 250\n").unwrap();
        assert_eq!(parsed.tunnel.receive_timeout_ms, 250);
        assert_eq!(parsed.tunnel.poll_interval_ms, 30);
        assert_eq!(parsed.keepalive_interval_ms, 5000);
    }
}
