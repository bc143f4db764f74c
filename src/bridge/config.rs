// Bridge server configuration

//! # Bridge Configuration
//!
//! [`BridgeConfig`] carries the ingress options: bind address, body-size
//! ceiling, and HTTP timeouts. Environment variables override the enabled
//! flag, host, and port, so a supervising process can relocate the ingress
//! without touching configuration files:
//!
//! - `LATTICE_BRIDGE_ENABLED` - `true`/`false` (also `1`/`0`, `yes`/`no`, `on`/`off`)
//! - `LATTICE_BRIDGE_HOST`
//! - `LATTICE_BRIDGE_PORT` - 1..65535

use std::time::Duration;

use tracing::warn;

/// Environment variable overriding `enabled`
pub const ENV_ENABLED: &str = "LATTICE_BRIDGE_ENABLED";
/// Environment variable overriding `host`
pub const ENV_HOST: &str = "LATTICE_BRIDGE_HOST";
/// Environment variable overriding `port`
pub const ENV_PORT: &str = "LATTICE_BRIDGE_PORT";

/// Options recognized by the bridge ingress
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub enabled: bool,
    pub host: String,
    pub port: u16,
    /// Request bodies above this size are rejected with 413
    pub max_body_bytes: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 7611,
            max_body_bytes: 1024 * 1024,
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl BridgeConfig {
    /// Defaults plus environment overrides
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply `LATTICE_BRIDGE_*` overrides onto this configuration
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(raw) = std::env::var(ENV_ENABLED) {
            match parse_bool(&raw) {
                Some(enabled) => self.enabled = enabled,
                None => warn!(value = %raw, "ignoring unparseable {}", ENV_ENABLED),
            }
        }
        if let Ok(raw) = std::env::var(ENV_HOST) {
            let host = raw.trim();
            if !host.is_empty() {
                self.host = host.to_string();
            }
        }
        if let Ok(raw) = std::env::var(ENV_PORT) {
            match raw.trim().parse::<u16>() {
                Ok(port) if port > 0 => self.port = port,
                _ => warn!(value = %raw, "ignoring unparseable {}", ENV_PORT),
            }
        }
        self
    }

    /// `host:port` bind address
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
