//! Server configuration.
//!
//! Configuration can be loaded from:
//! - Environment variables (BANTER_*)
//! - TOML configuration file
//!
//! The configuration is read once at startup and never mutated at runtime.

use anyhow::{Context, Result};
use banter_core::{RegistryConfig, RoutingConfig};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port the framed TCP listener binds to.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Resource limits.
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Heartbeat and timeout configuration.
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,

    /// Routing policy.
    #[serde(default)]
    pub routing: RoutingOptions,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Enable the framed TCP listener.
    #[serde(default = "default_true")]
    pub tcp: bool,

    /// Enable the WebSocket listener.
    #[serde(default)]
    pub websocket: bool,

    /// Port the WebSocket listener binds to.
    #[serde(default = "default_websocket_port")]
    pub websocket_port: u16,
}

/// Resource limits configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Maximum number of concurrent connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum frame size in bytes.
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    /// Maximum number of rooms.
    #[serde(default = "default_max_rooms")]
    pub max_rooms: usize,

    /// Maximum rooms one session may join.
    #[serde(default = "default_max_rooms_per_session")]
    pub max_rooms_per_session: usize,

    /// Capacity of each ingress ring shard.
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,

    /// Capacity of each session's egress ring.
    #[serde(default = "default_egress_capacity")]
    pub egress_capacity: usize,

    /// Processing worker count (0 = one per available core).
    #[serde(default)]
    pub workers: usize,

    /// Per-session inbound message rate limit (messages per second).
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u64,
}

/// Heartbeat and timeout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Heartbeat interval advertised to clients, in milliseconds.
    #[serde(default = "default_heartbeat_interval")]
    pub interval_ms: u64,

    /// Idle timeout: a session with no read activity for this long is
    /// closed, in milliseconds.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,

    /// How long a new connection gets to complete the handshake,
    /// in milliseconds.
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

/// Routing policy options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingOptions {
    /// Whether senders receive their own room/broadcast messages by default.
    #[serde(default)]
    pub echo_to_sender: bool,

    /// Whether sessions receive presence events about themselves.
    #[serde(default)]
    pub notify_self_presence: bool,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_host() -> String {
    std::env::var("BANTER_HOST").unwrap_or_else(|_| "127.0.0.1".to_string())
}

fn default_port() -> u16 {
    std::env::var("BANTER_PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(7600)
}

fn default_true() -> bool {
    true
}

fn default_websocket_port() -> u16 {
    7601
}

fn default_max_connections() -> usize {
    100_000
}

fn default_max_frame_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_max_rooms() -> usize {
    10_000
}

fn default_max_rooms_per_session() -> usize {
    100
}

fn default_ingress_capacity() -> usize {
    4096
}

fn default_egress_capacity() -> usize {
    256
}

fn default_messages_per_second() -> u64 {
    200
}

fn default_heartbeat_interval() -> u64 {
    30_000 // 30 seconds
}

fn default_idle_timeout() -> u64 {
    60_000 // 60 seconds
}

fn default_handshake_timeout() -> u64 {
    5_000 // 5 seconds
}

fn default_metrics_port() -> u16 {
    9090
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            limits: LimitsConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            routing: RoutingOptions::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            tcp: true,
            websocket: false,
            websocket_port: default_websocket_port(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_frame_size: default_max_frame_size(),
            max_rooms: default_max_rooms(),
            max_rooms_per_session: default_max_rooms_per_session(),
            ingress_capacity: default_ingress_capacity(),
            egress_capacity: default_egress_capacity(),
            workers: 0,
            messages_per_second: default_messages_per_second(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_heartbeat_interval(),
            idle_timeout_ms: default_idle_timeout(),
            handshake_timeout_ms: default_handshake_timeout(),
        }
    }
}

impl Default for RoutingOptions {
    fn default() -> Self {
        Self {
            echo_to_sender: false,
            notify_self_presence: false,
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Config {
    /// Load configuration from file or defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed.
    pub fn load() -> Result<Self> {
        let config_paths = [
            "banter.toml",
            "/etc/banter/banter.toml",
            "~/.config/banter/banter.toml",
        ];

        for path in &config_paths {
            let expanded = shellexpand::tilde(path);
            if Path::new(expanded.as_ref()).exists() {
                return Self::from_file(expanded.as_ref());
            }
        }

        // Fall back to defaults with environment overrides
        Ok(Self::default())
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Get the socket address of the framed TCP listener.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid listener address {}:{}", self.host, self.port))
    }

    /// Get the socket address of the WebSocket listener.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a valid address.
    pub fn websocket_bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.transport.websocket_port)
            .parse()
            .with_context(|| {
                format!(
                    "Invalid listener address {}:{}",
                    self.host, self.transport.websocket_port
                )
            })
    }

    /// Number of processing workers to spawn.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        if self.limits.workers > 0 {
            self.limits.workers
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4)
        }
    }

    /// Derive the registry configuration.
    #[must_use]
    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            max_rooms: self.limits.max_rooms,
            max_rooms_per_session: self.limits.max_rooms_per_session,
            destroy_empty_rooms: true,
            egress_capacity: self.limits.egress_capacity,
        }
    }

    /// Derive the routing configuration.
    #[must_use]
    pub fn routing_config(&self) -> RoutingConfig {
        RoutingConfig {
            echo_to_sender: self.routing.echo_to_sender,
            notify_self_presence: self.routing.notify_self_presence,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.port, 7600);
        assert!(config.transport.tcp);
        assert!(!config.transport.websocket);
        assert!(config.worker_count() >= 1);
    }

    #[test]
    fn test_config_bind_addr() {
        let config = Config::default();
        let addr = config.bind_addr().unwrap();
        assert_eq!(addr.port(), 7600);
    }

    #[test]
    fn test_config_from_toml() {
        let toml_str = r#"
            host = "0.0.0.0"
            port = 9000

            [transport]
            websocket = true
            websocket_port = 9001

            [limits]
            max_connections = 50000
            egress_capacity = 128

            [routing]
            echo_to_sender = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.transport.websocket);
        assert_eq!(config.limits.max_connections, 50000);
        assert_eq!(config.registry_config().egress_capacity, 128);
        assert!(config.routing_config().echo_to_sender);
    }
}
