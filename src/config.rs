//! Configuration types for the tenant MQTT gateway
//!
//! Provides JSON-serializable configuration for the downstream listeners,
//! the shared upstream broker session, device topology limits and the
//! directory used to resolve credentials.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct GatewayConfig {
    /// Downstream listeners of the embedded broker
    pub listener: ListenerConfig,

    /// Upstream broker connection shared by the whole process
    pub upstream: UpstreamConfig,

    /// Device topology limits
    pub devices: DevicesConfig,

    /// Credential directory
    pub directory: DirectoryConfig,

    /// General settings
    pub general: GeneralConfig,
}

// ============================================================================
// Listener Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ListenerConfig {
    /// Raw MQTT (TCP) port, disabled when absent
    pub port: Option<u16>,

    /// MQTT over WebSocket port, disabled when absent
    pub ws_port: Option<u16>,

    /// Bind address for both listeners
    pub bind_ip: IpAddr,

    /// Largest accepted downstream packet (bytes)
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

impl ListenerConfig {
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.port.map(|port| SocketAddr::new(self.bind_ip, port))
    }

    pub fn ws_addr(&self) -> Option<SocketAddr> {
        self.ws_port.map(|port| SocketAddr::new(self.bind_ip, port))
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            port: Some(1883),
            ws_port: None,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_packet_size: default_max_packet_size(),
        }
    }
}

// ============================================================================
// Upstream Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct UpstreamConfig {
    /// Upstream broker host
    pub host: String,

    /// Upstream broker port
    pub port: u16,

    /// Fixed root segment prepended to every upstream topic
    pub root_topic: Option<String>,

    /// Session client id (generated when absent)
    pub client_id: Option<String>,

    /// Upstream username
    pub username: Option<String>,

    /// Upstream password
    pub password: Option<String>,

    /// Default retain flag for upstream publishes
    pub retain: bool,

    /// Keep alive interval in seconds
    pub keep_alive_secs: u64,

    /// Delay before the session retries after losing the connection
    pub reconnect_delay_ms: u64,

    /// Start with a clean session
    pub clean_session: bool,

    /// Capacity of the outgoing request queue
    pub request_capacity: usize,

    /// Largest upstream packet in either direction (bytes), fixed header
    /// included. Must leave room for the largest downstream publish plus
    /// the root prefix.
    #[serde(default = "default_upstream_max_packet_size")]
    pub max_packet_size: usize,
}

impl UpstreamConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.max(5))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            root_topic: None,
            client_id: None,
            username: None,
            password: None,
            retain: true,
            keep_alive_secs: default_keep_alive(),
            reconnect_delay_ms: default_reconnect_delay(),
            clean_session: true,
            request_capacity: default_request_capacity(),
            max_packet_size: default_upstream_max_packet_size(),
        }
    }
}

// ============================================================================
// Devices Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DevicesConfig {
    /// Number of numbered relays exposed next to the main sensor
    pub max_additional_relays_number: u32,
}

impl Default for DevicesConfig {
    fn default() -> Self {
        Self {
            max_additional_relays_number: default_max_relays(),
        }
    }
}

// ============================================================================
// Directory Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct DirectoryConfig {
    /// JSON file holding tenants, readers, users and access settings
    pub path: Option<PathBuf>,
}

// ============================================================================
// General Configuration
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct GeneralConfig {
    /// Log every forwarded and bridged packet (verbose)
    pub log_packets: bool,
}

// ============================================================================
// Default value functions
// ============================================================================

fn default_max_packet_size() -> usize {
    256 * 1024 // 256KB
}

fn default_upstream_max_packet_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_keep_alive() -> u64 {
    30
}

fn default_reconnect_delay() -> u64 {
    1000
}

fn default_request_capacity() -> usize {
    64
}

fn default_max_relays() -> u32 {
    3
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GatewayConfig::default();
        assert_eq!(config.listener.port, Some(1883));
        assert!(config.listener.ws_port.is_none());
        assert!(config.upstream.retain);
        assert_eq!(config.devices.max_additional_relays_number, 3);
        assert!(config.directory.path.is_none());
    }

    #[test]
    fn test_deserialize_config() {
        let json = r#"{
            "listener": {
                "port": 1884,
                "ws-port": 8083,
                "bind-ip": "127.0.0.1"
            },
            "upstream": {
                "host": "broker.internal",
                "port": 8883,
                "root-topic": "gateway",
                "username": "proxy",
                "password": "secret",
                "retain": false
            },
            "devices": {
                "max-additional-relays-number": 50
            },
            "directory": {
                "path": "/etc/gateway/directory.json"
            }
        }"#;

        let config: GatewayConfig = serde_json::from_str(json).expect("Failed to parse");
        assert_eq!(
            config.listener.tcp_addr(),
            Some("127.0.0.1:1884".parse().unwrap())
        );
        assert_eq!(
            config.listener.ws_addr(),
            Some("127.0.0.1:8083".parse().unwrap())
        );
        assert_eq!(config.upstream.host, "broker.internal");
        assert_eq!(config.upstream.root_topic.as_deref(), Some("gateway"));
        assert!(!config.upstream.retain);
        assert_eq!(config.upstream.keep_alive_secs, 30);
        assert!(config.upstream.max_packet_size > config.listener.max_packet_size);
        assert_eq!(config.devices.max_additional_relays_number, 50);
        assert!(config.directory.path.is_some());
    }

    #[test]
    fn test_upstream_packet_limit() {
        let json = r#"{ "upstream": { "max-packet-size": 65536 } }"#;
        let config: GatewayConfig = serde_json::from_str(json).expect("Failed to parse");
        assert_eq!(config.upstream.max_packet_size, 65536);
        assert_eq!(config.upstream.host, "localhost");
    }

    #[test]
    fn test_listener_disabled() {
        let json = r#"{ "listener": { "port": null } }"#;
        let config: GatewayConfig = serde_json::from_str(json).expect("Failed to parse");
        assert!(config.listener.tcp_addr().is_none());
        assert!(config.listener.ws_addr().is_none());
    }
}
