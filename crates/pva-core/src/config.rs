//! Typed runtime configuration.
//!
//! Both sides share the discovery-plane options; the server adds the
//! listen/beacon surface and provider ordering. Construction is by struct
//! update from `Default`; the server binary maps CLI flags onto these
//! fields.

use std::net::IpAddr;
use std::time::Duration;

use pva_proto::{DEFAULT_BROADCAST_PORT, DEFAULT_SERVER_PORT};

/// Client-side configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Addresses searched in addition to (or instead of) the local
    /// broadcast list.
    pub address_list: Vec<std::net::SocketAddr>,
    /// When true, auto-discovered broadcast addresses are appended to
    /// [`ClientConfig::address_list`].
    pub auto_address_list: bool,
    /// UDP port searches are sent to when an address carries none.
    pub broadcast_port: u16,
    /// Largest array payload accepted per message, in bytes.
    pub receive_buffer_size: u32,
    /// Echo heartbeat interval; unresponsive after twice this.
    pub heartbeat_interval: Duration,
    /// Source addresses whose datagrams are dropped before parsing.
    pub ignore_address_list: Vec<IpAddr>,
    /// Origin-tag tap list: when non-empty, tagged datagrams are accepted
    /// only from these ingress interfaces.
    pub tap_address_list: Vec<IpAddr>,
    /// Preferred authentication plugin.
    pub auth_plugin: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address_list: Vec::new(),
            auto_address_list: true,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            receive_buffer_size: 1 << 16,
            heartbeat_interval: Duration::from_secs(15),
            ignore_address_list: Vec::new(),
            tap_address_list: Vec::new(),
            auth_plugin: "anonymous".into(),
        }
    }
}

/// Server-side configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Interfaces to bind; empty binds the wildcard address.
    pub listen_address_list: Vec<IpAddr>,
    /// TCP listen port; 0 picks an ephemeral port.
    pub server_port: u16,
    /// UDP search/beacon port; 0 picks an ephemeral port.
    pub broadcast_port: u16,
    /// Extra beacon destinations.
    pub beacon_address_list: Vec<std::net::SocketAddr>,
    /// Append auto-discovered broadcast addresses to the beacon list.
    pub auto_beacon_address_list: bool,
    /// Beacon emission period.
    pub beacon_period: Duration,
    /// Largest array payload accepted per message, in bytes.
    pub receive_buffer_size: u32,
    /// Provider lookup order; empty means registration order.
    pub provider_names: Vec<String>,
    /// Maximum concurrent TCP connections.
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address_list: Vec::new(),
            server_port: DEFAULT_SERVER_PORT,
            broadcast_port: DEFAULT_BROADCAST_PORT,
            beacon_address_list: Vec::new(),
            auto_beacon_address_list: true,
            beacon_period: Duration::from_secs(15),
            receive_buffer_size: 1 << 16,
            provider_names: Vec::new(),
            max_connections: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_use_protocol_ports() {
        let client = ClientConfig::default();
        let server = ServerConfig::default();
        assert_eq!(client.broadcast_port, 5076);
        assert_eq!(server.server_port, 5075);
        assert_eq!(server.broadcast_port, 5076);
        assert!(client.auto_address_list);
    }
}
